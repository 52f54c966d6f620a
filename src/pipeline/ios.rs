//! iOS run: `xcodebuild` build-for-testing / test-without-building on a
//! simulator, recorded with `simctl io recordVideo`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{PipelineError, Step, StepError, StepLog, files_with_extension, remove_path, run_checked};
use crate::classify;
use crate::command::{BackgroundProcess, CommandRunner, CommandSpec};
use crate::device::{DeviceLifecycle, IosSimulator};
use crate::frames::FrameExtractor;
use crate::runner::{Platform, RunResult, TestSpec};
use crate::session::Session;

pub const DEFAULT_CONFIGURATION: &str = "Debug";

const LOCAL_RECORDING: &str = "recording.mp4";
const DERIVED_DATA: &str = "DerivedData";
const RESULT_BUNDLE: &str = "Result.xcresult";
const RUNNER_SUFFIX: &str = "-Runner.app";
const PLIST_BUDDY: &str = "/usr/libexec/PlistBuddy";
const RECORDER_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct IosOptions {
    /// Scheme to build; the project's file stem when unset
    pub scheme: Option<String>,
    /// UI test bundle target; `<scheme>UITests` when unset
    pub ui_test_target: Option<String>,
    pub configuration: String,
    /// Upper bound on the build
    pub build_timeout: Option<Duration>,
}

impl Default for IosOptions {
    fn default() -> Self {
        Self {
            scheme: None,
            ui_test_target: None,
            configuration: DEFAULT_CONFIGURATION.to_string(),
            build_timeout: None,
        }
    }
}

/// Xcode container to build from. A workspace wins over a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XcodeContainer {
    Workspace(PathBuf),
    Project(PathBuf),
}

impl XcodeContainer {
    pub fn locate(dir: &Path) -> Option<Self> {
        if let Some(ws) = files_with_extension(dir, "xcworkspace").into_iter().next() {
            return Some(XcodeContainer::Workspace(ws));
        }
        files_with_extension(dir, "xcodeproj")
            .into_iter()
            .next()
            .map(XcodeContainer::Project)
    }

    fn path(&self) -> &Path {
        match self {
            XcodeContainer::Workspace(p) | XcodeContainer::Project(p) => p,
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            XcodeContainer::Workspace(_) => "-workspace",
            XcodeContainer::Project(_) => "-project",
        }
    }

    /// File name without extension, the conventional scheme name
    pub fn stem(&self) -> String {
        self.path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// What the build step settled on
struct BuildPlan {
    container: XcodeContainer,
    scheme: String,
    derived_data: PathBuf,
}

/// Bundle ids of what got installed
#[derive(Default)]
struct Installed {
    app: Option<String>,
    runner: Option<String>,
}

pub struct IosPipeline {
    runner: Arc<dyn CommandRunner>,
    simulator: IosSimulator,
    extractor: FrameExtractor,
    options: IosOptions,
    pub xcodebuild: String,
    pub xcrun: String,
}

impl IosPipeline {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        simulator: IosSimulator,
        extractor: FrameExtractor,
        options: IosOptions,
    ) -> Self {
        Self {
            runner,
            simulator,
            extractor,
            options,
            xcodebuild: "xcodebuild".to_string(),
            xcrun: "xcrun".to_string(),
        }
    }

    /// Identifier the device lease must be held for (the selected UDID)
    pub fn device_id(&self) -> &str {
        self.simulator.udid()
    }

    /// Run one UI test end to end.
    ///
    /// The caller must hold the lease for [`Self::device_id`].
    pub async fn run(&self, spec: &TestSpec, session: Session) -> Result<RunResult, PipelineError> {
        spec.validate(Platform::Ios)?;
        session.init("ios").map_err(PipelineError::Session)?;
        info!(test = %spec.test, udid = %self.device_id(), session = %session.id, "ios run");

        let mut log = StepLog::new();
        let plan = log
            .fatal(Step::BuildApp, self.build(&spec.project_dir, session.scratch_path(DERIVED_DATA)))
            .await?;
        let device = log.fatal(Step::EnsureDevice, self.simulator.ensure_ready()).await?;
        let installed = log.fatal(Step::InstallApp, self.install(&plan)).await?;

        let video_path = session.scratch_path(LOCAL_RECORDING);
        let result_bundle = session.scratch_path(RESULT_BUNDLE);
        let recorder = log
            .best_effort(Step::StartRecording, self.start_recording(&video_path))
            .await;
        let output = match log
            .fatal(Step::Execute, self.execute(spec, &plan, &result_bundle))
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if let Some(mut recorder) = recorder {
                    let _ = recorder.interrupt(RECORDER_GRACE).await;
                }
                return Err(err);
            }
        };

        let video = match recorder {
            Some(recorder) => {
                log.best_effort(Step::RetrieveRecording, stop_recording(recorder, &video_path))
                    .await
            }
            None => {
                log.skip(Step::RetrieveRecording, "recorder was not started");
                None
            }
        };

        let frame_count = match &video {
            Some(video) => log
                .best_effort(Step::ExtractFrames, self.extractor.extract(video, &session.frames_dir()))
                .await
                .map(|extraction| extraction.frame_count)
                .unwrap_or(0),
            None => {
                log.skip(Step::ExtractFrames, "no recording");
                0
            }
        };
        log.best_effort(Step::DeleteLocalRecording, async {
            remove_path(&video_path)?;
            remove_path(&result_bundle)
        })
        .await;

        match &installed.app {
            Some(bundle) => {
                log.best_effort(Step::UninstallApp, self.uninstall(bundle)).await;
            }
            None => log.skip(Step::UninstallApp, "bundle id unknown"),
        }
        match &installed.runner {
            Some(bundle) => {
                log.best_effort(Step::UninstallTestArtifact, self.uninstall(bundle))
                    .await;
            }
            None => log.skip(Step::UninstallTestArtifact, "bundle id unknown"),
        }

        let verdict = classify::verdict(&output);
        let frames_dir = session.finish(frame_count);
        info!(success = verdict.success, frame_count, "ios run finished");
        Ok(RunResult {
            success: verdict.success,
            output,
            // xcodebuild output has no delimited failure block; callers show all of it.
            error_excerpt: None,
            signals: verdict.signals,
            frame_count,
            frames_dir,
            device: Some(device),
            steps: log.into_records(),
        })
    }

    fn destination(&self) -> String {
        format!("platform=iOS Simulator,id={}", self.simulator.udid())
    }

    fn xcodebuild_command(&self, action: &str, plan: &BuildPlan) -> CommandSpec {
        CommandSpec::new(&self.xcodebuild)
            .arg(action)
            .arg(plan.container.flag())
            .arg(plan.container.path().display().to_string())
            .args(["-scheme", plan.scheme.as_str()])
            .args(["-configuration", self.options.configuration.as_str()])
            .arg("-destination")
            .arg(self.destination())
            .arg("-derivedDataPath")
            .arg(plan.derived_data.display().to_string())
    }

    async fn build(&self, project: &Path, derived_data: PathBuf) -> Result<BuildPlan, StepError> {
        let container = XcodeContainer::locate(project).ok_or_else(|| {
            StepError::Missing(format!("no .xcworkspace or .xcodeproj in {}", project.display()))
        })?;
        let scheme = self.options.scheme.clone().unwrap_or_else(|| container.stem());
        let plan = BuildPlan {
            container,
            scheme,
            derived_data,
        };

        let mut spec = self.xcodebuild_command("build-for-testing", &plan).cwd(project);
        if let Some(timeout) = self.options.build_timeout {
            spec = spec.timeout(timeout);
        }
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(plan)
    }

    fn products_dir(&self, plan: &BuildPlan) -> PathBuf {
        plan.derived_data
            .join("Build")
            .join("Products")
            .join(format!("{}-iphonesimulator", self.options.configuration))
    }

    async fn install(&self, plan: &BuildPlan) -> Result<Installed, StepError> {
        let products = self.products_dir(plan);
        let bundles = files_with_extension(&products, "app");
        let (runners, apps): (Vec<_>, Vec<_>) = bundles
            .into_iter()
            .partition(|p| p.to_string_lossy().ends_with(RUNNER_SUFFIX));
        let app = apps
            .into_iter()
            .next()
            .ok_or_else(|| StepError::Missing(format!("no .app in {}", products.display())))?;

        let spec = CommandSpec::new(&self.xcrun)
            .args(["simctl", "install", self.simulator.udid()])
            .arg(app.display().to_string());
        run_checked(self.runner.as_ref(), &spec).await?;

        let mut installed = Installed {
            app: self.bundle_id(&app).await,
            ..Installed::default()
        };
        if let Some(runner_app) = runners.first() {
            installed.runner = self.bundle_id(runner_app).await;
        }
        Ok(installed)
    }

    async fn bundle_id(&self, bundle: &Path) -> Option<String> {
        let spec = CommandSpec::new(PLIST_BUDDY)
            .args(["-c", "Print :CFBundleIdentifier"])
            .arg(bundle.join("Info.plist").display().to_string());
        match self.runner.run(&spec).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                Some(output.stdout.trim().to_string())
            }
            Ok(output) => {
                warn!(bundle = %bundle.display(), detail = %output.failure_summary(), "could not read bundle id");
                None
            }
            Err(err) => {
                warn!(bundle = %bundle.display(), %err, "could not read bundle id");
                None
            }
        }
    }

    async fn start_recording(&self, video: &Path) -> Result<Box<dyn BackgroundProcess>, StepError> {
        let spec = CommandSpec::new(&self.xcrun)
            .args(["simctl", "io", self.simulator.udid(), "recordVideo", "--codec=h264", "--force"])
            .arg(video.display().to_string());
        Ok(self.runner.spawn(&spec).await?)
    }

    async fn execute(&self, spec: &TestSpec, plan: &BuildPlan, result_bundle: &Path) -> Result<String, StepError> {
        let target = self
            .options
            .ui_test_target
            .clone()
            .unwrap_or_else(|| format!("{}UITests", plan.scheme));
        let command = self
            .xcodebuild_command("test-without-building", plan)
            .cwd(&spec.project_dir)
            .arg("-resultBundlePath")
            .arg(result_bundle.display().to_string())
            .arg(format!("-only-testing:{}", only_testing(&target, &spec.test)));

        let output = self.runner.run(&command).await?;
        debug!(exit_code = ?output.exit_code, "xcodebuild test finished");
        Ok(output.combined())
    }

    async fn uninstall(&self, bundle: &str) -> Result<(), StepError> {
        let spec = CommandSpec::new(&self.xcrun).args(["simctl", "uninstall", self.simulator.udid(), bundle]);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }
}

async fn stop_recording(mut recorder: Box<dyn BackgroundProcess>, video: &Path) -> Result<PathBuf, StepError> {
    recorder.interrupt(RECORDER_GRACE).await?;
    match std::fs::metadata(video) {
        Ok(meta) if meta.len() > 0 => Ok(video.to_path_buf()),
        _ => Err(StepError::Missing(format!("recording not found at {}", video.display()))),
    }
}

/// `-only-testing` identifier. A test already naming its target is kept as is.
pub fn only_testing(target: &str, test: &str) -> String {
    if test.matches('/').count() >= 2 {
        test.to_string()
    } else {
        format!("{}/{}", target, test)
    }
}
