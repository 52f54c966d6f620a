//! Android run: Gradle build, emulator, `am instrument`, `screenrecord`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{PipelineError, Step, StepError, StepLog, files_with_extension, remove_path, run_checked};
use crate::classify::{self, InstrumentationReport};
use crate::command::{BackgroundProcess, CommandRunner, CommandSpec};
use crate::device::{AndroidEmulator, DeviceLifecycle};
use crate::frames::FrameExtractor;
use crate::runner::{Platform, RunResult, TestSpec};
use crate::session::Session;

pub const DEFAULT_MODULE: &str = "app";
pub const DEFAULT_TEST_RUNNER: &str = "androidx.test.runner.AndroidJUnitRunner";

const REMOTE_RECORDING: &str = "/sdcard/device-harness.mp4";
const LOCAL_RECORDING: &str = "recording.mp4";
/// screenrecord refuses limits above three minutes
const RECORD_TIME_LIMIT: &str = "180";
const RECORDER_GRACE: Duration = Duration::from_secs(5);

/// Project layout and runner knobs
#[derive(Debug, Clone)]
pub struct AndroidOptions {
    /// Gradle module holding the app (`app` in most projects)
    pub module: String,
    /// Instrumentation runner class
    pub test_runner: String,
    /// Upper bound on each Gradle build
    pub build_timeout: Option<Duration>,
    /// Pause after stopping screenrecord so it can finalize the file
    pub recording_settle: Duration,
}

impl Default for AndroidOptions {
    fn default() -> Self {
        Self {
            module: DEFAULT_MODULE.to_string(),
            test_runner: DEFAULT_TEST_RUNNER.to_string(),
            build_timeout: None,
            recording_settle: Duration::from_secs(1),
        }
    }
}

pub struct AndroidPipeline {
    runner: Arc<dyn CommandRunner>,
    emulator: AndroidEmulator,
    extractor: FrameExtractor,
    options: AndroidOptions,
}

impl AndroidPipeline {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        emulator: AndroidEmulator,
        extractor: FrameExtractor,
        options: AndroidOptions,
    ) -> Self {
        Self {
            runner,
            emulator,
            extractor,
            options,
        }
    }

    /// Identifier the device lease must be held for
    pub fn device_id(&self) -> &str {
        self.emulator.serial()
    }

    /// Run one instrumentation test end to end.
    ///
    /// The caller must hold the lease for [`Self::device_id`].
    pub async fn run(&self, spec: &TestSpec, session: Session) -> Result<RunResult, PipelineError> {
        spec.validate(Platform::Android)?;
        session.init("android").map_err(PipelineError::Session)?;
        info!(package = %spec.package, suite = %spec.suite, test = %spec.test, session = %session.id, "android run");

        let mut log = StepLog::new();
        log.fatal(Step::BuildApp, self.gradle(&spec.project_dir, "assembleDebug")).await?;
        log.fatal(Step::BuildTestArtifact, self.gradle(&spec.project_dir, "assembleDebugAndroidTest"))
            .await?;
        let device = log.fatal(Step::EnsureDevice, self.emulator.ensure_ready()).await?;

        let apk_root = spec
            .project_dir
            .join(&self.options.module)
            .join("build")
            .join("outputs")
            .join("apk");
        log.fatal(Step::InstallApp, self.install(&apk_root.join("debug"))).await?;
        log.fatal(Step::InstallTestArtifact, self.install(&apk_root.join("androidTest").join("debug")))
            .await?;

        let recorder = log.best_effort(Step::StartRecording, self.start_recording()).await;
        let output = match log.fatal(Step::Execute, self.execute(spec)).await {
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
                let local = session.scratch_path(LOCAL_RECORDING);
                log.best_effort(Step::RetrieveRecording, self.retrieve_recording(recorder, &local))
                    .await
            }
            None => {
                log.skip(Step::RetrieveRecording, "recorder was not started");
                None
            }
        };

        let mut frame_count = 0;
        match &video {
            Some(video) => {
                frame_count = log
                    .best_effort(Step::ExtractFrames, self.extractor.extract(video, &session.frames_dir()))
                    .await
                    .map(|extraction| extraction.frame_count)
                    .unwrap_or(0);
                log.best_effort(Step::DeleteLocalRecording, async { remove_path(video) })
                    .await;
            }
            None => {
                log.skip(Step::ExtractFrames, "no recording");
                log.skip(Step::DeleteLocalRecording, "no recording");
            }
        }

        log.best_effort(Step::UninstallApp, self.uninstall(&spec.package)).await;
        log.best_effort(Step::UninstallTestArtifact, self.uninstall(&test_package(&spec.package)))
            .await;

        let report = InstrumentationReport::parse(&output);
        if report.is_structured() {
            debug!(tests = report.tests.len(), failures = report.has_failures(), "instrumentation report");
        }
        let verdict = classify::verdict(&output);
        let error_excerpt = (!verdict.success).then(|| {
            let excerpt = classify::extract_error_excerpt(&output);
            if excerpt.is_empty() { output.clone() } else { excerpt }
        });

        let frames_dir = session.finish(frame_count);
        info!(success = verdict.success, frame_count, "android run finished");
        Ok(RunResult {
            success: verdict.success,
            output,
            error_excerpt,
            signals: verdict.signals,
            frame_count,
            frames_dir,
            device: Some(device),
            steps: log.into_records(),
        })
    }

    async fn gradle(&self, project: &Path, task: &str) -> Result<(), StepError> {
        let mut spec = CommandSpec::new(gradle_program(project))
            .arg(task)
            .cwd(project);
        if let Some(timeout) = self.options.build_timeout {
            spec = spec.timeout(timeout);
        }
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn install(&self, apk_dir: &Path) -> Result<(), StepError> {
        let apk = files_with_extension(apk_dir, "apk")
            .into_iter()
            .next()
            .ok_or_else(|| StepError::Missing(format!("no APK in {}", apk_dir.display())))?;

        let spec = self
            .emulator
            .adb_command(["install", "-r", "-t"])
            .arg(apk.display().to_string());
        let output = run_checked(self.runner.as_ref(), &spec).await?;
        // Older adb versions exit 0 and report the failure in text.
        if output.combined().contains("Failure [") {
            return Err(StepError::tool(&spec, &output));
        }
        Ok(())
    }

    async fn start_recording(&self) -> Result<Box<dyn BackgroundProcess>, StepError> {
        let spec = self
            .emulator
            .adb_command(["shell", "screenrecord", "--time-limit", RECORD_TIME_LIMIT, REMOTE_RECORDING]);
        Ok(self.runner.spawn(&spec).await?)
    }

    /// Run the test and return its combined output whatever the exit code.
    async fn execute(&self, spec: &TestSpec) -> Result<String, StepError> {
        let target = format!("{}#{}", qualified_suite(&spec.package, &spec.suite), spec.test);
        let instrumentation = format!("{}/{}", test_package(&spec.package), self.options.test_runner);
        let command = self
            .emulator
            .adb_command(["shell", "am", "instrument", "-w", "-r", "-e", "class"])
            .arg(target)
            .arg(instrumentation);

        let output = self.runner.run(&command).await?;
        debug!(exit_code = ?output.exit_code, "instrumentation finished");
        Ok(output.combined())
    }

    async fn retrieve_recording(
        &self,
        mut recorder: Box<dyn BackgroundProcess>,
        local: &Path,
    ) -> Result<PathBuf, StepError> {
        // Signal the on-device process first; stopping the adb client alone
        // can leave the mp4 without its index.
        let stop = self.emulator.adb_command(["shell", "pkill", "-INT", "screenrecord"]);
        if let Err(err) = self.runner.run(&stop).await {
            debug!(%err, "could not signal screenrecord");
        }
        recorder.interrupt(RECORDER_GRACE).await?;
        tokio::time::sleep(self.options.recording_settle).await;

        let pull = self
            .emulator
            .adb_command(["pull", REMOTE_RECORDING])
            .arg(local.display().to_string());
        run_checked(self.runner.as_ref(), &pull).await?;

        let remove = self.emulator.adb_command(["shell", "rm", "-f", REMOTE_RECORDING]);
        match self.runner.run(&remove).await {
            Ok(output) if !output.success() => debug!(detail = %output.failure_summary(), "remote recording not removed"),
            Err(err) => debug!(%err, "remote recording not removed"),
            Ok(_) => {}
        }

        if !local.is_file() {
            return Err(StepError::Missing(format!("recording not found at {}", local.display())));
        }
        Ok(local.to_path_buf())
    }

    async fn uninstall(&self, package: &str) -> Result<(), StepError> {
        let spec = self.emulator.adb_command(["uninstall", package]);
        let output = run_checked(self.runner.as_ref(), &spec).await?;
        if output.combined().contains("Failure") {
            return Err(StepError::tool(&spec, &output));
        }
        Ok(())
    }
}

/// The project's Gradle wrapper if it has one, otherwise `gradle` from PATH.
pub fn gradle_program(project: &Path) -> String {
    let wrapper = project.join("gradlew");
    if wrapper.is_file() {
        wrapper.display().to_string()
    } else {
        "gradle".to_string()
    }
}

/// Application id of the instrumentation APK
pub fn test_package(package: &str) -> String {
    format!("{}.test", package)
}

/// Fully qualify a bare class name with the app package.
pub fn qualified_suite(package: &str, suite: &str) -> String {
    if suite.contains('.') {
        suite.to_string()
    } else {
        format!("{}.{}", package, suite)
    }
}
