//! Build, install, run and clean up one UI test.
//!
//! Each platform pipeline is a fixed sequence of [`Step`]s. A fatal step
//! aborts the run with [`PipelineError::Step`]; a best-effort step logs a
//! warning and the run carries on. A failing test is not an error: it is a
//! [`RunResult`] with `success == false`.

pub mod android;
pub mod ios;

pub use android::{AndroidOptions, AndroidPipeline};
pub use ios::{IosOptions, IosPipeline};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::command::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use crate::device::DeviceError;
use crate::frames::ExtractError;
use crate::runner::{StepRecord, StepStatus};

/// Pipeline states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    BuildApp,
    BuildTestArtifact,
    EnsureDevice,
    InstallApp,
    InstallTestArtifact,
    StartRecording,
    Execute,
    RetrieveRecording,
    ExtractFrames,
    DeleteLocalRecording,
    UninstallApp,
    UninstallTestArtifact,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::BuildApp => "build_app",
            Step::BuildTestArtifact => "build_test_artifact",
            Step::EnsureDevice => "ensure_device",
            Step::InstallApp => "install_app",
            Step::InstallTestArtifact => "install_test_artifact",
            Step::StartRecording => "start_recording",
            Step::Execute => "execute",
            Step::RetrieveRecording => "retrieve_recording",
            Step::ExtractFrames => "extract_frames",
            Step::DeleteLocalRecording => "delete_local_recording",
            Step::UninstallApp => "uninstall_app",
            Step::UninstallTestArtifact => "uninstall_test_artifact",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("`{command}` failed: {detail}")]
    Tool { command: String, detail: String },

    #[error("{0}")]
    Missing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StepError {
    pub(crate) fn tool(spec: &CommandSpec, output: &CommandOutput) -> Self {
        StepError::Tool {
            command: spec.display(),
            detail: output.failure_summary(),
        }
    }
}

/// Errors that end a run without a result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid test spec: {0}")]
    InvalidSpec(String),

    #[error("project directory not found: {}", .0.display())]
    ProjectNotFound(PathBuf),

    #[error("could not prepare session directory: {0}")]
    Session(#[source] std::io::Error),

    #[error("step {step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: StepError,
    },
}

impl PipelineError {
    /// The step that failed, if the run got that far.
    pub fn step(&self) -> Option<Step> {
        match self {
            PipelineError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Ordered record of step outcomes for one run.
#[derive(Debug, Default)]
pub(crate) struct StepLog {
    records: Vec<StepRecord>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, step: Step, status: StepStatus, detail: Option<String>, started: Instant) {
        self.records.push(StepRecord {
            step,
            status,
            detail,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    /// Run a step whose failure ends the run.
    pub async fn fatal<T, E, F>(&mut self, step: Step, fut: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StepError>,
    {
        info!(%step, "step started");
        let started = Instant::now();
        match fut.await {
            Ok(value) => {
                self.push(step, StepStatus::Ok, None, started);
                Ok(value)
            }
            Err(err) => {
                let err = err.into();
                error!(%step, %err, "step failed");
                self.push(step, StepStatus::Failed, Some(err.to_string()), started);
                Err(PipelineError::Step { step, source: err })
            }
        }
    }

    /// Run a step whose failure is logged and otherwise ignored.
    pub async fn best_effort<T, E, F>(&mut self, step: Step, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StepError>,
    {
        info!(%step, "step started");
        let started = Instant::now();
        match fut.await {
            Ok(value) => {
                self.push(step, StepStatus::Ok, None, started);
                Some(value)
            }
            Err(err) => {
                let err = err.into();
                warn!(%step, %err, "best-effort step failed, continuing");
                self.push(step, StepStatus::Failed, Some(err.to_string()), started);
                None
            }
        }
    }

    pub fn skip(&mut self, step: Step, reason: &str) {
        info!(%step, reason, "step skipped");
        self.push(step, StepStatus::Skipped, Some(reason.to_string()), Instant::now());
    }

    pub fn into_records(self) -> Vec<StepRecord> {
        self.records
    }
}

/// Run `spec` and treat a non-zero exit as a step failure.
pub(crate) async fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput, StepError> {
    let output = runner.run(spec).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(StepError::tool(spec, &output))
    }
}

/// Files directly inside `dir` with extension `ext`, sorted by name.
pub(crate) fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == ext).unwrap_or(false))
        .collect();
    found.sort();
    found
}

/// Delete a local file or directory, treating "already gone" as success.
pub(crate) fn remove_path(path: &Path) -> Result<(), StepError> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Reply, ScriptedRunner};

    #[tokio::test]
    async fn test_fatal_records_and_wraps() {
        let mut log = StepLog::new();
        let ok: Result<u8, StepError> = Ok(1);
        assert_eq!(log.fatal(Step::BuildApp, async { ok }).await.unwrap(), 1);

        let err = log
            .fatal(Step::InstallApp, async { Err::<(), _>(StepError::Missing("no apk".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some(Step::InstallApp));
        assert!(err.to_string().contains("install_app"));

        let records = log.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_best_effort_continues() {
        let mut log = StepLog::new();
        let value = log
            .best_effort(Step::UninstallApp, async { Err::<(), _>(StepError::Missing("gone".into())) })
            .await;
        assert!(value.is_none());
        log.skip(Step::ExtractFrames, "no recording");

        let records = log.into_records();
        assert_eq!(records[0].status, StepStatus::Failed);
        assert_eq!(records[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_run_checked_rejects_nonzero_exit() {
        let runner = ScriptedRunner::new();
        runner.on("gradle", &[], Reply::failed(1, "BUILD FAILED"));
        let err = run_checked(&runner, &CommandSpec::new("gradle").arg("assembleDebug"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gradle assembleDebug"));
        assert!(err.to_string().contains("BUILD FAILED"));
    }

    #[test]
    fn test_step_serializes_snake_case() {
        let json = serde_json::to_string(&Step::InstallTestArtifact).unwrap();
        assert_eq!(json, "\"install_test_artifact\"");
    }

    #[test]
    fn test_remove_path_tolerates_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(remove_path(&dir.path().join("missing.mp4")).is_ok());
        let nested = dir.path().join("Result.xcresult");
        std::fs::create_dir_all(nested.join("Data")).unwrap();
        remove_path(&nested).unwrap();
        assert!(!nested.exists());
    }
}
