//! Types for test runs: what to run and what came out.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::classify::FailureSignal;
use crate::device::DeviceDescriptor;
use crate::pipeline::{PipelineError, Step};

/// Device family a run targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        })
    }
}

/// The single test a run executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Root of the app project
    pub project_dir: PathBuf,

    /// Application id (Android); unused on iOS
    pub package: String,

    /// Test class (Android); unused on iOS
    pub suite: String,

    /// Test method (Android) or `Class/method` identifier (iOS)
    pub test: String,
}

impl TestSpec {
    pub fn android(
        project_dir: impl Into<PathBuf>,
        package: impl Into<String>,
        suite: impl Into<String>,
        test: impl Into<String>,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            package: package.into(),
            suite: suite.into(),
            test: test.into(),
        }
    }

    pub fn ios(project_dir: impl Into<PathBuf>, test: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            package: String::new(),
            suite: String::new(),
            test: test.into(),
        }
    }

    /// Reject blank fields the platform needs and a missing project directory.
    pub fn validate(&self, platform: Platform) -> Result<(), PipelineError> {
        let mut required = vec![
            ("project directory", self.project_dir.as_os_str().to_string_lossy().into_owned()),
            ("test case", self.test.clone()),
        ];
        if platform == Platform::Android {
            required.push(("package", self.package.clone()));
            required.push(("test suite", self.suite.clone()));
        }
        if let Some((name, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(PipelineError::InvalidSpec(format!("{} must not be blank", name)));
        }
        if !self.project_dir.is_dir() {
            return Err(PipelineError::ProjectNotFound(self.project_dir.clone()));
        }
        Ok(())
    }

    /// Short label for session names and logs
    pub fn label(&self) -> String {
        if self.suite.is_empty() {
            self.test.replace('/', "_")
        } else {
            let class = self.suite.rsplit('.').next().unwrap_or(&self.suite);
            format!("{}_{}", class, self.test)
        }
    }
}

/// How a pipeline step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

/// Record of one pipeline step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,

    /// Error text or skip reason
    pub detail: Option<String>,

    pub duration_ms: u64,
}

/// Result of a complete test run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Whether the test passed
    pub success: bool,

    /// Combined test runner output, verbatim
    pub output: String,

    /// Failure details worth showing instead of the whole output
    pub error_excerpt: Option<String>,

    /// Classifier signals that fired (empty on success)
    pub signals: Vec<FailureSignal>,

    /// Frames extracted from the recording
    pub frame_count: usize,

    /// Directory holding the frames; the caller owns and deletes it
    pub frames_dir: Option<PathBuf>,

    /// Device the test ran on
    pub device: Option<DeviceDescriptor>,

    /// Every step, in execution order
    pub steps: Vec<StepRecord>,
}

impl RunResult {
    /// The text to show for a failed run: the excerpt if there is one,
    /// otherwise the whole output.
    pub fn failure_text(&self) -> &str {
        match &self.error_excerpt {
            Some(excerpt) if !excerpt.trim().is_empty() => excerpt,
            _ => &self.output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_blank_fields() {
        let dir = TempDir::new().unwrap();
        let spec = TestSpec::android(dir.path(), "com.example", "  ", "signIn");
        let err = spec.validate(Platform::Android).unwrap_err();
        assert!(err.to_string().contains("test suite"));

        // iOS does not need package or suite.
        let spec = TestSpec::ios(dir.path(), "LoginTests/testSignIn");
        assert!(spec.validate(Platform::Ios).is_ok());
    }

    #[test]
    fn test_validate_missing_project() {
        let spec = TestSpec::android("/definitely/not/here", "com.example", "LoginTest", "signIn");
        let err = spec.validate(Platform::Android).unwrap_err();
        assert!(matches!(err, PipelineError::ProjectNotFound(_)));
    }

    #[test]
    fn test_label() {
        let spec = TestSpec::android("/p", "com.example", "com.example.ui.LoginTest", "signIn");
        assert_eq!(spec.label(), "LoginTest_signIn");
        assert_eq!(TestSpec::ios("/p", "LoginTests/testSignIn").label(), "LoginTests_testSignIn");
    }

    #[test]
    fn test_failure_text_falls_back_to_output() {
        let mut result = RunResult {
            success: false,
            output: "full output".to_string(),
            error_excerpt: Some("  ".to_string()),
            signals: vec![FailureSignal::TestFailedPhrase],
            frame_count: 0,
            frames_dir: None,
            device: None,
            steps: vec![],
        };
        assert_eq!(result.failure_text(), "full output");
        result.error_excerpt = Some("stack".to_string());
        assert_eq!(result.failure_text(), "stack");
    }
}
