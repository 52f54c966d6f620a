//! External tool invocation.
//!
//! Every collaborator (gradle, adb, emulator, xcodebuild, simctl, ffmpeg,
//! ffprobe) is reached through [`CommandRunner`]. Output is captured
//! verbatim and a non-zero exit is reported in [`CommandOutput`], never as
//! an error: whether a failing exit code matters is the caller's decision.

pub mod process;
pub mod scripted;

pub use process::ProcessRunner;
pub use scripted::{Reply, ScriptedRunner};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that prevent a command from producing output at all.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Specification for a command to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory (inherits ours when `None`)
    pub cwd: Option<PathBuf>,
    /// Upper bound on run time (unbounded when `None`)
    pub timeout: Option<Duration>,
    /// Spawned process outlives its handle
    #[serde(default)]
    pub detached: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
            detached: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Let a spawned process keep running after its handle is dropped.
    pub fn detach(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Shell-like rendering for log lines.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                out.push_str(&format!("'{}'", arg));
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

/// Output from a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None when killed by a signal)
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// A failed run with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way a terminal would interleave them
    /// when one stream is mostly quiet.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }

    /// Short description of a failure for error messages.
    pub fn failure_summary(&self) -> String {
        let code = self
            .exit_code
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        let tail = last_lines(&self.combined(), 20);
        if tail.is_empty() {
            code
        } else {
            format!("{}\n{}", code, tail)
        }
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// A process left running while other work happens.
#[async_trait]
pub trait BackgroundProcess: Send {
    /// OS process id, if still known.
    fn id(&self) -> Option<u32>;

    /// Ask the process to finish (SIGINT), wait up to `grace`, then kill it.
    async fn interrupt(&mut self, grace: Duration) -> Result<(), CommandError>;
}

/// Runs external tools.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Start a process and return without waiting for it.
    ///
    /// Dropping the handle kills the process unless the spec is
    /// [detached](CommandSpec::detach).
    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn BackgroundProcess>, CommandError>;
}
