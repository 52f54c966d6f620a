//! Real child processes via `tokio::process`.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

use super::{BackgroundProcess, CommandError, CommandOutput, CommandRunner, CommandSpec};

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(command = %spec.display(), "running");

        let mut cmd = Self::command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A cancelled run (signal, timeout) must not leave the tool behind.
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let output = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| CommandError::Timeout {
                    program: spec.program.clone(),
                    timeout: limit,
                })??,
            None => child.wait_with_output().await?,
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };
        trace!(
            command = %spec.program,
            exit_code = ?result.exit_code,
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "finished"
        );
        Ok(result)
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn BackgroundProcess>, CommandError> {
        debug!(command = %spec.display(), "starting in background");

        let mut cmd = Self::command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // A cancelled run must not leave a recorder attached to the device.
            .kill_on_drop(!spec.detached);

        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        Ok(Box::new(ChildProcess {
            program: spec.program.clone(),
            child,
        }))
    }
}

/// Handle to a background child.
struct ChildProcess {
    program: String,
    child: Child,
}

#[async_trait]
impl BackgroundProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn interrupt(&mut self, grace: Duration) -> Result<(), CommandError> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };

        send_interrupt(pid);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(program = %self.program, ?status, "background process exited");
                Ok(())
            }
            Err(_) => {
                warn!(program = %self.program, ?grace, "did not exit after SIGINT, killing");
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        debug!(pid, %err, "SIGINT delivery failed");
    }
}

#[cfg(not(unix))]
fn send_interrupt(pid: u32) {
    debug!(pid, "no SIGINT on this platform; relying on kill after grace");
}
