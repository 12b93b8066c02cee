//! Bounded subprocess execution.
//!
//! Every external collaborator (scheduler CLI, cloud CLI, configuration
//! executor) is driven through `run`, which captures output and enforces
//! a deadline. A child that outlives its deadline is killed.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the child was terminated by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout followed by stderr, for log capture.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} did not finish within {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
}

/// Run `cmd` to completion, killing it if it exceeds `timeout`.
pub async fn run(mut cmd: Command, timeout: Duration) -> Result<CommandOutput, ExecError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(%program, args = ?cmd.as_std().get_args().collect::<Vec<_>>(), "running command");

    let child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => return Err(ExecError::Spawn { program, source }),
        Err(_) => return Err(ExecError::TimedOut { program, timeout }),
    };

    let result = CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!(%program, status = result.status, "command finished");
    Ok(result)
}
