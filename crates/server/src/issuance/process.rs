//! Running the issuance tool to completion.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Why a child process didn't produce an exit status.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed while waiting for process: {0}")]
    Wait(#[source] io::Error),

    #[error("process did not finish within {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Everything a finished process left behind.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    /// Stderr as text, trimmed.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Spawn `cmd` with stdin closed and both output pipes captured, drain the
/// pipes concurrently while waiting for exit, and give up after `timeout`.
///
/// On timeout the child is killed before returning.
pub async fn run_to_completion(
    mut cmd: Command,
    timeout: Duration,
) -> Result<ProcessOutput, ProcessError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    debug!(pid = ?child.id(), "Spawned child process");

    let finished = tokio::time::timeout(timeout, async {
        tokio::join!(child.wait(), drain(stdout), drain(stderr))
    })
    .await;

    match finished {
        Ok((status, stdout, stderr)) => {
            let status = status.map_err(ProcessError::Wait)?;
            debug!(status = %status, "Child process exited");
            Ok(ProcessOutput {
                status,
                stdout: stdout.map_err(ProcessError::Wait)?,
                stderr: stderr.map_err(ProcessError::Wait)?,
            })
        }
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "Child process timed out, killing it"
            );
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill timed out child process");
            }
            Err(ProcessError::TimedOut(timeout))
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
