//! Subprocess handle - owns the child and its stdout pipe.
//!
//! The daemon is the sole reader of the pipe. Reads are cancellable so
//! retire/stand-down flags are observed within one turn plus the read
//! timeout.

use crate::{AgentLaunch, StreamEvent};
use minion_core::ProviderError;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

/// A running provider subprocess plus its line-framed event stream.
pub struct ProviderHandle {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    pub pid: Option<u32>,
}

impl ProviderHandle {
    /// Spawn `argv` with the launch environment, piping stdout. When
    /// `stdin_prompt` is given the prompt is written and stdin closed.
    pub async fn spawn(
        argv: Vec<String>,
        launch: &AgentLaunch,
        stdin_prompt: Option<String>,
    ) -> Result<ProviderHandle, ProviderError> {
        let program = argv.first().cloned().ok_or_else(|| ProviderError::SpawnFailed {
            command: "<empty>".to_string(),
            reason: "empty argv".to_string(),
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd.stdin(if stdin_prompt.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if let Some(dir) = &launch.project_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| ProviderError::SpawnFailed {
            command: program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        debug!(command = %program, ?pid, "provider spawned");

        if let Some(prompt) = stdin_prompt {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await?;
            }
        }

        let stdout = child.stdout.take().ok_or_else(|| ProviderError::SpawnFailed {
            command: program,
            reason: "stdout pipe missing".to_string(),
        })?;

        Ok(ProviderHandle {
            child,
            lines: BufReader::new(stdout).lines(),
            pid,
        })
    }

    /// Next event, or `None` at end of stream. Errors with `StreamTimeout`
    /// when no output arrives within the window.
    pub async fn next_event(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<StreamEvent>, ProviderError> {
        match tokio::time::timeout(timeout, self.lines.next_line()).await {
            Err(_) => Err(ProviderError::StreamTimeout {
                timeout_secs: timeout.as_secs(),
            }),
            Ok(Err(e)) => Err(ProviderError::Io(e)),
            Ok(Ok(None)) => Ok(None),
            Ok(Ok(Some(line))) => Ok(Some(StreamEvent::from_line(line))),
        }
    }

    /// Kill the subprocess. Used for interrupts and timeouts.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill provider subprocess");
        }
    }

    /// Wait for exit and return the code (-1 when terminated by signal).
    pub async fn wait(&mut self) -> Result<i32, ProviderError> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}
