//! Stdin/stdout pipe transport to a kernel subprocess.
//!
//! Owns a child process started in the session's working directory and
//! communicates via length-prefixed JSON on the child's stdin (requests)
//! and stdout (message stream).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::{debug, warn};

use super::protocol::{KernelMessage, KernelRequest};
use super::{recv_message, send_message, KernelConnection, KernelLauncher, LaunchError};

/// Connection to a kernel subprocess over stdin/stdout pipes.
///
/// The kernel is spawned once and kept alive for the session lifetime.
pub struct StdioKernel {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    alive: bool,
    next_submission: u64,
}

impl StdioKernel {
    /// Spawn a kernel process in `working_dir` and wait for its `Ready`
    /// message for at most `ready_timeout`.
    ///
    /// On timeout the partially started process is killed before the
    /// error propagates.
    pub async fn spawn(
        exec_path: &str,
        working_dir: &Path,
        ready_timeout: Duration,
    ) -> Result<Self, LaunchError> {
        debug!(exec = %exec_path, dir = %working_dir.display(), "Spawning kernel process");

        let mut child = tokio::process::Command::new(exec_path)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn kernel: {exec_path}"))?;

        let stdin = child
            .stdin
            .take()
            .context("Failed to take kernel stdin")?;
        let mut stdout = child
            .stdout
            .take()
            .context("Failed to take kernel stdout")?;

        let ready = tokio::time::timeout(ready_timeout, recv_message(&mut stdout)).await;
        let ready_bytes = match ready {
            Ok(result) => result.context("Failed to read kernel Ready message")?,
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(LaunchError::ReadyTimeout(ready_timeout));
            }
        };

        let ready_msg: KernelMessage = serde_json::from_slice(&ready_bytes)
            .context("Failed to parse kernel Ready message")?;
        match ready_msg {
            KernelMessage::Ready => debug!("Kernel is ready"),
            other => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(anyhow::anyhow!("Expected Ready message, got: {other:?}").into());
            }
        }

        Ok(Self {
            child,
            stdin,
            stdout,
            alive: true,
            next_submission: 0,
        })
    }
}

#[async_trait]
impl KernelConnection for StdioKernel {
    async fn submit(&mut self, code: &str) -> Result<String> {
        anyhow::ensure!(self.alive, "Kernel process is not alive");

        self.next_submission += 1;
        let id = self.next_submission.to_string();

        let req = KernelRequest::Execute {
            id: id.clone(),
            code: code.to_string(),
        };
        let bytes = serde_json::to_vec(&req).context("Failed to serialize submission")?;
        send_message(&mut self.stdin, &bytes)
            .await
            .context("Failed to send submission to kernel")?;

        Ok(id)
    }

    async fn recv(&mut self, poll: Duration) -> Result<Option<KernelMessage>> {
        anyhow::ensure!(self.alive, "Kernel process is not alive");

        match tokio::time::timeout(poll, recv_message(&mut self.stdout)).await {
            // Poll window elapsed with nothing to read — expected, retry.
            Err(_) => Ok(None),
            Ok(Ok(bytes)) => {
                let msg: KernelMessage = serde_json::from_slice(&bytes)
                    .context("Failed to parse kernel message")?;
                Ok(Some(msg))
            }
            Ok(Err(e)) => Err(e.context("Failed to read from kernel")),
        }
    }

    async fn kill(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;

        // Offer a graceful shutdown, then reap the process regardless.
        if let Ok(bytes) = serde_json::to_vec(&KernelRequest::Shutdown) {
            if let Err(e) = send_message(&mut self.stdin, &bytes).await {
                warn!(error = %e, "Graceful kernel shutdown failed, killing");
            }
        }

        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
        debug!("Kernel process shut down");
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Launcher that spawns `StdioKernel` subprocesses.
#[derive(Debug, Clone)]
pub struct StdioKernelLauncher {
    exec_path: String,
}

impl StdioKernelLauncher {
    /// Create a launcher for the given kernel executable.
    pub const fn new(exec_path: String) -> Self {
        Self { exec_path }
    }
}

#[async_trait]
impl KernelLauncher for StdioKernelLauncher {
    async fn launch(
        &self,
        working_dir: &Path,
        ready_timeout: Duration,
    ) -> Result<Box<dyn KernelConnection>, LaunchError> {
        let kernel = StdioKernel::spawn(&self.exec_path, working_dir, ready_timeout).await?;
        Ok(Box::new(kernel))
    }
}
