//! Kernel connection layer.
//!
//! Provides the `KernelConnection` trait, the `KernelLauncher` seam the
//! session table spawns kernels through, and length-prefixed JSON framing
//! helpers shared by transports.

pub mod protocol;
pub mod stdio;

#[cfg(test)]
pub(crate) mod testing;

pub use protocol::{DisplayPayload, ExecutionState, KernelMessage, KernelRequest};
pub use stdio::{StdioKernel, StdioKernelLauncher};

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

/// Maximum message size (64 MB). Safety valve against malformed messages.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Abstraction over the channel to one live kernel process.
///
/// Exactly one execution drives a connection at a time; the session table
/// enforces this with a per-session lock, so implementations do not need
/// to support interleaved submissions.
#[async_trait]
pub trait KernelConnection: Send + Sync {
    /// Submit code for execution. Returns the submission's correlation id.
    async fn submit(&mut self, code: &str) -> Result<String>;

    /// Read the next message from the kernel's output stream.
    ///
    /// Returns `Ok(None)` when `poll` elapses with nothing to read — an
    /// expected condition, not a fault. Any `Err` is a real channel failure.
    async fn recv(&mut self, poll: Duration) -> Result<Option<KernelMessage>>;

    /// Force-terminate the kernel process. Best effort; never blocks long.
    async fn kill(&mut self);

    /// Whether the kernel process is believed to be alive.
    fn is_alive(&self) -> bool;
}

/// Why a kernel launch failed.
///
/// The ready-timeout case is split out so the session table can surface it
/// as a distinct operational failure.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The kernel did not report ready before the bootstrap deadline.
    /// The partially started process has already been force-terminated.
    #[error("kernel did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    /// Anything else (spawn failure, malformed ready handshake, ...).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Seam through which the session table starts kernel processes.
///
/// The production implementation spawns a subprocess; tests substitute
/// scripted connections.
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    /// Start a kernel bound to `working_dir` and wait for its Ready
    /// message for at most `ready_timeout`.
    async fn launch(
        &self,
        working_dir: &Path,
        ready_timeout: Duration,
    ) -> Result<Box<dyn KernelConnection>, LaunchError>;
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Message too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
