//! Execution coordination over the kernel message stream.
//!
//! Drives one code submission through the kernel's typed output stream and
//! folds everything it sees into a single `ExecutionResult`. Execution-level
//! failures (runtime errors, timeouts) never escape as errors — they are
//! recorded in the result with `success = false`. Only the loss of the
//! kernel channel itself propagates, as `PoolError::CoordinatorFault`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::PoolError;
use crate::kernel::{KernelConnection, KernelMessage};

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// False if any error message was observed or the deadline fired.
    pub success: bool,
    /// Ordered stream-output fragments, joined and trimmed.
    pub output: String,
    /// Ordered error/traceback fragments, joined and trimmed.
    pub error: String,
    /// Textual form of the last evaluated expression, if one was produced.
    pub result: Option<String>,
    /// Base64-encoded plot images, in arrival order.
    pub plots: Vec<String>,
    /// Wall-clock duration of the whole attempt, in seconds.
    pub execution_time: f64,
}

/// Drives submissions against kernel connections.
#[derive(Debug, Clone)]
pub struct Coordinator {
    poll_interval: Duration,
}

impl Coordinator {
    /// Create a coordinator polling the message stream at `poll_interval`.
    pub const fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Submit `code` and consume the output stream until the kernel goes
    /// idle or `timeout` elapses.
    ///
    /// A timeout stops the coordinator from waiting further; the kernel is
    /// left running whatever it was running.
    pub async fn run(
        &self,
        conn: &mut dyn KernelConnection,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, PoolError> {
        let start = Instant::now();
        let deadline = start + timeout;

        let submission = conn
            .submit(code)
            .await
            .map_err(|e| PoolError::CoordinatorFault(e.context("failed to submit code")))?;
        debug!(submission = %submission, code_len = code.len(), "Submitted code");

        let mut output_parts: Vec<String> = Vec::new();
        let mut error_parts: Vec<String> = Vec::new();
        let mut result = None;
        let mut plots = Vec::new();
        let mut success = true;

        loop {
            if Instant::now() >= deadline {
                error_parts.push(format!("Execution timeout ({}s)", timeout.as_secs()));
                success = false;
                break;
            }

            match conn.recv(self.poll_interval).await {
                // Poll window elapsed — keep waiting against the deadline.
                Ok(None) => {}
                Ok(Some(msg)) => {
                    if msg.is_idle() {
                        break;
                    }
                    match msg {
                        KernelMessage::Stream { text } => output_parts.push(text),
                        KernelMessage::Error {
                            ename,
                            evalue,
                            traceback,
                        } => {
                            let trace = if traceback.is_empty() {
                                format!("{ename}: {evalue}")
                            } else {
                                traceback.join("\n")
                            };
                            error_parts.push(trace);
                            success = false;
                        }
                        KernelMessage::ExecuteResult { data } => {
                            if let Some(text) = data.text_plain {
                                result = Some(text);
                            }
                        }
                        KernelMessage::Display { data } => {
                            if let Some(png) = data.image_png {
                                plots.push(png);
                            } else if let Some(text) = data.text_plain {
                                output_parts.push(text);
                            }
                        }
                        // Ready and non-idle status changes carry no output.
                        KernelMessage::Ready | KernelMessage::Status { .. } => {}
                    }
                }
                Err(e) => {
                    if !conn.is_alive() || is_channel_loss(&e) {
                        error!(submission = %submission, error = %e, "Kernel channel lost");
                        return Err(PoolError::CoordinatorFault(
                            e.context("kernel channel lost mid-execution"),
                        ));
                    }
                    warn!(submission = %submission, error = %e, "Error receiving kernel message");
                }
            }
        }

        let execution_time = start.elapsed().as_secs_f64();
        debug!(
            submission = %submission,
            success,
            execution_time,
            "Execution finished"
        );

        Ok(ExecutionResult {
            success,
            output: output_parts.join("\n").trim().to_string(),
            error: error_parts.join("\n").trim().to_string(),
            result,
            plots,
            execution_time,
        })
    }
}

/// Whether a receive error means the channel itself is gone (as opposed to
/// a transient read problem worth retrying).
fn is_channel_loss(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some_and(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
            )
        })
    })
}
