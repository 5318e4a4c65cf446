//! Error taxonomy for the session pool.
//!
//! Execution-level failures (runtime errors, timeouts inside a run) are
//! never represented here — they live inside `ExecutionResult` with
//! `success = false`. These variants cover everything that prevents a
//! result record from being produced at all.

use thiserror::Error;

/// Operational failures of the session pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Code failed pre-flight validation; no session was contacted.
    #[error("code validation failed: {reason}")]
    ValidationRejected { reason: String },

    /// Owner already holds the maximum permitted concurrent sessions.
    #[error("owner {owner} has reached maximum session limit ({limit})")]
    QuotaExceeded { owner: String, limit: usize },

    /// A newly started kernel did not become ready in time.
    #[error("kernel failed to start within {seconds}s")]
    BackendStartTimeout { seconds: u64 },

    /// The kernel process could not be started at all.
    #[error("failed to start kernel: {0}")]
    BackendStartFailed(#[source] anyhow::Error),

    /// The session's kernel handle is already driving another execution.
    #[error("session for owner {owner} is busy with another execution")]
    SessionBusy { owner: String },

    /// The kernel channel was lost mid-execution; no result can be assembled.
    #[error("coordinator fault: {0}")]
    CoordinatorFault(#[from] anyhow::Error),
}

impl PoolError {
    /// Whether the caller should treat this as a client-side rejection
    /// (as opposed to a server-side operational failure).
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::ValidationRejected { .. })
    }
}
