//! Service facade consumed by the I/O front-end.
//!
//! One entry point per external operation: `execute` for code submissions,
//! `health` and `sessions` for introspection, `shutdown` for coordinated
//! teardown. The front-end stays a thin wrapper — all decisions live here
//! or below.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::Config;
use crate::error::PoolError;
use crate::executor::{Coordinator, ExecutionResult};
use crate::kernel::KernelLauncher;
use crate::session::{SessionSnapshot, SessionStatus, SessionTable};
use crate::validate;

/// An inbound execution request.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    /// Owner identity sessions and quotas are keyed by.
    pub owner_id: String,
    /// Code to execute.
    pub code: String,
    /// Working directory for the owner's kernel.
    pub working_dir: PathBuf,
    /// Execution timeout in seconds, clamped to [1, 300]. Defaults to 60.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Health summary for liveness checks.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub version: &'static str,
}

/// The daemon's application core.
pub struct Service {
    table: Arc<SessionTable>,
    coordinator: Coordinator,
    introspection_enabled: bool,
}

impl Service {
    /// Build the service. Call `start` afterwards to run the reaper.
    pub fn new(config: Config, launcher: Arc<dyn KernelLauncher>) -> Self {
        let coordinator = Coordinator::new(config.poll_interval);
        Self {
            table: Arc::new(SessionTable::new(config, launcher)),
            coordinator,
            introspection_enabled: introspection_from_env(),
        }
    }

    /// Start background work (the idle reaper).
    pub async fn start(&self) {
        self.table.start_reaper().await;
    }

    /// Validate, resolve a session, and run one code submission.
    ///
    /// Execution-level failures come back inside the `ExecutionResult`;
    /// an `Err` means the code never ran (rejection, quota, startup) or
    /// the kernel channel was lost mid-run.
    pub async fn execute(&self, req: &ExecuteRequest) -> Result<ExecutionResult, PoolError> {
        info!(owner = %req.owner_id, code_len = req.code.len(), "Execute request");

        validate::check(&req.code)
            .map_err(|reason| PoolError::ValidationRejected { reason })?;

        let session = self
            .table
            .resolve_or_create(&req.owner_id, &req.working_dir)
            .await?;

        // One borrower at a time: a second execution against a busy
        // session is rejected rather than queued behind the first.
        let Some(mut conn) = session.try_borrow() else {
            return Err(PoolError::SessionBusy {
                owner: req.owner_id.clone(),
            });
        };
        session.set_status(SessionStatus::Busy);

        let timeout = Config::effective_exec_timeout(req.timeout);
        let outcome = self.coordinator.run(conn.as_mut(), &req.code, timeout).await;
        drop(conn);

        match outcome {
            Ok(result) => {
                session.set_status(SessionStatus::Ready);
                info!(
                    owner = %req.owner_id,
                    success = result.success,
                    execution_time = result.execution_time,
                    "Execution completed"
                );
                Ok(result)
            }
            Err(e) => {
                // The channel is gone; the session cannot serve anyone.
                error!(owner = %req.owner_id, error = %e, "Execution fault, destroying session");
                self.table.destroy(&req.owner_id).await;
                Err(e)
            }
        }
    }

    /// Liveness summary.
    pub async fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok",
            active_sessions: self.table.active_count().await,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Per-owner session snapshot. `None` when introspection is disabled
    /// (production deployments).
    pub async fn sessions(&self) -> Option<HashMap<String, SessionSnapshot>> {
        if !self.introspection_enabled {
            return None;
        }
        Some(self.table.snapshot().await)
    }

    /// Destroy the owner's session, if any.
    pub async fn destroy_session(&self, owner_id: &str) {
        self.table.destroy(owner_id).await;
    }

    /// Coordinated shutdown: stops the reaper, then destroys every session.
    pub async fn shutdown(&self) {
        info!("Shutting down session pool");
        self.table.destroy_all().await;
        info!("Shutdown complete");
    }
}

/// Introspection defaults on, and is forced off in production.
fn introspection_from_env() -> bool {
    std::env::var("KERNEL_POOL_ENV").map_or(true, |v| v != "production")
}
