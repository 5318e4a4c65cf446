//! Session lifecycle management.
//!
//! The `SessionTable` owns every live kernel session, keyed by exact owner
//! identity. It enforces the per-owner quota and the idle timeout, runs the
//! environment bootstrap in freshly created sessions, and hosts the
//! background reaper that evicts idle sessions. Creation and destruction
//! funnel exclusively through this module; the execution coordinator only
//! ever borrows a session's kernel handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::PoolError;
use crate::executor::Coordinator;
use crate::kernel::{KernelConnection, KernelLauncher, LaunchError};

/// Environment bootstrap run once in every new session. Preloads the data
/// and plotting stack, forces a non-interactive rendering backend, and
/// configures CJK-tolerant fonts. Failures are logged but never fatal.
pub const BOOTSTRAP_CODE: &str = r"
import polars as pl
import pandas as pd
import matplotlib
matplotlib.use('Agg')
import matplotlib.pyplot as plt
import jieba
import os
import sys
from pathlib import Path

plt.rcParams['font.sans-serif'] = ['SimHei', 'DejaVu Sans']
plt.rcParams['axes.unicode_minus'] = False

print('Environment initialized successfully')
";

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Ready,
    Busy,
    Expired,
    Terminated,
}

/// One live kernel session owned by a single owner.
pub struct Session {
    /// Owner this session belongs to.
    pub owner_id: String,

    /// Unique identity of this session. A reused session keeps its id; a
    /// replacement after expiry gets a fresh one.
    pub session_id: String,

    /// Directory the kernel process was started in.
    pub working_directory: PathBuf,

    /// Creation time (wall clock, for introspection).
    pub created_at: SystemTime,

    /// Last resolve-or-create touch; sole input to idle eviction.
    last_activity: std::sync::Mutex<Instant>,

    status: std::sync::Mutex<SessionStatus>,
    alive: AtomicBool,

    /// The kernel handle. Exactly one execution borrows it at a time.
    conn: Mutex<Box<dyn KernelConnection>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner_id", &self.owner_id)
            .field("session_id", &self.session_id)
            .field("working_directory", &self.working_directory)
            .field("created_at", &self.created_at)
            .field("status", &self.status())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(
        owner_id: &str,
        session_id: String,
        working_directory: &Path,
        conn: Box<dyn KernelConnection>,
    ) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            session_id,
            working_directory: working_directory.to_path_buf(),
            created_at: SystemTime::now(),
            last_activity: std::sync::Mutex::new(Instant::now()),
            status: std::sync::Mutex::new(SessionStatus::Ready),
            alive: AtomicBool::new(true),
            conn: Mutex::new(conn),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SessionStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        *self
            .status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }

    /// Whether the kernel process is believed alive.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Borrow the kernel handle for one execution, without waiting.
    ///
    /// Returns `None` when another execution is already driving it.
    pub fn try_borrow(
        &self,
    ) -> Option<tokio::sync::MutexGuard<'_, Box<dyn KernelConnection>>> {
        self.conn.try_lock().ok()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .elapsed()
    }

    /// Force-terminate the kernel. Waits for any in-flight execution to
    /// release the handle first; termination itself is best effort.
    async fn kill(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.set_status(SessionStatus::Terminated);
        self.conn.lock().await.kill().await;
    }
}

/// Read-only view of one session for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    /// Unix seconds.
    pub created_at: u64,
    pub working_directory: PathBuf,
    pub alive: bool,
}

/// Authoritative owner → session mapping.
///
/// Thread-safe: `RwLock` around the map, a per-owner lock registry so the
/// whole resolve-or-create sequence is mutually exclusive per owner, and a
/// `Mutex` per kernel handle.
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<Session>>>,

    /// Per-owner locks guarding resolve-or-create. Entries are kept for
    /// the table's lifetime so two concurrent resolves can never hold
    /// different locks for the same owner.
    owner_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,

    launcher: Arc<dyn KernelLauncher>,
    config: Config,
    next_session_id: AtomicU64,
    reaper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SessionTable {
    /// Create a table that starts kernels through `launcher`.
    pub fn new(config: Config, launcher: Arc<dyn KernelLauncher>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            owner_locks: RwLock::new(HashMap::new()),
            launcher,
            config,
            next_session_id: AtomicU64::new(0),
            reaper: Mutex::new(None),
        }
    }

    /// Return the owner's live session, or create one.
    ///
    /// A fresh session within the idle window is reused with its activity
    /// timestamp refreshed and without contacting the kernel. A stale one
    /// is destroyed synchronously first. The whole sequence holds the
    /// owner's lock, so concurrent calls for the same owner cannot race
    /// into duplicate creation.
    pub async fn resolve_or_create(
        &self,
        owner_id: &str,
        working_dir: &Path,
    ) -> Result<Arc<Session>, PoolError> {
        let owner_lock = self.owner_lock(owner_id).await;
        let _guard = owner_lock.lock().await;

        let existing = self.sessions.read().await.get(owner_id).cloned();
        if let Some(session) = existing {
            if session.idle_for() < self.config.idle_timeout {
                session.touch();
                debug!(owner = %owner_id, session = %session.session_id, "Reusing session");
                return Ok(session);
            }
            info!(owner = %owner_id, "Session expired, creating a new one");
            session.set_status(SessionStatus::Expired);
            self.destroy(owner_id).await;
        }

        // Exact owner identity, never prefix matching: an owner id that is
        // a prefix of another's must not see the other's sessions.
        let held = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.owner_id == owner_id)
            .count();
        if held >= self.config.max_sessions_per_owner {
            return Err(PoolError::QuotaExceeded {
                owner: owner_id.to_string(),
                limit: self.config.max_sessions_per_owner,
            });
        }

        tokio::fs::create_dir_all(working_dir).await.map_err(|e| {
            PoolError::BackendStartFailed(anyhow::Error::new(e).context(format!(
                "failed to create working directory {}",
                working_dir.display()
            )))
        })?;

        info!(owner = %owner_id, dir = %working_dir.display(), "Creating new session");
        let mut conn = match self
            .launcher
            .launch(working_dir, self.config.start_timeout)
            .await
        {
            Ok(conn) => conn,
            Err(LaunchError::ReadyTimeout(elapsed)) => {
                return Err(PoolError::BackendStartTimeout {
                    seconds: elapsed.as_secs(),
                })
            }
            Err(LaunchError::Other(e)) => return Err(PoolError::BackendStartFailed(e)),
        };

        self.bootstrap(conn.as_mut(), owner_id).await;

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(Session::new(
            owner_id,
            format!("kernel-{id}"),
            working_dir,
            conn,
        ));
        self.sessions
            .write()
            .await
            .insert(owner_id.to_string(), Arc::clone(&session));

        info!(owner = %owner_id, session = %session.session_id, "Session created");
        Ok(session)
    }

    /// Run the environment bootstrap in a new kernel. Never fatal: the
    /// session stays usable for other code even when the preload fails.
    async fn bootstrap(&self, conn: &mut dyn KernelConnection, owner_id: &str) {
        let coordinator = Coordinator::new(self.config.poll_interval);
        match coordinator
            .run(conn, BOOTSTRAP_CODE, self.config.bootstrap_timeout)
            .await
        {
            Ok(result) if result.success => {
                debug!(owner = %owner_id, "Environment bootstrap complete");
            }
            Ok(result) => {
                warn!(owner = %owner_id, error = %result.error, "Environment bootstrap failed");
            }
            Err(e) => {
                warn!(owner = %owner_id, error = %e, "Environment bootstrap fault");
            }
        }
    }

    /// Destroy the owner's session, if any. Idempotent; kernel teardown
    /// errors are logged inside the transport, never raised.
    pub async fn destroy(&self, owner_id: &str) {
        let removed = self.sessions.write().await.remove(owner_id);
        if let Some(session) = removed {
            info!(owner = %owner_id, session = %session.session_id, "Destroying session");
            session.kill().await;
        }
    }

    /// Destroy every session and stop the reaper.
    ///
    /// The reaper is cancelled and joined *before* teardown so no sweep is
    /// mid-flight when this returns.
    pub async fn destroy_all(&self) {
        if let Some((token, handle)) = self.reaper.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Reaper task join failed");
            }
        }

        let all: Vec<Arc<Session>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        self.owner_locks.write().await.clear();

        for session in &all {
            info!(owner = %session.owner_id, session = %session.session_id, "Destroying session");
            session.kill().await;
        }
    }

    /// Evict every session past its idle deadline (one reaper sweep).
    pub async fn cleanup_expired(&self) {
        let expired: Vec<String> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, session)| session.idle_for() >= self.config.idle_timeout)
            .map(|(owner, _)| owner.clone())
            .collect();

        for owner in expired {
            info!(owner = %owner, "Evicting idle session");
            self.destroy(&owner).await;
        }
    }

    /// Start the background reaper. Idempotent; only the first call spawns.
    pub async fn start_reaper(self: &Arc<Self>) {
        let mut slot = self.reaper.lock().await;
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let table = Arc::clone(self);
        let interval = self.config.reaper_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => {
                        debug!("Reaper cancelled");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {
                        debug!("Reaper sweep");
                        table.cleanup_expired().await;
                    }
                }
            }
        });

        *slot = Some((token, handle));
    }

    /// Whether the reaper loop is currently running.
    pub async fn reaper_running(&self) -> bool {
        self.reaper.lock().await.is_some()
    }

    /// Number of live sessions.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Read-only per-owner view; safe to call concurrently with everything.
    pub async fn snapshot(&self) -> HashMap<String, SessionSnapshot> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(owner, session)| {
                (
                    owner.clone(),
                    SessionSnapshot {
                        session_id: session.session_id.clone(),
                        created_at: session
                            .created_at
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs(),
                        working_directory: session.working_directory.clone(),
                        alive: session.is_alive(),
                    },
                )
            })
            .collect()
    }

    async fn owner_lock(&self, owner_id: &str) -> Arc<Mutex<()>> {
        // Fast path: read lock
        {
            let locks = self.owner_locks.read().await;
            if let Some(lock) = locks.get(owner_id) {
                return Arc::clone(lock);
            }
        }
        // Slow path: create
        let mut locks = self.owner_locks.write().await;
        Arc::clone(
            locks
                .entry(owner_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::{LaunchBehavior, MockLauncher, Script};
    use crate::kernel::{ExecutionState, KernelMessage};

    fn test_config(idle_timeout: Duration) -> Config {
        Config {
            idle_timeout,
            max_sessions_per_owner: 3,
            start_timeout: Duration::from_millis(200),
            bootstrap_timeout: Duration::from_millis(200),
            reaper_interval: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            ..Config::default()
        }
    }

    fn table_with(launcher: MockLauncher, config: Config) -> (Arc<SessionTable>, Arc<MockLauncher>) {
        let launcher = Arc::new(launcher);
        let as_dyn: Arc<dyn KernelLauncher> = launcher.clone();
        let table = Arc::new(SessionTable::new(config, as_dyn));
        (table, launcher)
    }

    #[tokio::test]
    async fn reuse_within_idle_window() {
        let dir = tempfile::tempdir().unwrap();
        let (table, launcher) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_secs(60)));

        let first = table.resolve_or_create("alice", dir.path()).await.unwrap();
        let second = table.resolve_or_create("alice", dir.path()).await.unwrap();

        assert_eq!(first.session_id, second.session_id);
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(table.active_count().await, 1);
    }

    #[tokio::test]
    async fn expired_session_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (table, launcher) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_millis(30)));

        let first = table.resolve_or_create("alice", dir.path()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = table.resolve_or_create("alice", dir.path()).await.unwrap();

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(first.status(), SessionStatus::Terminated);
        assert!(!first.is_alive());
    }

    #[tokio::test]
    async fn quota_exceeded_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            max_sessions_per_owner: 0,
            ..test_config(Duration::from_secs(60))
        };
        let (table, _) = table_with(MockLauncher::always_idle(), config);

        let err = table
            .resolve_or_create("alice", dir.path())
            .await
            .unwrap_err();
        match err {
            PoolError::QuotaExceeded { owner, limit } => {
                assert_eq!(owner, "alice");
                assert_eq!(limit, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn concurrent_resolves_create_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let (table, launcher) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            let path = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                table.resolve_or_create("alice", &path).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().session_id.clone());
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn owners_are_keyed_exactly_not_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_secs(60)));

        // "alice" is a prefix of "alice-2"; they must be independent.
        table.resolve_or_create("alice", dir.path()).await.unwrap();
        table.resolve_or_create("alice-2", dir.path()).await.unwrap();
        assert_eq!(table.active_count().await, 2);

        table.destroy("alice").await;
        let snapshot = table.snapshot().await;
        assert!(!snapshot.contains_key("alice"));
        assert!(snapshot.contains_key("alice-2"));
    }

    #[tokio::test]
    async fn ready_timeout_surfaces_as_start_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _) = table_with(
            MockLauncher::new(LaunchBehavior::ReadyTimeout),
            test_config(Duration::from_secs(60)),
        );

        let err = table
            .resolve_or_create("alice", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::BackendStartTimeout { .. }));
        assert_eq!(table.active_count().await, 0);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_start_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _) = table_with(
            MockLauncher::new(LaunchBehavior::Fail),
            test_config(Duration::from_secs(60)),
        );

        let err = table
            .resolve_or_create("alice", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::BackendStartFailed(_)));
    }

    #[tokio::test]
    async fn bootstrap_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let idle = KernelMessage::Status {
            execution_state: ExecutionState::Idle,
        };
        let script = vec![
            Script::Message(KernelMessage::Error {
                ename: "ModuleNotFoundError".to_string(),
                evalue: "No module named 'jieba'".to_string(),
                traceback: vec![],
            }),
            Script::Message(idle),
        ];
        let (table, _) = table_with(
            MockLauncher::new(LaunchBehavior::Succeed(script)),
            test_config(Duration::from_secs(60)),
        );

        let session = table.resolve_or_create("alice", dir.path()).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn working_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("work/alice");
        let (table, _) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_secs(60)));

        table.resolve_or_create("alice", &nested).await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn destroy_unknown_owner_is_a_noop() {
        let (table, _) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_secs(60)));
        table.destroy("nobody").await;
        assert_eq!(table.active_count().await, 0);
    }

    #[tokio::test]
    async fn snapshot_reflects_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_secs(60)));

        table.resolve_or_create("alice", dir.path()).await.unwrap();
        let snapshot = table.snapshot().await;
        assert!(snapshot["alice"].alive);
        assert_eq!(snapshot["alice"].working_directory, dir.path());

        table.destroy("alice").await;
        assert!(table.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn reaper_evicts_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_millis(10)));

        table.start_reaper().await;
        table.resolve_or_create("alice", dir.path()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(table.active_count().await, 0);

        table.destroy_all().await;
    }

    #[tokio::test]
    async fn destroy_all_empties_table_and_joins_reaper() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_secs(60)));

        table.start_reaper().await;
        assert!(table.reaper_running().await);
        table.resolve_or_create("alice", dir.path()).await.unwrap();
        table.resolve_or_create("bob", dir.path()).await.unwrap();

        table.destroy_all().await;

        assert_eq!(table.active_count().await, 0);
        assert!(!table.reaper_running().await);
    }

    #[tokio::test]
    async fn start_reaper_is_idempotent() {
        let (table, _) =
            table_with(MockLauncher::always_idle(), test_config(Duration::from_secs(60)));
        table.start_reaper().await;
        table.start_reaper().await;
        assert!(table.reaper_running().await);
        table.destroy_all().await;
    }
}
