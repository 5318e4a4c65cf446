//! Daemon configuration.
//!
//! All settings are read from environment variables with defaults matching
//! the production deployment (30 minute idle timeout, 3 sessions per owner).
//! Durations are stored parsed so the rest of the crate never touches raw
//! seconds.

use std::time::Duration;

use serde::Deserialize;

/// Default execution timeout when a request does not specify one.
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;

/// Allowed range for a per-request execution timeout, in seconds.
pub const EXEC_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1..=300;

/// Parsed daemon configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the kernel agent executable spawned per session.
    pub kernel_exec: String,

    /// How long a session can be idle before the reaper evicts it.
    pub idle_timeout: Duration,

    /// Maximum concurrent sessions per owner.
    pub max_sessions_per_owner: usize,

    /// How long to wait for a new kernel's Ready message on startup.
    pub start_timeout: Duration,

    /// How long to wait for the environment bootstrap block to go idle.
    pub bootstrap_timeout: Duration,

    /// Interval between idle-reaper sweeps.
    pub reaper_interval: Duration,

    /// Granularity of a single message-stream poll during execution.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kernel_exec: "kernel-agent".to_string(),
            idle_timeout: Duration::from_secs(1800),
            max_sessions_per_owner: 3,
            start_timeout: Duration::from_secs(60),
            bootstrap_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `KERNEL_EXEC`, `KERNEL_IDLE_TIMEOUT` (seconds),
    /// `MAX_SESSIONS_PER_OWNER`, `KERNEL_START_TIMEOUT` (seconds),
    /// `BOOTSTRAP_TIMEOUT` (seconds), `REAPER_INTERVAL` (seconds) and
    /// `POLL_INTERVAL_MS` (milliseconds).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            kernel_exec: std::env::var("KERNEL_EXEC").unwrap_or(defaults.kernel_exec),
            idle_timeout: env_secs("KERNEL_IDLE_TIMEOUT").unwrap_or(defaults.idle_timeout),
            max_sessions_per_owner: env_parse("MAX_SESSIONS_PER_OWNER")
                .unwrap_or(defaults.max_sessions_per_owner),
            start_timeout: env_secs("KERNEL_START_TIMEOUT").unwrap_or(defaults.start_timeout),
            bootstrap_timeout: env_secs("BOOTSTRAP_TIMEOUT").unwrap_or(defaults.bootstrap_timeout),
            reaper_interval: env_secs("REAPER_INTERVAL").unwrap_or(defaults.reaper_interval),
            poll_interval: env_parse("POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }

    /// Create from a JSON settings blob (as written by deployment tooling).
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)?;
        let defaults = Self::default();
        Ok(Self {
            kernel_exec: raw.kernel_exec.unwrap_or(defaults.kernel_exec),
            idle_timeout: raw
                .idle_timeout_seconds
                .map_or(defaults.idle_timeout, Duration::from_secs),
            max_sessions_per_owner: raw
                .max_sessions_per_owner
                .unwrap_or(defaults.max_sessions_per_owner),
            start_timeout: raw
                .start_timeout_seconds
                .map_or(defaults.start_timeout, Duration::from_secs),
            bootstrap_timeout: raw
                .bootstrap_timeout_seconds
                .map_or(defaults.bootstrap_timeout, Duration::from_secs),
            reaper_interval: raw
                .reaper_interval_seconds
                .map_or(defaults.reaper_interval, Duration::from_secs),
            poll_interval: raw
                .poll_interval_ms
                .map_or(defaults.poll_interval, Duration::from_millis),
        })
    }

    /// Clamp a requested execution timeout into the allowed range,
    /// substituting the default when absent.
    pub fn effective_exec_timeout(requested: Option<u64>) -> Duration {
        let secs = requested
            .unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS)
            .clamp(*EXEC_TIMEOUT_RANGE.start(), *EXEC_TIMEOUT_RANGE.end());
        Duration::from_secs(secs)
    }
}

/// Serialized form used by `from_json`.
#[derive(Debug, Deserialize)]
struct RawConfig {
    kernel_exec: Option<String>,
    idle_timeout_seconds: Option<u64>,
    max_sessions_per_owner: Option<usize>,
    start_timeout_seconds: Option<u64>,
    bootstrap_timeout_seconds: Option<u64>,
    reaper_interval_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse(name).map(Duration::from_secs)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
