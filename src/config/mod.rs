//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod catalog;
pub mod secrets;

use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Command line invoked per work item, e.g. an annotation client wrapper.
    pub processor_command: Option<String>,
    /// Where completed results land (one JSON object per line).
    pub sink_path: PathBuf,
    /// Append-only log of items that exhausted retries.
    pub malform_log_path: PathBuf,
    /// Item manifest consulted by populate and resync.
    pub source_path: Option<PathBuf>,
    /// Declared lane fleet, consulted by bulk launch.
    pub catalog_path: Option<PathBuf>,
    /// Audit trail for administrative operations.
    pub audit_log_path: PathBuf,
    pub limits: Limits,
}

/// Operational tunables. Every field has a default matching production
/// behavior; env vars override individually.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Token bucket capacity per identity.
    pub rate_capacity: f64,
    /// Tokens restored per second.
    pub rate_refill_per_sec: f64,
    /// Operation lease lifetime in seconds.
    pub lock_ttl_secs: i64,
    /// Heartbeat older than this is stale.
    pub heartbeat_timeout_secs: i64,
    /// Grace period for cooperative stop before force kill.
    pub graceful_stop_secs: u64,
    /// Max processor attempts per item before it is recorded as malformed.
    pub max_attempts: u32,
    /// Seconds a read item stays invisible to other consumers.
    pub visibility_timeout_secs: i32,
    /// Monitor sweep interval.
    pub monitor_interval_secs: u64,
    /// Auto-restarts allowed per lane within the throttle window.
    pub restart_cap: usize,
    /// Throttle window in seconds.
    pub restart_window_secs: i64,
    /// Worker resident memory ceiling in MB.
    pub memory_ceiling_mb: u64,
    /// Error-rate ceiling in percent.
    pub error_rate_ceiling: f64,
    /// Error rate is only judged after this many terminal outcomes.
    pub error_rate_min_items: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            rate_capacity: 60.0,
            rate_refill_per_sec: 1.0,
            lock_ttl_secs: 300,
            heartbeat_timeout_secs: 60,
            graceful_stop_secs: 30,
            max_attempts: 3,
            visibility_timeout_secs: 300,
            monitor_interval_secs: 60,
            restart_cap: 3,
            restart_window_secs: 3600,
            memory_ceiling_mb: 500,
            error_rate_ceiling: 10.0,
            error_rate_min_items: 10,
        }
    }
}

impl Limits {
    fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            rate_capacity: var_or("LANE_RATE_CAPACITY", d.rate_capacity)?,
            rate_refill_per_sec: var_or("LANE_RATE_REFILL_PER_SEC", d.rate_refill_per_sec)?,
            lock_ttl_secs: var_or("LANE_LOCK_TTL_SECS", d.lock_ttl_secs)?,
            heartbeat_timeout_secs: var_or("LANE_HEARTBEAT_TIMEOUT_SECS", d.heartbeat_timeout_secs)?,
            graceful_stop_secs: var_or("LANE_GRACEFUL_STOP_SECS", d.graceful_stop_secs)?,
            max_attempts: var_or("LANE_MAX_ATTEMPTS", d.max_attempts)?,
            visibility_timeout_secs: var_or("LANE_VISIBILITY_TIMEOUT_SECS", d.visibility_timeout_secs)?,
            monitor_interval_secs: var_or("LANE_MONITOR_INTERVAL_SECS", d.monitor_interval_secs)?,
            restart_cap: var_or("LANE_RESTART_CAP", d.restart_cap)?,
            restart_window_secs: var_or("LANE_RESTART_WINDOW_SECS", d.restart_window_secs)?,
            memory_ceiling_mb: var_or("LANE_MEMORY_CEILING_MB", d.memory_ceiling_mb)?,
            error_rate_ceiling: var_or("LANE_ERROR_RATE_CEILING", d.error_rate_ceiling)?,
            error_rate_min_items: var_or("LANE_ERROR_RATE_MIN_ITEMS", d.error_rate_min_items)?,
        })
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            processor_command: std::env::var("LANE_PROCESSOR_COMMAND").ok(),
            sink_path: path_var("LANE_SINK_PATH", "results.jsonl"),
            malform_log_path: path_var("LANE_MALFORM_LOG_PATH", "malformed.jsonl"),
            source_path: std::env::var("LANE_SOURCE_PATH").ok().map(PathBuf::from),
            catalog_path: std::env::var("LANE_CATALOG_PATH").ok().map(PathBuf::from),
            audit_log_path: path_var("LANE_AUDIT_LOG_PATH", "admin_audit.jsonl"),
            limits: Limits::from_env()?,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn path_var(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn var_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("could not parse {name}={raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_defaults_match_production_values() {
        let d = Limits::default();
        assert_eq!(d.rate_capacity, 60.0);
        assert_eq!(d.heartbeat_timeout_secs, 60);
        assert_eq!(d.restart_cap, 3);
        assert_eq!(d.restart_window_secs, 3600);
        assert_eq!(d.error_rate_min_items, 10);
    }
}
