//! Core domain types: lanes, statuses, work items, progress, reports.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Stable composite identifier for one worker lane: owner × category.
///
/// Canonical text form is `"{owner}:{category}"`, used as the key column in
/// every shared-store table and as the CLI argument format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LaneKey {
    pub owner: i32,
    pub category: String,
}

impl LaneKey {
    pub fn new(owner: i32, category: impl Into<String>) -> Self {
        Self {
            owner,
            category: category.into(),
        }
    }

    /// Queue name for this lane's pgmq queue. pgmq queue names cannot
    /// contain `:`, so the canonical form is flattened with underscores.
    pub fn queue_name(&self) -> String {
        format!("lane_{}_{}", self.owner, self.category)
    }

    /// Rate-limit identity. Lanes of one owner share a bucket, matching
    /// the upstream API quota being per account, not per lane.
    pub fn limiter_identity(&self) -> String {
        format!("owner:{}", self.owner)
    }
}

impl fmt::Display for LaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.category)
    }
}

impl FromStr for LaneKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, category) = s
            .split_once(':')
            .ok_or_else(|| Error::Other(format!("bad lane key '{s}': expected owner:category")))?;
        let owner: i32 = owner
            .parse()
            .map_err(|_| Error::Other(format!("bad lane key '{s}': owner must be an integer")))?;
        if category.is_empty() {
            return Err(Error::Other(format!("bad lane key '{s}': empty category")));
        }
        // Categories end up embedded in queue identifiers; keep them
        // identifier-safe no matter which entry point parsed them.
        if !category
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::Other(format!(
                "bad lane key '{s}': category must match [a-z0-9_]+"
            )));
        }
        Ok(Self {
            owner,
            category: category.to_string(),
        })
    }
}

/// Lifecycle status of a lane as recorded in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Running,
    Paused,
    Stopped,
    Error,
    Restarting,
}

impl LaneStatus {
    /// Whether a transition to `to` is allowed.
    ///
    /// Stop is reachable from everywhere — a stop must always be able to
    /// conclude. Launch (→ Running) is valid from any non-running state.
    pub fn can_transition_to(self, to: LaneStatus) -> bool {
        use LaneStatus::*;
        match (self, to) {
            (_, Stopped) => true,
            (Running, Paused) | (Running, Error) | (Running, Restarting) => true,
            (Paused, Running) | (Paused, Error) | (Paused, Restarting) => true,
            (Stopped, Running) | (Stopped, Restarting) => true,
            (Error, Running) | (Error, Restarting) => true,
            (Restarting, Running) | (Restarting, Error) => true,
            _ => false,
        }
    }

    /// Statuses under which the worker loop keeps consuming items.
    pub fn is_active(self) -> bool {
        matches!(self, LaneStatus::Running | LaneStatus::Paused)
    }
}

impl fmt::Display for LaneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LaneStatus::Running => "running",
            LaneStatus::Paused => "paused",
            LaneStatus::Stopped => "stopped",
            LaneStatus::Error => "error",
            LaneStatus::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

impl FromStr for LaneStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(LaneStatus::Running),
            "paused" => Ok(LaneStatus::Paused),
            "stopped" => Ok(LaneStatus::Stopped),
            "error" => Ok(LaneStatus::Error),
            "restarting" => Ok(LaneStatus::Restarting),
            _ => Err(Error::Other(format!("unknown lane status: {s}"))),
        }
    }
}

/// One unit of work as enumerated by the item source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: String,
    pub payload: serde_json::Value,
}

/// Items from a manifest that have no checkpoint yet, in manifest order.
/// `completed` is a snapshot of the checkpoint set; an item present in it
/// is never returned as pending.
pub fn pending_items(manifest: Vec<WorkItem>, completed: &[String]) -> Vec<WorkItem> {
    let done: std::collections::HashSet<&str> = completed.iter().map(String::as_str).collect();
    manifest
        .into_iter()
        .filter(|item| !done.contains(item.item_id.as_str()))
        .collect()
}

/// Terminal outcome of one external-processor invocation.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Success(serde_json::Value),
    /// Worth retrying (rate limited, timeout, transient upstream fault).
    Retriable(String),
    /// Not worth retrying (malformed or invalid payload).
    Permanent(String),
}

/// A completed item as written to the result sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: String,
    pub result: serde_json::Value,
    /// True when the item exhausted retries or failed permanently; it is
    /// still checkpointed to stop reprocessing, but flagged for audit.
    pub malformed: bool,
    pub timestamp: DateTime<Utc>,
}

/// How an item's terminal outcome is tallied in lane metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemDisposition {
    Succeeded,
    Malformed,
    Failed,
}

impl ItemDisposition {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemDisposition::Succeeded => "succeeded",
            ItemDisposition::Malformed => "malformed",
            ItemDisposition::Failed => "failed",
        }
    }
}

/// Registry entry for a lane: the supervisor's durable view of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub lane: LaneKey,
    pub status: LaneStatus,
    pub pid: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub processed_count: i64,
    pub last_error: Option<String>,
}

/// Derived per-lane progress counters. `completed` is always recomputed
/// from the checkpoint set, never incremented independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LaneProgress {
    pub completed: i64,
    pub total: i64,
}

/// Item-outcome counters per lane, maintained by the worker loop and
/// consumed by the health monitor's error-rate check.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LaneMetrics {
    pub total_items: i64,
    pub succeeded: i64,
    pub malformed: i64,
    pub failed: i64,
}

impl LaneMetrics {
    /// Error rate in percent over all terminal outcomes.
    pub fn error_rate(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.malformed + self.failed) as f64 / self.total_items as f64 * 100.0
    }
}

/// Portable export of checkpoint state for one or all lanes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Keyed by canonical lane text.
    pub lanes: BTreeMap<String, LaneCheckpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneCheckpoint {
    pub completed: Vec<String>,
    pub total: i64,
}

/// Read-only merged view produced by the control plane's status query:
/// registry entry + broker in-flight + heartbeat freshness + progress.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStatusReport {
    pub lane: LaneKey,
    pub status: LaneStatus,
    pub pid: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_age_secs: Option<i64>,
    pub heartbeat_fresh: bool,
    pub processed_count: i64,
    pub completed: i64,
    pub total: i64,
    pub in_flight: usize,
    pub last_error: Option<String>,
}

/// Per-target outcome of a (possibly bulk) control or admin operation.
#[derive(Debug, Clone, Serialize)]
pub struct OpOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl OpOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// One health check's verdict within a lane health report.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckVerdict {
    Pass,
    Fail { reason: String },
    /// Not enough data to judge; does not count against overall health.
    Skipped { reason: String },
}

impl CheckVerdict {
    pub fn is_fail(&self) -> bool {
        matches!(self, CheckVerdict::Fail { .. })
    }
}

/// Full health report for one lane. Overall health is the AND of all
/// non-skipped checks; each failing check is named.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub lane: LaneKey,
    pub healthy: bool,
    pub checks: BTreeMap<&'static str, CheckVerdict>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn failing_checks(&self) -> Vec<&'static str> {
        self.checks
            .iter()
            .filter(|(_, v)| v.is_fail())
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Read-only rollup across all lanes. Carries no mutation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemMetrics {
    pub total_lanes: usize,
    pub running: usize,
    pub paused: usize,
    pub stopped: usize,
    pub errored: usize,
    pub restarting: usize,
    pub total_processed: i64,
    pub total_completed: i64,
    pub total_expected: i64,
}

/// One sink-vs-checkpoint disagreement found by the integrity pass.
/// Reported for manual resolution, never auto-corrected.
#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub lane: LaneKey,
    pub checkpoint_count: i64,
    pub sink_count: i64,
}

/// Record appended to the malformed-item log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalformRecord {
    pub lane: String,
    pub item_id: String,
    pub reason: String,
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_key_roundtrips_through_text_form() {
        let lane = LaneKey::new(3, "urgency");
        assert_eq!(lane.to_string(), "3:urgency");
        let parsed: LaneKey = "3:urgency".parse().unwrap();
        assert_eq!(parsed, lane);
    }

    #[test]
    fn lane_key_rejects_bad_forms() {
        assert!("urgency".parse::<LaneKey>().is_err());
        assert!("x:urgency".parse::<LaneKey>().is_err());
        assert!("3:".parse::<LaneKey>().is_err());
    }

    #[test]
    fn lane_key_category_is_identifier_safe() {
        assert!("3:ur gency".parse::<LaneKey>().is_err());
        assert!("3:urgency;drop".parse::<LaneKey>().is_err());
        assert!("3:\"urgency\"".parse::<LaneKey>().is_err());
        assert!("3:Urgency".parse::<LaneKey>().is_err());
        assert!("3:urgency_2".parse::<LaneKey>().is_ok());
    }

    #[test]
    fn queue_name_has_no_colon() {
        let lane = LaneKey::new(2, "therapeutic");
        assert_eq!(lane.queue_name(), "lane_2_therapeutic");
    }

    #[test]
    fn stop_is_reachable_from_every_status() {
        use LaneStatus::*;
        for from in [Running, Paused, Stopped, Error, Restarting] {
            assert!(from.can_transition_to(Stopped));
        }
    }

    #[test]
    fn paused_is_only_reachable_from_running() {
        assert!(LaneStatus::Paused.can_transition_to(LaneStatus::Running));
        assert!(!LaneStatus::Stopped.can_transition_to(LaneStatus::Paused));
        assert!(!LaneStatus::Error.can_transition_to(LaneStatus::Paused));
    }

    fn work(id: &str) -> WorkItem {
        WorkItem {
            item_id: id.to_string(),
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn pending_filters_checkpointed_items() {
        let manifest = vec![work("a"), work("b"), work("c")];
        let completed = vec!["b".to_string()];
        let pending = pending_items(manifest, &completed);
        let ids: Vec<&str> = pending.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
    }

    #[test]
    fn pending_of_fully_completed_manifest_is_empty() {
        let manifest = vec![work("a")];
        let completed = vec!["a".to_string()];
        assert!(pending_items(manifest, &completed).is_empty());
    }

    #[test]
    fn error_rate_handles_zero_items() {
        assert_eq!(LaneMetrics::default().error_rate(), 0.0);
        let m = LaneMetrics {
            total_items: 10,
            succeeded: 8,
            malformed: 1,
            failed: 1,
        };
        assert!((m.error_rate() - 20.0).abs() < f64::EPSILON);
    }
}
