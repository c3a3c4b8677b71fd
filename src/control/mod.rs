//! Control plane: administrative operations over lanes.
//!
//! Every mutating operation runs under an exclusive operation lease
//! scoped to the operation type and lane, so two operators issuing the
//! same command race for one lease instead of interleaving. Release is
//! best effort; the TTL covers a crashed operator.
//!
//! Bulk operations are isolation boundaries: each target lane succeeds
//! or fails on its own, and the caller gets a per-lane outcome map.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::Limits;
use crate::db::Db;
use crate::db::lock::OpLease;
use crate::error::{Error, Result};
use crate::external::ItemSource;
use crate::model::{
    LaneKey, LaneStatus, LaneStatusReport, OpOutcome, RegistryEntry, SystemMetrics,
};
use crate::supervisor::Supervisor;
use crate::telemetry::metrics;

pub struct ControlPlane {
    db: Arc<Db>,
    broker: Arc<dyn Broker>,
    supervisor: Supervisor,
    source: Option<Arc<dyn ItemSource>>,
    limits: Limits,
}

impl ControlPlane {
    pub fn new(
        db: Arc<Db>,
        broker: Arc<dyn Broker>,
        supervisor: Supervisor,
        source: Option<Arc<dyn ItemSource>>,
        limits: Limits,
    ) -> Self {
        Self {
            db,
            broker,
            supervisor,
            source,
            limits,
        }
    }

    /// Launch a worker for the lane, creating its queue if needed.
    pub async fn launch(&self, lane: &LaneKey) -> Result<i32> {
        let started = Instant::now();
        let lease = self.claim("launch", lane).await?;
        let result = async {
            self.broker.ensure_queue(lane).await?;
            self.supervisor.launch(lane).await
        }
        .await;
        self.release(lease).await;
        self.record_op("launch", started, &result);
        result
    }

    /// Pause a lane: stop queue consumption, keep the process alive.
    /// The pause is not complete until pending sink writes are flushed.
    pub async fn pause(&self, lane: &LaneKey) -> Result<()> {
        let started = Instant::now();
        let lease = self.claim("pause", lane).await?;
        let result = async {
            self.db
                .transition_status(lane, LaneStatus::Running, LaneStatus::Paused)
                .await?;
            self.db.set_consumption_paused(lane, true).await?;
            self.supervisor.flush_sink(lane).await?;
            info!(lane = %lane, "lane paused");
            Ok(())
        }
        .await;
        self.release(lease).await;
        self.record_op("pause", started, &result);
        result
    }

    /// Resume a paused lane. Before consumption restarts, the
    /// checkpoint store is resynced from the sink and the expected
    /// total from the item source, so progress reflects anything that
    /// happened while paused.
    pub async fn resume(&self, lane: &LaneKey) -> Result<()> {
        let started = Instant::now();
        let lease = self.claim("resume", lane).await?;
        let result = async {
            self.supervisor.resync_from_sink(lane).await?;
            if let Some(ref source) = self.source {
                let items = source.items(lane).await?;
                self.db.set_total(lane, items.len() as i64).await?;
            }
            self.db.set_consumption_paused(lane, false).await?;
            self.db
                .transition_status(lane, LaneStatus::Paused, LaneStatus::Running)
                .await?;
            info!(lane = %lane, "lane resumed");
            Ok(())
        }
        .await;
        self.release(lease).await;
        self.record_op("resume", started, &result);
        result
    }

    /// Stop a lane, gracefully unless `force`.
    pub async fn stop(&self, lane: &LaneKey, force: bool) -> Result<()> {
        let started = Instant::now();
        let lease = self.claim("stop", lane).await?;
        let result = self.supervisor.stop(lane, force).await;
        self.release(lease).await;
        self.record_op("stop", started, &result);
        result
    }

    /// Restart a lane's worker process.
    pub async fn restart(&self, lane: &LaneKey) -> Result<i32> {
        let started = Instant::now();
        let lease = self.claim("restart", lane).await?;
        let result = self.supervisor.restart(lane, "manual").await;
        self.release(lease).await;
        self.record_op("restart", started, &result);
        result
    }

    /// Discard everything pending on a lane's queue. Checkpoints are
    /// untouched; flushed items count as never enqueued.
    pub async fn flush(&self, lane: &LaneKey) -> Result<i64> {
        let started = Instant::now();
        let lease = self.claim("flush", lane).await?;
        let result = self.broker.flush(lane).await;
        self.release(lease).await;
        self.record_op("flush", started, &result);
        if let Ok(n) = &result {
            info!(lane = %lane, flushed = n, "queue flushed");
        }
        result
    }

    /// Remove a lane entirely: registry entry, consumption flag, and
    /// queue. Refused while the lane has an active worker. Checkpoints
    /// survive; they belong to the admin reset, not to teardown.
    pub async fn teardown(&self, lane: &LaneKey) -> Result<()> {
        let started = Instant::now();
        let lease = self.claim("teardown", lane).await?;
        let result = async {
            match self.db.get_lane(lane).await {
                Ok(entry) if entry.status.is_active() => Err(Error::Refused(format!(
                    "lane {lane} is {}; stop it first",
                    entry.status
                ))),
                Ok(_) | Err(Error::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }?;
            self.broker.drop_lane(lane).await?;
            self.db.remove_lane(lane).await?;
            info!(lane = %lane, "lane torn down");
            Ok(())
        }
        .await;
        self.release(lease).await;
        self.record_op("teardown", started, &result);
        result
    }

    /// Launch every lane in the given set, with per-lane isolation.
    pub async fn launch_all(&self, lanes: &[LaneKey]) -> Result<BTreeMap<LaneKey, OpOutcome>> {
        let mut outcomes = BTreeMap::new();
        for lane in lanes {
            let outcome = match self.launch(lane).await {
                Ok(_) => OpOutcome::ok(),
                Err(e) => {
                    warn!(lane = %lane, error = %e, "bulk launch: lane failed");
                    OpOutcome::failed(e.to_string())
                }
            };
            outcomes.insert(lane.clone(), outcome);
        }
        Ok(outcomes)
    }

    /// Merged read-only status for one lane.
    pub async fn status(&self, lane: &LaneKey) -> Result<LaneStatusReport> {
        let entry = self.db.get_lane(lane).await?;
        self.report_for(entry).await
    }

    /// Status for every registered lane.
    pub async fn list(&self) -> Result<Vec<LaneStatusReport>> {
        let mut reports = Vec::new();
        for entry in self.db.list_lanes().await? {
            reports.push(self.report_for(entry).await?);
        }
        Ok(reports)
    }

    /// Pause every lane of one owner. Per-lane isolation: one failing
    /// lane never blocks the others.
    pub async fn pause_owner(&self, owner: i32) -> Result<BTreeMap<LaneKey, OpOutcome>> {
        let lanes = self.owner_lane_keys(owner).await?;
        let mut outcomes = BTreeMap::new();
        for lane in lanes {
            let outcome = match self.pause(&lane).await {
                Ok(()) => OpOutcome::ok(),
                Err(e) => {
                    warn!(lane = %lane, error = %e, "bulk pause: lane failed");
                    OpOutcome::failed(e.to_string())
                }
            };
            outcomes.insert(lane, outcome);
        }
        Ok(outcomes)
    }

    /// Resume every lane of one owner, with per-lane isolation.
    pub async fn resume_owner(&self, owner: i32) -> Result<BTreeMap<LaneKey, OpOutcome>> {
        let lanes = self.owner_lane_keys(owner).await?;
        let mut outcomes = BTreeMap::new();
        for lane in lanes {
            let outcome = match self.resume(&lane).await {
                Ok(()) => OpOutcome::ok(),
                Err(e) => {
                    warn!(lane = %lane, error = %e, "bulk resume: lane failed");
                    OpOutcome::failed(e.to_string())
                }
            };
            outcomes.insert(lane, outcome);
        }
        Ok(outcomes)
    }

    /// Stop every registered lane, with per-lane isolation.
    pub async fn stop_all(&self, force: bool) -> Result<BTreeMap<LaneKey, OpOutcome>> {
        let mut outcomes = BTreeMap::new();
        for entry in self.db.list_lanes().await? {
            let lane = entry.lane;
            let outcome = match self.stop(&lane, force).await {
                Ok(()) => OpOutcome::ok(),
                Err(e) => {
                    warn!(lane = %lane, error = %e, "bulk stop: lane failed");
                    OpOutcome::failed(e.to_string())
                }
            };
            outcomes.insert(lane, outcome);
        }
        Ok(outcomes)
    }

    /// Fleet-wide rollup. Read-only.
    pub async fn system_metrics(&self) -> Result<SystemMetrics> {
        let lanes = self.db.list_lanes().await?;
        let progress = self.db.all_progress().await?;

        let mut m = SystemMetrics {
            total_lanes: lanes.len(),
            ..Default::default()
        };
        for entry in &lanes {
            match entry.status {
                LaneStatus::Running => m.running += 1,
                LaneStatus::Paused => m.paused += 1,
                LaneStatus::Stopped => m.stopped += 1,
                LaneStatus::Error => m.errored += 1,
                LaneStatus::Restarting => m.restarting += 1,
            }
            m.total_processed += entry.processed_count;
        }
        for p in progress.values() {
            m.total_completed += p.completed;
            m.total_expected += p.total;
        }
        Ok(m)
    }

    async fn report_for(&self, entry: RegistryEntry) -> Result<LaneStatusReport> {
        let progress = self.db.progress(&entry.lane).await?;
        let in_flight = self.broker.depth(&entry.lane).await.unwrap_or(0);
        let heartbeat_age_secs = entry
            .last_heartbeat
            .map(|hb| (Utc::now() - hb).num_seconds());
        let heartbeat_fresh =
            heartbeat_age_secs.is_some_and(|age| age <= self.limits.heartbeat_timeout_secs);

        Ok(LaneStatusReport {
            lane: entry.lane,
            status: entry.status,
            pid: entry.pid,
            started_at: entry.started_at,
            last_heartbeat: entry.last_heartbeat,
            heartbeat_age_secs,
            heartbeat_fresh,
            processed_count: entry.processed_count,
            completed: progress.completed,
            total: progress.total,
            in_flight: in_flight.max(0) as usize,
            last_error: entry.last_error,
        })
    }

    async fn owner_lane_keys(&self, owner: i32) -> Result<Vec<LaneKey>> {
        Ok(self
            .db
            .list_owner_lanes(owner)
            .await?
            .into_iter()
            .map(|e| e.lane)
            .collect())
    }

    /// Claim the operation lease, retrying a busy lock a few times
    /// before giving up. Busy is contention, not failure; a short
    /// backoff usually outlives the other operator's command.
    async fn claim(&self, op: &str, lane: &LaneKey) -> Result<OpLease> {
        const ATTEMPTS: u32 = 3;
        let op_type = format!("{op}:{lane}");
        let mut attempt = 1u32;
        loop {
            match self
                .db
                .claim_op_lease(&op_type, self.limits.lock_ttl_secs)
                .await
            {
                Err(Error::LockBusy { .. }) if attempt < ATTEMPTS => {
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn release(&self, lease: OpLease) {
        if let Err(e) = self.db.release_op_lease(&lease).await {
            // The TTL will reap it; nothing else to do.
            warn!(op_type = %lease.op_type, error = %e, "lease release failed");
        }
    }

    fn record_op<T>(&self, op: &str, started: Instant, result: &Result<T>) {
        let label = match result {
            Ok(_) => "ok",
            Err(Error::LockBusy { .. }) | Err(Error::Refused(_)) => "refused",
            Err(_) => "error",
        };
        metrics::admin_operations().add(
            1,
            &[
                KeyValue::new("operation", op.to_string()),
                KeyValue::new("result", label),
            ],
        );
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", op.to_string())],
        );
    }
}
