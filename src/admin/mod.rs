//! Administrative coordinator: resets, export/import, population,
//! integrity verification.
//!
//! Destructive operations refuse to touch lanes with active workers,
//! run under exclusive operation leases, and leave an audit line.
//! Factory reset additionally demands an explicit confirmation flag.

pub mod audit;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::Limits;
use crate::db::Db;
use crate::db::lock::OpLease;
use crate::error::{Error, Result};
use crate::external::{ItemSource, ResultSink};
use crate::model::{CheckpointSnapshot, Discrepancy, LaneKey, pending_items};
use crate::ratelimit::RateLimiter;
use audit::AuditLog;

pub struct AdminCoordinator {
    db: Arc<Db>,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn ResultSink>,
    source: Option<Arc<dyn ItemSource>>,
    limiter: RateLimiter,
    audit: AuditLog,
    limits: Limits,
}

impl AdminCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Db>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn ResultSink>,
        source: Option<Arc<dyn ItemSource>>,
        limiter: RateLimiter,
        audit: AuditLog,
        limits: Limits,
    ) -> Self {
        Self {
            db,
            broker,
            sink,
            source,
            limiter,
            audit,
            limits,
        }
    }

    /// Wipe one lane's checkpoints, metrics, queued items, and registry
    /// error record, and either archive or discard its sink output. The
    /// lane must not have an active worker.
    pub async fn reset_lane(&self, lane: &LaneKey, archive: bool) -> Result<u64> {
        let lease = self.claim("reset", &lane.to_string()).await?;
        let result = async {
            self.refuse_if_active(lane).await?;
            let flushed = self.broker.flush(lane).await.unwrap_or(0);
            let deleted = self.db.reset_checkpoints(lane).await?;
            self.db.reset_lane_metrics(lane).await?;
            self.db.reset_lane_record(lane).await?;
            let sink_moved = if archive {
                self.sink.archive(lane).await?
            } else {
                self.sink.discard(lane).await?
            };
            info!(lane = %lane, deleted, flushed, sink_moved, archive, "lane reset");
            Ok(deleted)
        }
        .await;
        self.finish(lease, "reset", &lane.to_string(), &result).await;
        result
    }

    /// Reset every lane of one owner and forget the owner's rate bucket.
    pub async fn reset_owner(&self, owner: i32, archive: bool) -> Result<u64> {
        let target = format!("owner:{owner}");
        let lease = self.claim("reset_owner", &target).await?;
        let result = async {
            let lanes: Vec<LaneKey> = self
                .db
                .list_owner_lanes(owner)
                .await?
                .into_iter()
                .map(|e| e.lane)
                .collect();
            for lane in &lanes {
                self.refuse_if_active(lane).await?;
            }
            for lane in &lanes {
                let _ = self.broker.flush(lane).await;
                self.db.reset_lane_metrics(lane).await?;
                self.db.reset_lane_record(lane).await?;
                if archive {
                    self.sink.archive(lane).await?;
                } else {
                    self.sink.discard(lane).await?;
                }
            }
            let deleted = self.db.reset_owner_checkpoints(owner).await?;
            self.limiter.reset(&target).await?;
            info!(owner, deleted, archive, "owner reset");
            Ok(deleted)
        }
        .await;
        self.finish(lease, "reset_owner", &target, &result).await;
        result
    }

    /// Tear down everything: queues, registry, checkpoints, metrics,
    /// rate buckets, leases. Refused without `confirm`. Before anything
    /// is destroyed the checkpoint state is exported to a timestamped
    /// backup file and each lane's sink output is archived.
    pub async fn factory_reset(&self, confirm: bool) -> Result<()> {
        if !confirm {
            self.audit
                .record("factory_reset", "all", false, Some("not confirmed".into()))
                .await;
            return Err(Error::Refused(
                "factory reset requires explicit confirmation".to_string(),
            ));
        }
        let lease = self.claim("factory_reset", "all").await?;
        let result = async {
            let lanes: Vec<LaneKey> = self
                .db
                .list_lanes()
                .await?
                .into_iter()
                .map(|e| e.lane)
                .collect();
            for lane in &lanes {
                self.refuse_if_active(lane).await?;
            }

            let snapshot = self.db.export_checkpoints(None).await?;
            let backup = PathBuf::from(format!(
                "lanekeeper_backup_{}.json",
                Utc::now().format("%Y%m%dT%H%M%SZ")
            ));
            let encoded = serde_json::to_string_pretty(&snapshot)
                .map_err(|e| Error::Other(format!("serialize snapshot: {e}")))?;
            tokio::fs::write(&backup, encoded).await?;
            info!(path = %backup.display(), "pre-reset backup written");

            for lane in &lanes {
                self.sink.archive(lane).await?;
            }
            for lane in &lanes {
                if let Err(e) = self.broker.drop_lane(lane).await {
                    warn!(lane = %lane, error = %e, "queue drop failed, continuing");
                }
                self.db.reset_checkpoints(lane).await?;
                self.db.reset_lane_metrics(lane).await?;
                self.db.remove_lane(lane).await?;
            }
            self.limiter.reset_all().await?;
            // Last: this also drops our own lease.
            self.db.clear_op_leases().await?;
            info!(lanes = lanes.len(), "factory reset complete");
            Ok(())
        }
        .await;
        // The lease may already be gone; release stays best effort.
        self.finish(lease, "factory_reset", "all", &result).await;
        result
    }

    /// Export checkpoint state to a JSON file.
    pub async fn export(&self, lanes: Option<&[LaneKey]>, path: &Path) -> Result<usize> {
        let target = path.display().to_string();
        let lease = self.claim("export", &target).await?;
        let result = async {
            let snapshot = self.db.export_checkpoints(lanes).await?;
            let encoded = serde_json::to_string_pretty(&snapshot)
                .map_err(|e| Error::Other(format!("serialize snapshot: {e}")))?;
            tokio::fs::write(path, encoded).await?;
            info!(lanes = snapshot.lanes.len(), path = %target, "checkpoints exported");
            Ok(snapshot.lanes.len())
        }
        .await;
        self.finish(lease, "export", &target, &result).await;
        result
    }

    /// Import checkpoint state from a JSON file. With `merge`, existing
    /// checkpoints are kept and completion only grows; without it, each
    /// lane named in the file is replaced.
    pub async fn import(&self, path: &Path, merge: bool) -> Result<u64> {
        let target = path.display().to_string();
        let lease = self.claim("import", &target).await?;
        let result = async {
            let content = tokio::fs::read_to_string(path).await?;
            let snapshot: CheckpointSnapshot = serde_json::from_str(&content)
                .map_err(|e| Error::Other(format!("bad snapshot file: {e}")))?;
            for lane_text in snapshot.lanes.keys() {
                let lane: LaneKey = lane_text.parse()?;
                self.refuse_if_active(&lane).await?;
            }
            let imported = self.db.import_checkpoints(&snapshot, merge).await?;
            info!(imported, merge, path = %target, "checkpoints imported");
            Ok(imported)
        }
        .await;
        self.finish(lease, "import", &target, &result).await;
        result
    }

    /// Enqueue every item the source lists for a lane that has no
    /// checkpoint yet, and sync the expected total.
    pub async fn populate(&self, lane: &LaneKey) -> Result<usize> {
        let lease = self.claim("populate", &lane.to_string()).await?;
        let result = async {
            let source = self
                .source
                .as_ref()
                .ok_or_else(|| Error::Config("no item source configured".to_string()))?;
            let manifest = source.items(lane).await?;
            let total = manifest.len() as i64;
            let completed = self.db.completed_ids(lane).await?;
            let pending = pending_items(manifest, &completed);

            self.broker.ensure_queue(lane).await?;
            let mut enqueued = 0usize;
            for item in &pending {
                self.broker.enqueue(lane, item).await?;
                enqueued += 1;
            }
            self.db.set_total(lane, total).await?;
            info!(lane = %lane, total, enqueued, "lane populated");
            Ok(enqueued)
        }
        .await;
        self.finish(lease, "populate", &lane.to_string(), &result)
            .await;
        result
    }

    /// Compare checkpoint counts against sink counts for every lane.
    /// Read-only: discrepancies are reported, never auto-corrected.
    pub async fn verify(&self) -> Result<Vec<Discrepancy>> {
        let mut discrepancies = Vec::new();
        for (lane_text, progress) in self.db.all_progress().await? {
            let lane: LaneKey = lane_text.parse()?;
            let sink_count = self.sink.count(&lane).await?;
            if sink_count != progress.completed {
                discrepancies.push(Discrepancy {
                    lane,
                    checkpoint_count: progress.completed,
                    sink_count,
                });
            }
        }
        Ok(discrepancies)
    }

    /// Refuse destructive work while the lane has an active worker.
    async fn refuse_if_active(&self, lane: &LaneKey) -> Result<()> {
        match self.db.get_lane(lane).await {
            Ok(entry) if entry.status.is_active() => Err(Error::Refused(format!(
                "lane {lane} is {}; stop it first",
                entry.status
            ))),
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn claim(&self, op: &str, target: &str) -> Result<OpLease> {
        self.db
            .claim_op_lease(&format!("admin:{op}:{target}"), self.limits.lock_ttl_secs)
            .await
    }

    async fn finish<T>(&self, lease: OpLease, op: &str, target: &str, result: &Result<T>) {
        if let Err(e) = self.db.release_op_lease(&lease).await {
            warn!(op_type = %lease.op_type, error = %e, "lease release failed");
        }
        let detail = result.as_ref().err().map(|e| e.to_string());
        self.audit.record(op, target, result.is_ok(), detail).await;
    }
}
