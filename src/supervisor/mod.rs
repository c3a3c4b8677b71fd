//! Worker lifecycle: launch, graceful and forced stop, restart.
//!
//! The supervisor owns the registry writes for lifecycle changes and
//! the OS process handling behind them. Launch runs the recovery hooks
//! first: the checkpoint store is resynced from the sink (a result that
//! reached the sink is done, even if the crash ate its checkpoint) and
//! the still-pending items are re-enqueued. Stopping is cooperative:
//! the status flip to Stopped is the signal, and the worker observes it
//! at its next item boundary. Only when the process outlives the grace
//! period does the supervisor escalate to signals.

pub mod process;

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::Limits;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::external::{ItemSource, ResultSink};
use crate::model::{LaneKey, LaneStatus, RegistryEntry, pending_items};
use crate::supervisor::process::ProcessRunner;
use crate::telemetry::metrics;

const STOP_POLL: Duration = Duration::from_millis(500);

pub struct Supervisor {
    db: Arc<Db>,
    runner: Arc<dyn ProcessRunner>,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn ResultSink>,
    source: Option<Arc<dyn ItemSource>>,
    limits: Limits,
}

impl Supervisor {
    pub fn new(
        db: Arc<Db>,
        runner: Arc<dyn ProcessRunner>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn ResultSink>,
        source: Option<Arc<dyn ItemSource>>,
        limits: Limits,
    ) -> Self {
        Self {
            db,
            runner,
            broker,
            sink,
            source,
            limits,
        }
    }

    /// Launch a worker process for the lane. Refuses when one is
    /// already registered as running with a live process; otherwise runs
    /// the recovery hooks, spawns, and registers.
    pub async fn launch(&self, lane: &LaneKey) -> Result<i32> {
        match self.db.get_lane(lane).await {
            Ok(entry) if entry.status == LaneStatus::Running => {
                if let Some(pid) = entry.pid
                    && self.runner.is_alive(pid)
                {
                    return Err(Error::Refused(format!(
                        "lane {lane} already running as pid {pid}"
                    )));
                }
                // Registered running but the process is gone: stale
                // record from a crash, safe to relaunch over.
                warn!(lane = %lane, "stale running record, relaunching");
            }
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.run_launch_hooks(lane).await?;
        let pid = self.runner.spawn_worker(lane)?;
        self.db.register_launch(lane, pid).await?;
        info!(lane = %lane, pid, "lane launched");
        Ok(pid)
    }

    /// Stop a lane. Graceful mode flips the status, waits out the grace
    /// period before signalling, and flushes the sink; force mode
    /// signals immediately. Always concludes with the lane Stopped and
    /// its pid cleared.
    pub async fn stop(&self, lane: &LaneKey, force: bool) -> Result<()> {
        let entry = self.db.get_lane(lane).await?;
        if entry.status != LaneStatus::Stopped {
            self.db
                .transition_status(lane, entry.status, LaneStatus::Stopped)
                .await?;
        }

        if let Some(pid) = entry.pid {
            if force {
                self.ensure_dead(lane, pid).await?;
            } else {
                self.wait_then_escalate(lane, pid).await?;
            }
        }
        if !force {
            self.sink.flush(lane).await?;
        }
        self.db.clear_lane_pid(lane).await?;
        info!(lane = %lane, force, "lane stopped");
        Ok(())
    }

    /// Restart a lane: stop its process, re-run the recovery hooks,
    /// spawn a fresh one.
    pub async fn restart(&self, lane: &LaneKey, trigger: &str) -> Result<i32> {
        let entry = self.db.get_lane(lane).await?;
        if entry.status != LaneStatus::Restarting {
            self.db
                .transition_status(lane, entry.status, LaneStatus::Restarting)
                .await?;
        }

        if let Some(pid) = entry.pid {
            self.wait_then_escalate(lane, pid).await?;
        }
        // Same contract as a graceful stop: buffered sink writes land
        // before the recovery hooks read the sink back.
        self.sink.flush(lane).await?;

        self.run_launch_hooks(lane).await?;
        let pid = self.runner.spawn_worker(lane)?;
        self.db.register_launch(lane, pid).await?;
        metrics::lane_restarts().add(
            1,
            &[
                KeyValue::new("lane", lane.to_string()),
                KeyValue::new("trigger", trigger.to_string()),
            ],
        );
        info!(lane = %lane, pid, trigger, "lane restarted");
        Ok(pid)
    }

    /// Recheckpoint every item the sink already holds a result for.
    /// Recovers completions whose checkpoint was lost to a crash
    /// between the sink write and the checkpoint insert.
    pub async fn resync_from_sink(&self, lane: &LaneKey) -> Result<u64> {
        let written = self.sink.written_ids(lane).await?;
        if written.is_empty() {
            return Ok(0);
        }
        let recovered = self.db.mark_completed_batch(lane, &written).await?;
        if recovered > 0 {
            info!(lane = %lane, recovered, "checkpoints recovered from sink");
        }
        Ok(recovered)
    }

    /// Force the lane's buffered sink writes out.
    pub async fn flush_sink(&self, lane: &LaneKey) -> Result<()> {
        self.sink.flush(lane).await
    }

    /// Pre-launch hooks: resync the checkpoint store from the sink,
    /// then enqueue whatever the source still expects. Redelivered
    /// copies of items enqueued twice are absorbed by the checkpoint
    /// guard, so over-enqueueing here is safe.
    async fn run_launch_hooks(&self, lane: &LaneKey) -> Result<()> {
        self.resync_from_sink(lane).await?;

        if let Some(ref source) = self.source {
            let manifest = source.items(lane).await?;
            let total = manifest.len() as i64;
            let completed = self.db.completed_ids(lane).await?;
            let pending = pending_items(manifest, &completed);

            self.broker.ensure_queue(lane).await?;
            for item in &pending {
                self.broker.enqueue(lane, item).await?;
            }
            self.db.set_total(lane, total).await?;
            info!(lane = %lane, total, enqueued = pending.len(), "launch hooks ran");
        }
        Ok(())
    }

    /// Whether the registered process for an entry is actually alive.
    pub fn process_alive(&self, entry: &RegistryEntry) -> bool {
        entry.pid.is_some_and(|pid| self.runner.is_alive(pid))
    }

    /// Resident memory of a lane's process, if it has one.
    pub fn process_memory_mb(&self, entry: &RegistryEntry) -> Option<u64> {
        entry.pid.and_then(|pid| self.runner.memory_mb(pid))
    }

    /// Give the worker the grace period to observe the status change,
    /// then SIGTERM, then SIGKILL.
    async fn wait_then_escalate(&self, lane: &LaneKey, pid: i32) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.limits.graceful_stop_secs);
        while self.runner.is_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                warn!(lane = %lane, pid, "grace period expired, escalating");
                return self.ensure_dead(lane, pid).await;
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        Ok(())
    }

    async fn ensure_dead(&self, lane: &LaneKey, pid: i32) -> Result<()> {
        if !self.runner.is_alive(pid) {
            return Ok(());
        }
        let _ = self.runner.terminate(pid);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.runner.is_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                warn!(lane = %lane, pid, "SIGTERM ignored, killing");
                self.runner.kill(pid)?;
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        Ok(())
    }
}
