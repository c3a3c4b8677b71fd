//! Health monitor: periodic lane checks and throttled auto-restart.
//!
//! Each sweep evaluates every registered lane against six checks:
//! heartbeat freshness, process liveness, throughput, error rate,
//! memory, and sink accessibility. An unhealthy running lane earns an
//! automatic restart, capped per lane by a sliding-window throttle;
//! once the budget is spent the lane is parked in Error for a human.

pub mod throttle;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use crate::config::Limits;
use crate::db::Db;
use crate::error::Result;
use crate::external::ResultSink;
use crate::model::{CheckVerdict, HealthReport, LaneKey, LaneStatus, RegistryEntry};
use crate::supervisor::Supervisor;
use crate::telemetry::metrics;
use throttle::RestartThrottle;

/// A lane younger than this is not judged for throughput; workers need
/// time to ramp before silence means a stall.
const THROUGHPUT_MIN_UPTIME_SECS: i64 = 300;

pub struct HealthMonitor {
    db: Arc<Db>,
    supervisor: Supervisor,
    sink: Arc<dyn ResultSink>,
    limits: Limits,
    throttle: Mutex<RestartThrottle>,
    /// Processed counts as of the previous sweep, the throughput baseline.
    last_processed: std::sync::Mutex<HashMap<LaneKey, i64>>,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    pub fn new(db: Arc<Db>, supervisor: Supervisor, sink: Arc<dyn ResultSink>, limits: Limits) -> Self {
        let throttle = RestartThrottle::new(limits.restart_cap, limits.restart_window_secs);
        Self {
            db,
            supervisor,
            sink,
            limits,
            throttle: Mutex::new(throttle),
            last_processed: std::sync::Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Run sweeps until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(interval_secs = self.limits.monitor_interval_secs, "health monitor started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("health monitor shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(self.limits.monitor_interval_secs)) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "monitor sweep failed");
                    }
                }
            }
        }
    }

    /// One pass over every registered lane.
    pub async fn sweep(&self) -> Result<Vec<HealthReport>> {
        let mut reports = Vec::new();
        for entry in self.db.list_lanes().await? {
            let report = self.check_lane(&entry).await?;
            if !report.healthy {
                warn!(
                    lane = %report.lane,
                    failing = ?report.failing_checks(),
                    "lane unhealthy"
                );
                self.react(&entry, &report).await?;
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Evaluate all checks for one lane. Checks that lack the data to
    /// judge are skipped, not failed.
    pub async fn check_lane(&self, entry: &RegistryEntry) -> Result<HealthReport> {
        let mut checks = BTreeMap::new();
        let running = entry.status == LaneStatus::Running;

        // Heartbeat freshness only means something for a running lane.
        checks.insert(
            "heartbeat",
            if !running {
                CheckVerdict::Skipped {
                    reason: format!("lane is {}", entry.status),
                }
            } else {
                match entry.last_heartbeat {
                    Some(hb) => {
                        let age = (Utc::now() - hb).num_seconds();
                        if age <= self.limits.heartbeat_timeout_secs {
                            CheckVerdict::Pass
                        } else {
                            CheckVerdict::Fail {
                                reason: format!("heartbeat {age}s old"),
                            }
                        }
                    }
                    None => CheckVerdict::Fail {
                        reason: "no heartbeat recorded".to_string(),
                    },
                }
            },
        );

        checks.insert(
            "process",
            if !running {
                CheckVerdict::Skipped {
                    reason: format!("lane is {}", entry.status),
                }
            } else if self.supervisor.process_alive(entry) {
                CheckVerdict::Pass
            } else {
                CheckVerdict::Fail {
                    reason: "registered process not running".to_string(),
                }
            },
        );

        // Throughput: a running lane with pending work and enough uptime
        // must have processed something since the previous sweep.
        let progress = self.db.progress(&entry.lane).await?;
        let pending = progress.total - progress.completed;
        let uptime_secs = entry
            .started_at
            .map(|s| (Utc::now() - s).num_seconds())
            .unwrap_or(0);
        let baseline = self
            .last_processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.lane.clone(), entry.processed_count);
        checks.insert(
            "throughput",
            if !running {
                CheckVerdict::Skipped {
                    reason: format!("lane is {}", entry.status),
                }
            } else if pending <= 0 {
                CheckVerdict::Skipped {
                    reason: "no items pending".to_string(),
                }
            } else if uptime_secs < THROUGHPUT_MIN_UPTIME_SECS {
                CheckVerdict::Skipped {
                    reason: format!("only {uptime_secs}s of uptime"),
                }
            } else {
                match baseline {
                    None => CheckVerdict::Skipped {
                        reason: "no baseline sweep yet".to_string(),
                    },
                    Some(prev) if entry.processed_count > prev => CheckVerdict::Pass,
                    Some(_) => CheckVerdict::Fail {
                        reason: format!("{pending} pending, none processed since last sweep"),
                    },
                }
            },
        );

        let lane_metrics = self.db.lane_metrics(&entry.lane).await?;
        checks.insert(
            "error_rate",
            if lane_metrics.total_items < self.limits.error_rate_min_items {
                CheckVerdict::Skipped {
                    reason: format!("only {} items seen", lane_metrics.total_items),
                }
            } else {
                let rate = lane_metrics.error_rate();
                if rate < self.limits.error_rate_ceiling {
                    CheckVerdict::Pass
                } else {
                    CheckVerdict::Fail {
                        reason: format!("error rate {rate:.1}%"),
                    }
                }
            },
        );

        checks.insert(
            "memory",
            match self.supervisor.process_memory_mb(entry) {
                Some(mb) if mb > self.limits.memory_ceiling_mb => CheckVerdict::Fail {
                    reason: format!("{mb} MB resident"),
                },
                Some(_) => CheckVerdict::Pass,
                None => CheckVerdict::Skipped {
                    reason: "memory not measurable".to_string(),
                },
            },
        );

        // Accessibility only. Count mismatches are the verify command's
        // business; a sink we cannot read at all is a health problem.
        checks.insert(
            "sink",
            match self.sink.count(&entry.lane).await {
                Ok(_) => CheckVerdict::Pass,
                Err(e) => CheckVerdict::Fail {
                    reason: format!("sink unreadable: {e}"),
                },
            },
        );

        for (name, verdict) in &checks {
            if verdict.is_fail() {
                metrics::health_check_failures().add(
                    1,
                    &[
                        KeyValue::new("lane", entry.lane.to_string()),
                        KeyValue::new("check", *name),
                    ],
                );
            }
        }

        let healthy = checks.values().all(|v| !v.is_fail());
        Ok(HealthReport {
            lane: entry.lane.clone(),
            healthy,
            checks,
            checked_at: Utc::now(),
        })
    }

    /// Respond to an unhealthy lane: restart within budget, otherwise
    /// park it in Error with the reason recorded.
    async fn react(&self, entry: &RegistryEntry, report: &HealthReport) -> Result<()> {
        // Only running lanes are auto-restarted. A paused or stopped
        // lane failing a check is the operator's business.
        if entry.status != LaneStatus::Running {
            return Ok(());
        }

        let allowed = {
            let mut throttle = self.throttle.lock().await;
            throttle.allow(&entry.lane, Utc::now())
        };

        if allowed {
            info!(lane = %entry.lane, "auto-restarting unhealthy lane");
            self.supervisor.restart(&entry.lane, "auto").await?;
        } else {
            let reason = format!(
                "restart throttled after failing: {}",
                report.failing_checks().join(", ")
            );
            warn!(lane = %entry.lane, "{reason}");
            metrics::lane_restarts().add(
                1,
                &[
                    KeyValue::new("lane", entry.lane.to_string()),
                    KeyValue::new("trigger", "throttled"),
                ],
            );
            self.db.record_lane_error(&entry.lane, &reason).await?;
        }
        Ok(())
    }
}
