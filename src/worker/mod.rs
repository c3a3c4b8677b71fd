//! The lane worker loop: pull, rate-limit, process, sink, checkpoint, ack.
//!
//! Ordering is the whole contract. The sink write lands before the
//! checkpoint, and the checkpoint before the ack. A crash between
//! checkpoint and ack redelivers the item, where the checkpoint guard
//! turns it into an ack-only no-op — results are never duplicated.
//!
//! Control is cooperative: the loop reads the lane's registry status at
//! every item boundary and reacts, so a pause or stop issued anywhere
//! in the fleet takes effect within one item.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::broker::{Broker, Delivery};
use crate::config::Limits;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::external::{ItemProcessor, MalformLog, ResultSink};
use crate::model::{
    ItemDisposition, ItemResult, LaneKey, LaneStatus, MalformRecord, ProcessOutcome,
};
use crate::ratelimit::RateLimiter;
use crate::telemetry::lane as lane_spans;

const IDLE_SLEEP: Duration = Duration::from_secs(2);
const PAUSED_SLEEP: Duration = Duration::from_secs(1);
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 30_000;

/// Exponential backoff before retry `attempt` (1-based), capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << exp).min(BACKOFF_MAX_MS);
    Duration::from_millis(ms)
}

pub struct Worker {
    lane: LaneKey,
    db: Arc<Db>,
    broker: Arc<dyn Broker>,
    processor: Arc<dyn ItemProcessor>,
    sink: Arc<dyn ResultSink>,
    malform_log: Arc<dyn MalformLog>,
    limiter: RateLimiter,
    limits: Limits,
    /// Shared with the heartbeat ticker task.
    processed: Arc<AtomicI64>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lane: LaneKey,
        db: Arc<Db>,
        broker: Arc<dyn Broker>,
        processor: Arc<dyn ItemProcessor>,
        sink: Arc<dyn ResultSink>,
        malform_log: Arc<dyn MalformLog>,
        limiter: RateLimiter,
        limits: Limits,
    ) -> Self {
        Self {
            lane,
            db,
            broker,
            processor,
            sink,
            malform_log,
            limiter,
            limits,
            processed: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Run the lane until its registry status tells it to stop.
    ///
    /// Heartbeats come from two places: the loop at every item boundary,
    /// and a ticker task that keeps them flowing while a single item
    /// processes for longer than the heartbeat timeout.
    pub async fn run(mut self) -> Result<()> {
        info!(lane = %self.lane, "worker starting");
        self.broker.ensure_queue(&self.lane).await?;

        let ticker = {
            let db = Arc::clone(&self.db);
            let lane = self.lane.clone();
            let processed = Arc::clone(&self.processed);
            let period =
                Duration::from_secs((self.limits.heartbeat_timeout_secs as u64 / 3).max(1));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if let Err(e) = db.heartbeat(&lane, processed.load(Ordering::Relaxed)).await {
                        warn!(lane = %lane, error = %e, "ticker heartbeat failed");
                    }
                }
            })
        };
        let result = self.serve().await;
        ticker.abort();
        if let Err(ref e) = result {
            // The process is about to exit; the registry must say Error,
            // not a stale Running that reads as a silent stall.
            if let Err(record_err) = self.db.record_lane_error(&self.lane, &e.to_string()).await {
                warn!(lane = %self.lane, error = %record_err, "error record failed");
            }
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let status = match self.db.get_lane(&self.lane).await {
                Ok(entry) => entry.status,
                Err(Error::NotFound(_)) => {
                    // Deregistered under us. Nothing left to serve.
                    info!(lane = %self.lane, "lane deregistered, worker exiting");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match status {
                LaneStatus::Running => {}
                LaneStatus::Paused => {
                    self.db.heartbeat(&self.lane, self.processed.load(Ordering::Relaxed)).await?;
                    tokio::time::sleep(PAUSED_SLEEP).await;
                    continue;
                }
                LaneStatus::Stopped | LaneStatus::Error | LaneStatus::Restarting => {
                    info!(lane = %self.lane, status = %status, "worker stopping");
                    return Ok(());
                }
            }

            let delivery = match self.broker.next(&self.lane).await? {
                Some(d) => d,
                None => {
                    self.db.heartbeat(&self.lane, self.processed.load(Ordering::Relaxed)).await?;
                    tokio::time::sleep(IDLE_SLEEP).await;
                    continue;
                }
            };

            if let Err(e) = self.handle_delivery(delivery).await {
                warn!(lane = %self.lane, error = %e, "item handling failed");
                return Err(e);
            }

            self.db.heartbeat(&self.lane, self.processed.load(Ordering::Relaxed)).await?;
        }
    }

    async fn handle_delivery(&mut self, delivery: Delivery) -> Result<()> {
        let item = &delivery.item;
        // Not entered: this async fn yields across awaits, and an entered
        // span guard must not be held across an await.
        let span = lane_spans::start_item_span(&self.lane, &item.item_id);

        // Redelivery of an already-checkpointed item: the sink write
        // already happened, only the ack was lost.
        if self.db.is_completed(&self.lane, &item.item_id).await? {
            self.broker.ack(&self.lane, delivery.delivery_id).await?;
            lane_spans::record_disposition(&span, "duplicate");
            return Ok(());
        }

        let identity = self.lane.limiter_identity();
        let mut attempt = 1u32;
        let outcome = loop {
            // Every processor invocation spends a token, retries included.
            self.limiter.acquire_blocking(&identity, 1.0).await?;

            match self.processor.process(&self.lane, item).await? {
                ProcessOutcome::Success(data) => break Ok(data),
                ProcessOutcome::Permanent(reason) => break Err((reason, attempt)),
                ProcessOutcome::Retriable(reason) => {
                    if attempt >= self.limits.max_attempts {
                        break Err((reason, attempt));
                    }
                    warn!(
                        lane = %self.lane,
                        item_id = %item.item_id,
                        attempt,
                        reason = %reason,
                        "retriable failure, backing off"
                    );
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        };

        let (result, disposition) = match outcome {
            Ok(data) => (
                ItemResult {
                    item_id: item.item_id.clone(),
                    result: data,
                    malformed: false,
                    timestamp: Utc::now(),
                },
                ItemDisposition::Succeeded,
            ),
            Err((reason, attempts)) => {
                // Terminal failure: log it, then checkpoint a malformed
                // placeholder so the item never runs again.
                self.malform_log
                    .append(&MalformRecord {
                        lane: self.lane.to_string(),
                        item_id: item.item_id.clone(),
                        reason: reason.clone(),
                        attempts,
                        occurred_at: Utc::now(),
                    })
                    .await?;
                (
                    ItemResult {
                        item_id: item.item_id.clone(),
                        result: serde_json::json!({ "error": reason }),
                        malformed: true,
                        timestamp: Utc::now(),
                    },
                    ItemDisposition::Malformed,
                )
            }
        };

        // Sink before checkpoint before ack. See module docs.
        self.sink.write(&self.lane, &result).await?;
        self.db.mark_completed(&self.lane, &result.item_id).await?;
        self.db.record_outcome(&self.lane, disposition).await?;
        self.broker.ack(&self.lane, delivery.delivery_id).await?;

        self.processed.fetch_add(1, Ordering::Relaxed);
        lane_spans::record_disposition(&span, disposition.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(40), Duration::from_secs(30));
    }
}
