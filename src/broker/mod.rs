//! Queue abstraction over the per-lane pgmq queues.
//!
//! The worker loop and the control plane talk to a [`Broker`] rather
//! than raw queue SQL, so tests can substitute an in-memory fake.
//! Redelivery is implicit: an item read but never acked reappears when
//! its visibility timeout lapses.

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{LaneKey, WorkItem};

/// An in-flight item handed to the worker. `attempt` counts deliveries,
/// starting at 1.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: i64,
    pub attempt: i32,
    pub item: WorkItem,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the lane's queue if it does not exist.
    async fn ensure_queue(&self, lane: &LaneKey) -> Result<()>;

    /// Enqueue one item. Returns the broker's delivery ID.
    async fn enqueue(&self, lane: &LaneKey, item: &WorkItem) -> Result<i64>;

    /// Take the next item, or None when the queue is empty or the lane's
    /// consumption is paused.
    async fn next(&self, lane: &LaneKey) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery so it is never redelivered.
    async fn ack(&self, lane: &LaneKey, delivery_id: i64) -> Result<()>;

    /// Messages currently queued or in flight.
    async fn depth(&self, lane: &LaneKey) -> Result<i64>;

    /// Discard everything pending on the lane's queue.
    async fn flush(&self, lane: &LaneKey) -> Result<i64>;

    /// Remove the lane's queue entirely.
    async fn drop_lane(&self, lane: &LaneKey) -> Result<()>;
}

/// pgmq-backed broker. Consumption honors the per-lane pause flag in
/// the shared store, so a pause takes effect fleet-wide at the next read.
pub struct PgmqBroker {
    db: Arc<Db>,
    visibility_timeout_secs: i32,
}

impl PgmqBroker {
    pub fn new(db: Arc<Db>, visibility_timeout_secs: i32) -> Self {
        Self {
            db,
            visibility_timeout_secs,
        }
    }
}

#[async_trait]
impl Broker for PgmqBroker {
    async fn ensure_queue(&self, lane: &LaneKey) -> Result<()> {
        self.db.create_queue(&lane.queue_name()).await
    }

    async fn enqueue(&self, lane: &LaneKey, item: &WorkItem) -> Result<i64> {
        let payload = serde_json::to_value(item)
            .map_err(|e| Error::Other(format!("item serialization failed: {e}")))?;
        self.db.send_to_queue(&lane.queue_name(), &payload, 0).await
    }

    async fn next(&self, lane: &LaneKey) -> Result<Option<Delivery>> {
        if self.db.is_consumption_paused(lane).await? {
            return Ok(None);
        }
        let msg = self
            .db
            .read_from_queue(&lane.queue_name(), self.visibility_timeout_secs)
            .await?;
        msg.map(|m| {
            let item: WorkItem = serde_json::from_value(m.message)
                .map_err(|e| Error::Other(format!("bad item payload on {lane}: {e}")))?;
            Ok(Delivery {
                delivery_id: m.msg_id,
                attempt: m.read_ct,
                item,
            })
        })
        .transpose()
    }

    async fn ack(&self, lane: &LaneKey, delivery_id: i64) -> Result<()> {
        self.db.archive_message(&lane.queue_name(), delivery_id).await
    }

    async fn depth(&self, lane: &LaneKey) -> Result<i64> {
        self.db.queue_depth(&lane.queue_name()).await
    }

    async fn flush(&self, lane: &LaneKey) -> Result<i64> {
        self.db.purge_queue(&lane.queue_name()).await
    }

    async fn drop_lane(&self, lane: &LaneKey) -> Result<()> {
        self.db.drop_queue(&lane.queue_name()).await
    }
}
