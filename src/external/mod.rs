//! External collaborator seams: item processor, result sink, item source,
//! malformed-item log.
//!
//! The coordination layer treats all four as opaque. Each trait has a
//! file- or process-backed implementation used by the binary; tests
//! substitute in-memory fakes.

pub mod hook;
pub mod jsonl;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ItemResult, LaneKey, MalformRecord, ProcessOutcome, WorkItem};

/// Invokes the external processing step (an API client, a subprocess)
/// for one item and classifies the outcome.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, lane: &LaneKey, item: &WorkItem) -> Result<ProcessOutcome>;
}

/// Durable destination for completed results. The sink write must land
/// before the item is checkpointed, and the sink is the recovery source
/// of truth: after a crash the checkpoint store is resynced from
/// `written_ids`.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn write(&self, lane: &LaneKey, result: &ItemResult) -> Result<()>;

    /// Number of results the sink holds for a lane. Used by the
    /// integrity check against the checkpoint count.
    async fn count(&self, lane: &LaneKey) -> Result<i64>;

    /// Every item ID the sink holds a result for. A result present here
    /// is durable, so the item must be (re)checkpointed as completed.
    async fn written_ids(&self, lane: &LaneKey) -> Result<Vec<String>>;

    /// Force buffered writes to durable storage. Called before a pause
    /// or stop completes.
    async fn flush(&self, lane: &LaneKey) -> Result<()>;

    /// Move a lane's results out of the live sink into an archive.
    /// Returns the number of results moved.
    async fn archive(&self, lane: &LaneKey) -> Result<i64>;

    /// Drop a lane's results from the sink. Returns the number removed.
    async fn discard(&self, lane: &LaneKey) -> Result<i64>;
}

/// Enumerates the full set of work items a lane is expected to process.
/// Consulted when populating queues and when resyncing progress totals.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn items(&self, lane: &LaneKey) -> Result<Vec<WorkItem>>;
}

/// Append-only record of items that exhausted retries or failed
/// permanently. Separate from the sink so malformed entries are easy
/// to audit and replay.
#[async_trait]
pub trait MalformLog: Send + Sync {
    async fn append(&self, record: &MalformRecord) -> Result<()>;
}
