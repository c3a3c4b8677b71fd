mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    MemoryBroker, MemoryMalformLog, MemorySink, ScriptedProcessor, item, test_db, unique_lane,
};
use lanekeeper::broker::{Broker, Delivery};
use lanekeeper::config::Limits;
use lanekeeper::db::Db;
use lanekeeper::error::{Error, Result};
use lanekeeper::model::{LaneKey, LaneStatus, ProcessOutcome, WorkItem};
use lanekeeper::ratelimit::RateLimiter;
use lanekeeper::worker::Worker;

fn fast_limits() -> Limits {
    Limits {
        max_attempts: 2,
        ..Limits::default()
    }
}

struct Rig {
    db: Arc<Db>,
    broker: Arc<MemoryBroker>,
    processor: Arc<ScriptedProcessor>,
    sink: Arc<MemorySink>,
    malform: Arc<MemoryMalformLog>,
    lane: LaneKey,
}

impl Rig {
    async fn new(processor: ScriptedProcessor) -> Self {
        let db = Arc::new(test_db().await);
        let lane = unique_lane(9);
        db.register_launch(&lane, 1).await.unwrap();
        Self {
            db,
            broker: Arc::new(MemoryBroker::new()),
            processor: Arc::new(processor),
            sink: Arc::new(MemorySink::new()),
            malform: Arc::new(MemoryMalformLog::new()),
            lane,
        }
    }

    fn spawn_worker(&self) -> tokio::task::JoinHandle<lanekeeper::error::Result<()>> {
        let worker = Worker::new(
            self.lane.clone(),
            Arc::clone(&self.db),
            self.broker.clone(),
            self.processor.clone(),
            self.sink.clone(),
            self.malform.clone(),
            // Effectively unlimited so the loop never stalls on tokens.
            RateLimiter::new(Arc::clone(&self.db), 100_000.0, 1_000.0),
            fast_limits(),
        );
        tokio::spawn(worker.run())
    }

    async fn stop_lane(&self) {
        self.db
            .transition_status(&self.lane, LaneStatus::Running, LaneStatus::Stopped)
            .await
            .unwrap();
    }

    async fn wait_until<F>(&self, mut condition: F)
    where
        F: AsyncFnMut(&Rig) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !condition(self).await {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn processes_items_and_checkpoints_each_once() {
    let rig = Rig::new(ScriptedProcessor::always_ok()).await;
    for id in ["a", "b", "c"] {
        rig.broker.enqueue(&rig.lane, &item(id)).await.unwrap();
    }

    let handle = rig.spawn_worker();
    rig.wait_until(async |rig: &Rig| {
        rig.db.progress(&rig.lane).await.unwrap().completed == 3
    })
    .await;
    rig.stop_lane().await;
    handle.await.unwrap().unwrap();

    let results = rig.sink.results_for(&rig.lane);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| !r.malformed));
    assert!(rig.broker.acked_empty(&rig.lane));

    let metrics = rig.db.lane_metrics(&rig.lane).await.unwrap();
    assert_eq!(metrics.succeeded, 3);
    assert_eq!(metrics.total_items, 3);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn redelivered_checkpointed_item_is_not_reprocessed() {
    let rig = Rig::new(ScriptedProcessor::always_ok()).await;

    // The item completed in a previous run; only the ack was lost.
    rig.db.mark_completed(&rig.lane, "a").await.unwrap();
    rig.broker.enqueue(&rig.lane, &item("a")).await.unwrap();

    let handle = rig.spawn_worker();
    rig.wait_until(async |rig: &Rig| rig.broker.acked_empty(&rig.lane))
        .await;
    rig.stop_lane().await;
    handle.await.unwrap().unwrap();

    // Acked without invoking the processor or duplicating the result.
    assert_eq!(rig.processor.calls(), 0);
    assert!(rig.sink.results_for(&rig.lane).is_empty());
    assert_eq!(rig.db.progress(&rig.lane).await.unwrap().completed, 1);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn exhausted_retries_checkpoint_a_malformed_result() {
    let rig = Rig::new(ScriptedProcessor::new(vec![
        ProcessOutcome::Retriable("upstream timeout".into()),
        ProcessOutcome::Retriable("upstream timeout".into()),
    ]))
    .await;
    rig.broker.enqueue(&rig.lane, &item("bad")).await.unwrap();

    let handle = rig.spawn_worker();
    rig.wait_until(async |rig: &Rig| {
        rig.db.progress(&rig.lane).await.unwrap().completed == 1
    })
    .await;
    rig.stop_lane().await;
    handle.await.unwrap().unwrap();

    assert_eq!(rig.processor.calls(), 2);
    let results = rig.sink.results_for(&rig.lane);
    assert_eq!(results.len(), 1);
    assert!(results[0].malformed);

    let records = rig.malform.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 2);

    // Checkpointed: it will never be retried.
    assert!(rig.db.is_completed(&rig.lane, "bad").await.unwrap());
    let metrics = rig.db.lane_metrics(&rig.lane).await.unwrap();
    assert_eq!(metrics.malformed, 1);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn permanent_failure_skips_retries() {
    let rig = Rig::new(ScriptedProcessor::new(vec![ProcessOutcome::Permanent(
        "unparseable payload".into(),
    )]))
    .await;
    rig.broker.enqueue(&rig.lane, &item("junk")).await.unwrap();

    let handle = rig.spawn_worker();
    rig.wait_until(async |rig: &Rig| {
        rig.db.progress(&rig.lane).await.unwrap().completed == 1
    })
    .await;
    rig.stop_lane().await;
    handle.await.unwrap().unwrap();

    assert_eq!(rig.processor.calls(), 1);
    assert_eq!(rig.malform.records().len(), 1);
}

/// Broker whose reads always fail, as a broken payload or a dead queue
/// backend would.
struct FailingBroker;

#[async_trait]
impl Broker for FailingBroker {
    async fn ensure_queue(&self, _lane: &LaneKey) -> Result<()> {
        Ok(())
    }

    async fn enqueue(&self, _lane: &LaneKey, _item: &WorkItem) -> Result<i64> {
        Ok(0)
    }

    async fn next(&self, _lane: &LaneKey) -> Result<Option<Delivery>> {
        Err(Error::Other("undeserializable queue payload".to_string()))
    }

    async fn ack(&self, _lane: &LaneKey, _delivery_id: i64) -> Result<()> {
        Ok(())
    }

    async fn depth(&self, _lane: &LaneKey) -> Result<i64> {
        Ok(0)
    }

    async fn flush(&self, _lane: &LaneKey) -> Result<i64> {
        Ok(0)
    }

    async fn drop_lane(&self, _lane: &LaneKey) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn broker_failure_marks_the_lane_errored() {
    let db = Arc::new(test_db().await);
    let lane = unique_lane(9);
    db.register_launch(&lane, 1).await.unwrap();

    let worker = Worker::new(
        lane.clone(),
        Arc::clone(&db),
        Arc::new(FailingBroker),
        Arc::new(ScriptedProcessor::always_ok()),
        Arc::new(MemorySink::new()),
        Arc::new(MemoryMalformLog::new()),
        RateLimiter::new(Arc::clone(&db), 100_000.0, 1_000.0),
        fast_limits(),
    );
    assert!(worker.run().await.is_err());

    // The exit left a record, not a stale Running entry.
    let entry = db.get_lane(&lane).await.unwrap();
    assert_eq!(entry.status, LaneStatus::Error);
    assert!(
        entry
            .last_error
            .unwrap()
            .contains("undeserializable queue payload")
    );
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn paused_lane_stops_consuming_at_item_boundary() {
    let rig = Rig::new(ScriptedProcessor::always_ok()).await;
    rig.broker.enqueue(&rig.lane, &item("a")).await.unwrap();

    let handle = rig.spawn_worker();
    rig.wait_until(async |rig: &Rig| {
        rig.db.progress(&rig.lane).await.unwrap().completed == 1
    })
    .await;

    rig.db
        .transition_status(&rig.lane, LaneStatus::Running, LaneStatus::Paused)
        .await
        .unwrap();
    // Give the loop time to observe the pause, then enqueue more work.
    tokio::time::sleep(Duration::from_secs(2)).await;
    rig.broker.enqueue(&rig.lane, &item("b")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Still unconsumed: the paused worker idles without reading.
    assert_eq!(rig.db.progress(&rig.lane).await.unwrap().completed, 1);

    rig.db
        .transition_status(&rig.lane, LaneStatus::Paused, LaneStatus::Running)
        .await
        .unwrap();
    rig.wait_until(async |rig: &Rig| {
        rig.db.progress(&rig.lane).await.unwrap().completed == 2
    })
    .await;

    rig.stop_lane().await;
    handle.await.unwrap().unwrap();
}
