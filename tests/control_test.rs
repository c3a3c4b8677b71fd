mod common;

use std::sync::Arc;

use common::{FakeRunner, MemoryBroker, MemorySink, MemorySource, item, test_db, unique_lane};
use lanekeeper::config::Limits;
use lanekeeper::control::ControlPlane;
use lanekeeper::db::Db;
use lanekeeper::error::Error;
use lanekeeper::broker::Broker;
use lanekeeper::external::{ItemSource, ResultSink};
use lanekeeper::model::LaneStatus;
use lanekeeper::monitor::HealthMonitor;
use lanekeeper::supervisor::Supervisor;
use lanekeeper::supervisor::process::ProcessRunner;

fn test_limits() -> Limits {
    Limits {
        // Cooperative stop is irrelevant with fake processes.
        graceful_stop_secs: 0,
        restart_cap: 1,
        ..Limits::default()
    }
}

struct Rig {
    db: Arc<Db>,
    broker: Arc<MemoryBroker>,
    runner: Arc<FakeRunner>,
    sink: Arc<MemorySink>,
    source: Arc<MemorySource>,
    control: ControlPlane,
}

impl Rig {
    async fn new() -> Self {
        let db = Arc::new(test_db().await);
        let broker = Arc::new(MemoryBroker::new());
        let runner = Arc::new(FakeRunner::new());
        let sink = Arc::new(MemorySink::new());
        let source = Arc::new(MemorySource::new());
        let supervisor = Self::supervisor(&db, &broker, &runner, &sink, &source);
        let control = ControlPlane::new(
            Arc::clone(&db),
            broker.clone(),
            supervisor,
            Some(source.clone() as Arc<dyn ItemSource>),
            test_limits(),
        );
        Self {
            db,
            broker,
            runner,
            sink,
            source,
            control,
        }
    }

    fn supervisor(
        db: &Arc<Db>,
        broker: &Arc<MemoryBroker>,
        runner: &Arc<FakeRunner>,
        sink: &Arc<MemorySink>,
        source: &Arc<MemorySource>,
    ) -> Supervisor {
        Supervisor::new(
            Arc::clone(db),
            runner.clone(),
            broker.clone(),
            sink.clone(),
            Some(source.clone() as Arc<dyn ItemSource>),
            test_limits(),
        )
    }

    fn monitor(&self) -> HealthMonitor {
        let supervisor =
            Self::supervisor(&self.db, &self.broker, &self.runner, &self.sink, &self.source);
        HealthMonitor::new(
            Arc::clone(&self.db),
            supervisor,
            self.sink.clone(),
            test_limits(),
        )
    }
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn launch_pause_resume_stop_cycle() {
    let rig = Rig::new().await;
    let lane = unique_lane(10);
    rig.source.set_manifest(&lane, vec![item("a"), item("b")]);

    let pid = rig.control.launch(&lane).await.unwrap();
    let entry = rig.db.get_lane(&lane).await.unwrap();
    assert_eq!(entry.status, LaneStatus::Running);
    assert_eq!(entry.pid, Some(pid));
    assert!(rig.runner.is_alive(pid));

    rig.control.pause(&lane).await.unwrap();
    assert_eq!(rig.db.get_lane(&lane).await.unwrap().status, LaneStatus::Paused);
    assert!(rig.db.is_consumption_paused(&lane).await.unwrap());

    rig.control.resume(&lane).await.unwrap();
    assert_eq!(rig.db.get_lane(&lane).await.unwrap().status, LaneStatus::Running);
    assert!(!rig.db.is_consumption_paused(&lane).await.unwrap());
    // Resume resynced the expected total from the source manifest.
    assert_eq!(rig.db.progress(&lane).await.unwrap().total, 2);

    rig.control.stop(&lane, false).await.unwrap();
    let entry = rig.db.get_lane(&lane).await.unwrap();
    assert_eq!(entry.status, LaneStatus::Stopped);
    assert_eq!(entry.pid, None);
    assert!(!rig.runner.is_alive(pid));
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn double_launch_is_refused() {
    let rig = Rig::new().await;
    let lane = unique_lane(11);

    rig.control.launch(&lane).await.unwrap();
    let second = rig.control.launch(&lane).await;
    assert!(matches!(second, Err(Error::Refused(_))));
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn pause_of_non_running_lane_fails() {
    let rig = Rig::new().await;
    let lane = unique_lane(12);

    rig.control.launch(&lane).await.unwrap();
    rig.control.stop(&lane, true).await.unwrap();

    let result = rig.control.pause(&lane).await;
    assert!(matches!(result, Err(Error::InvalidTransition { .. })));
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn bulk_pause_isolates_per_lane_failures() {
    let rig = Rig::new().await;
    // Owner IDs are fleet-global; pick one no other test uses.
    let owner = 920_000 + (std::process::id() % 10_000) as i32;
    let running = unique_lane(owner);
    let stopped = unique_lane(owner);

    rig.control.launch(&running).await.unwrap();
    rig.control.launch(&stopped).await.unwrap();
    rig.control.stop(&stopped, true).await.unwrap();

    let outcomes = rig.control.pause_owner(owner).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[&running].success);
    assert!(!outcomes[&stopped].success);

    // The running lane really did pause despite its sibling failing.
    assert_eq!(
        rig.db.get_lane(&running).await.unwrap().status,
        LaneStatus::Paused
    );
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn operation_lease_excludes_concurrent_command() {
    let rig = Rig::new().await;
    let lane = unique_lane(13);
    rig.control.launch(&lane).await.unwrap();

    // Another operator holds the pause lease for this lane.
    let lease = rig
        .db
        .claim_op_lease(&format!("pause:{lane}"), 60)
        .await
        .unwrap();

    let result = rig.control.pause(&lane).await;
    assert!(matches!(result, Err(Error::LockBusy { .. })));

    rig.db.release_op_lease(&lease).await.unwrap();
    rig.control.pause(&lane).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn status_merges_registry_progress_and_queue() {
    let rig = Rig::new().await;
    let lane = unique_lane(14);

    rig.control.launch(&lane).await.unwrap();
    rig.db.set_total(&lane, 4).await.unwrap();
    rig.db.mark_completed(&lane, "a").await.unwrap();
    rig.broker.enqueue(&lane, &item("b")).await.unwrap();

    let report = rig.control.status(&lane).await.unwrap();
    assert_eq!(report.status, LaneStatus::Running);
    assert_eq!((report.completed, report.total), (1, 4));
    assert_eq!(report.in_flight, 1);
    assert!(report.heartbeat_fresh);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn launch_recovers_from_sink_and_enqueues_pending() {
    let rig = Rig::new().await;
    let lane = unique_lane(17);
    rig.source
        .set_manifest(&lane, vec![item("a"), item("b"), item("c")]);

    // A previous run sank "a" but crashed before checkpointing it.
    let result = lanekeeper::model::ItemResult {
        item_id: "a".to_string(),
        result: serde_json::json!({}),
        malformed: false,
        timestamp: chrono::Utc::now(),
    };
    rig.sink.write(&lane, &result).await.unwrap();

    rig.control.launch(&lane).await.unwrap();

    // The sink result was recheckpointed; only b and c were enqueued.
    assert!(rig.db.is_completed(&lane, "a").await.unwrap());
    let progress = rig.db.progress(&lane).await.unwrap();
    assert_eq!((progress.completed, progress.total), (1, 3));
    assert_eq!(rig.broker.depth(&lane).await.unwrap(), 2);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn teardown_refuses_active_lane_then_removes_it() {
    let rig = Rig::new().await;
    let lane = unique_lane(18);
    rig.control.launch(&lane).await.unwrap();

    let while_running = rig.control.teardown(&lane).await;
    assert!(matches!(while_running, Err(Error::Refused(_))));

    rig.control.stop(&lane, true).await.unwrap();
    rig.control.teardown(&lane).await.unwrap();
    assert!(matches!(
        rig.db.get_lane(&lane).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn restart_flushes_sink_before_respawning() {
    let rig = Rig::new().await;
    let lane = unique_lane(19);

    let pid1 = rig.control.launch(&lane).await.unwrap();
    let pid2 = rig.control.restart(&lane).await.unwrap();
    assert_ne!(pid1, pid2);
    assert_eq!(
        rig.db.get_lane(&lane).await.unwrap().status,
        LaneStatus::Running
    );
    // Buffered output landed before the recovery hooks re-read the sink.
    assert!(rig.sink.flushes_for(&lane) >= 1);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn monitor_restarts_dead_process_then_throttles() {
    let rig = Rig::new().await;
    let monitor = rig.monitor();
    let lane = unique_lane(15);

    let pid1 = rig.control.launch(&lane).await.unwrap();
    rig.runner.mark_dead(pid1);

    // First sweep: process check fails, restart budget allows one.
    monitor.sweep().await.unwrap();
    let entry = rig.db.get_lane(&lane).await.unwrap();
    assert_eq!(entry.status, LaneStatus::Running);
    let pid2 = entry.pid.unwrap();
    assert_ne!(pid1, pid2);
    assert!(rig.runner.is_alive(pid2));

    // Second crash inside the window: budget spent, lane parked in Error.
    rig.runner.mark_dead(pid2);
    monitor.sweep().await.unwrap();
    let entry = rig.db.get_lane(&lane).await.unwrap();
    assert_eq!(entry.status, LaneStatus::Error);
    assert!(entry.last_error.unwrap().contains("throttled"));
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn healthy_lane_passes_all_checks() {
    let rig = Rig::new().await;
    let monitor = rig.monitor();
    let lane = unique_lane(16);

    rig.control.launch(&lane).await.unwrap();
    let entry = rig.db.get_lane(&lane).await.unwrap();
    let report = monitor.check_lane(&entry).await.unwrap();
    assert!(report.healthy, "failing: {:?}", report.failing_checks());
}
