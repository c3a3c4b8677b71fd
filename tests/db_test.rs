mod common;

use common::{test_db, unique_lane};
use lanekeeper::error::Error;
use lanekeeper::model::{CheckpointSnapshot, LaneCheckpoint, LaneStatus};

#[tokio::test]
#[ignore] // Requires running Postgres
async fn connects_and_migrates() {
    let db = test_db().await;
    assert!(db.health_check().await.is_ok());
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn checkpoint_insert_is_idempotent() {
    let db = test_db().await;
    let lane = unique_lane(1);

    assert!(db.mark_completed(&lane, "item-1").await.unwrap());
    assert!(!db.mark_completed(&lane, "item-1").await.unwrap());
    assert!(db.is_completed(&lane, "item-1").await.unwrap());

    // The duplicate did not double-count.
    let progress = db.progress(&lane).await.unwrap();
    assert_eq!(progress.completed, 1);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn batch_checkpoint_skips_existing() {
    let db = test_db().await;
    let lane = unique_lane(1);

    db.mark_completed(&lane, "a").await.unwrap();
    let inserted = db
        .mark_completed_batch(&lane, &["a".into(), "b".into(), "c".into()])
        .await
        .unwrap();
    assert_eq!(inserted, 2);
    assert_eq!(db.progress(&lane).await.unwrap().completed, 3);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn progress_tracks_total_and_reset() {
    let db = test_db().await;
    let lane = unique_lane(2);

    db.set_total(&lane, 10).await.unwrap();
    db.mark_completed(&lane, "x").await.unwrap();
    let progress = db.progress(&lane).await.unwrap();
    assert_eq!((progress.completed, progress.total), (1, 10));

    let deleted = db.reset_checkpoints(&lane).await.unwrap();
    assert_eq!(deleted, 1);
    let progress = db.progress(&lane).await.unwrap();
    assert_eq!((progress.completed, progress.total), (0, 0));
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn owner_reset_spares_other_owners() {
    let db = test_db().await;
    let mine = unique_lane(77);
    let theirs = unique_lane(78);

    db.mark_completed(&mine, "a").await.unwrap();
    db.mark_completed(&theirs, "b").await.unwrap();

    db.reset_owner_checkpoints(77).await.unwrap();
    assert!(!db.is_completed(&mine, "a").await.unwrap());
    assert!(db.is_completed(&theirs, "b").await.unwrap());
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn merge_import_never_regresses_completion() {
    let db = test_db().await;
    let lane = unique_lane(3);

    db.mark_completed(&lane, "a").await.unwrap();
    db.mark_completed(&lane, "b").await.unwrap();
    db.set_total(&lane, 5).await.unwrap();

    // Snapshot knows about a subset plus one new item, smaller total.
    let mut lanes = std::collections::BTreeMap::new();
    lanes.insert(
        lane.to_string(),
        LaneCheckpoint {
            completed: vec!["b".to_string(), "c".to_string()],
            total: 3,
        },
    );
    let snapshot = CheckpointSnapshot {
        taken_at: chrono::Utc::now(),
        lanes,
    };

    db.import_checkpoints(&snapshot, true).await.unwrap();

    let ids = db.completed_ids(&lane).await.unwrap();
    assert_eq!(ids, ["a", "b", "c"]);
    // Merge keeps the larger total.
    assert_eq!(db.progress(&lane).await.unwrap().total, 5);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn replace_import_overwrites_lane() {
    let db = test_db().await;
    let lane = unique_lane(3);

    db.mark_completed(&lane, "old").await.unwrap();

    let mut lanes = std::collections::BTreeMap::new();
    lanes.insert(
        lane.to_string(),
        LaneCheckpoint {
            completed: vec!["new".to_string()],
            total: 1,
        },
    );
    let snapshot = CheckpointSnapshot {
        taken_at: chrono::Utc::now(),
        lanes,
    };

    db.import_checkpoints(&snapshot, false).await.unwrap();
    assert_eq!(db.completed_ids(&lane).await.unwrap(), ["new"]);
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn op_lease_excludes_second_claimant() {
    let db = test_db().await;
    let op = format!("test:{}", uuid::Uuid::new_v4());

    let lease = db.claim_op_lease(&op, 60).await.unwrap();
    let second = db.claim_op_lease(&op, 60).await;
    assert!(matches!(second, Err(Error::LockBusy { .. })));

    assert!(db.release_op_lease(&lease).await.unwrap());
    // Released: claimable again.
    db.claim_op_lease(&op, 60).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn expired_lease_can_be_stolen() {
    let db = test_db().await;
    let op = format!("test:{}", uuid::Uuid::new_v4());

    // TTL 0: expired the moment it is claimed.
    let stale = db.claim_op_lease(&op, 0).await.unwrap();
    let fresh = db.claim_op_lease(&op, 60).await.unwrap();
    assert_ne!(stale.token, fresh.token);

    // The stale holder's release must not remove the new lease.
    assert!(!db.release_op_lease(&stale).await.unwrap());
    assert!(db.current_op_lease(&op).await.unwrap().is_some());
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn registry_transitions_are_guarded() {
    let db = test_db().await;
    let lane = unique_lane(4);

    db.register_launch(&lane, 1234).await.unwrap();
    assert_eq!(
        db.get_lane(&lane).await.unwrap().status,
        LaneStatus::Running
    );

    db.transition_status(&lane, LaneStatus::Running, LaneStatus::Paused)
        .await
        .unwrap();

    // Stale expectation: the lane is Paused, not Running.
    let stale = db
        .transition_status(&lane, LaneStatus::Running, LaneStatus::Paused)
        .await;
    assert!(matches!(stale, Err(Error::InvalidTransition { .. })));

    // Disallowed edge rejected before touching the store.
    db.transition_status(&lane, LaneStatus::Paused, LaneStatus::Stopped)
        .await
        .unwrap();
    let bad = db
        .transition_status(&lane, LaneStatus::Stopped, LaneStatus::Paused)
        .await;
    assert!(matches!(bad, Err(Error::InvalidTransition { .. })));
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn heartbeat_updates_registry() {
    let db = test_db().await;
    let lane = unique_lane(5);

    db.register_launch(&lane, 42).await.unwrap();
    db.heartbeat(&lane, 17).await.unwrap();

    let entry = db.get_lane(&lane).await.unwrap();
    assert_eq!(entry.processed_count, 17);
    assert!(entry.last_heartbeat.is_some());
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn consumption_flag_round_trips() {
    let db = test_db().await;
    let lane = unique_lane(6);

    assert!(!db.is_consumption_paused(&lane).await.unwrap());
    db.set_consumption_paused(&lane, true).await.unwrap();
    assert!(db.is_consumption_paused(&lane).await.unwrap());
    db.set_consumption_paused(&lane, false).await.unwrap();
    assert!(!db.is_consumption_paused(&lane).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires running Postgres with pgmq
async fn pgmq_send_read_archive() {
    let db = test_db().await;
    let lane = unique_lane(7);
    let queue = lane.queue_name();

    db.create_queue(&queue).await.unwrap();
    let msg_id = db
        .send_to_queue(&queue, &serde_json::json!({"item_id": "x"}), 0)
        .await
        .unwrap();

    let msg = db.read_from_queue(&queue, 30).await.unwrap().unwrap();
    assert_eq!(msg.msg_id, msg_id);

    db.archive_message(&queue, msg_id).await.unwrap();
    assert!(db.read_from_queue(&queue, 30).await.unwrap().is_none());
}
