//! File-backed collaborator tests. No Postgres needed.

use chrono::Utc;
use lanekeeper::external::jsonl::{FileSource, JsonlMalformLog, JsonlSink};
use lanekeeper::external::{ItemSource, MalformLog, ResultSink};
use lanekeeper::model::{ItemResult, LaneKey, MalformRecord};

fn result_for(id: &str) -> ItemResult {
    ItemResult {
        item_id: id.to_string(),
        result: serde_json::json!({ "ok": true }),
        malformed: false,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn sink_counts_per_lane() {
    let dir = tempfile::tempdir().unwrap();
    let sink = JsonlSink::new(dir.path().join("results.jsonl"));
    let lane_a = LaneKey::new(1, "urgency");
    let lane_b = LaneKey::new(2, "urgency");

    sink.write(&lane_a, &result_for("x")).await.unwrap();
    sink.write(&lane_a, &result_for("y")).await.unwrap();
    sink.write(&lane_b, &result_for("z")).await.unwrap();

    assert_eq!(sink.count(&lane_a).await.unwrap(), 2);
    assert_eq!(sink.count(&lane_b).await.unwrap(), 1);
}

#[tokio::test]
async fn sink_count_of_missing_file_is_zero() {
    let dir = tempfile::tempdir().unwrap();
    let sink = JsonlSink::new(dir.path().join("absent.jsonl"));
    assert_eq!(sink.count(&LaneKey::new(1, "urgency")).await.unwrap(), 0);
}

#[tokio::test]
async fn sink_lists_written_ids_per_lane() {
    let dir = tempfile::tempdir().unwrap();
    let sink = JsonlSink::new(dir.path().join("results.jsonl"));
    let lane_a = LaneKey::new(1, "urgency");
    let lane_b = LaneKey::new(2, "urgency");

    sink.write(&lane_a, &result_for("x")).await.unwrap();
    sink.write(&lane_b, &result_for("y")).await.unwrap();
    sink.write(&lane_a, &result_for("z")).await.unwrap();

    assert_eq!(sink.written_ids(&lane_a).await.unwrap(), ["x", "z"]);
    assert_eq!(sink.written_ids(&lane_b).await.unwrap(), ["y"]);
}

#[tokio::test]
async fn sink_archive_moves_only_the_lane_aside() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    let sink = JsonlSink::new(&path);
    let lane_a = LaneKey::new(1, "urgency");
    let lane_b = LaneKey::new(2, "urgency");

    sink.write(&lane_a, &result_for("x")).await.unwrap();
    sink.write(&lane_b, &result_for("y")).await.unwrap();

    let moved = sink.archive(&lane_a).await.unwrap();
    assert_eq!(moved, 1);
    assert_eq!(sink.count(&lane_a).await.unwrap(), 0);
    // The other lane's line stays in the live file.
    assert_eq!(sink.count(&lane_b).await.unwrap(), 1);

    let archived = std::fs::read_to_string(dir.path().join("results.jsonl.archive")).unwrap();
    assert!(archived.contains("\"x\""));
}

#[tokio::test]
async fn sink_discard_drops_the_lane() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    let sink = JsonlSink::new(&path);
    let lane = LaneKey::new(1, "urgency");

    sink.write(&lane, &result_for("x")).await.unwrap();
    assert_eq!(sink.discard(&lane).await.unwrap(), 1);
    assert_eq!(sink.count(&lane).await.unwrap(), 0);
    assert!(!dir.path().join("results.jsonl.archive").exists());
}

#[tokio::test]
async fn source_filters_manifest_by_lane() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    let manifest = serde_json::json!([
        { "lane": "1:urgency", "item_id": "a", "payload": { "n": 1 } },
        { "lane": "2:urgency", "item_id": "b" },
        { "lane": "1:urgency", "item_id": "c" }
    ]);
    std::fs::write(&path, serde_json::to_string(&manifest).unwrap()).unwrap();

    let source = FileSource::new(&path);
    let items = source.items(&LaneKey::new(1, "urgency")).await.unwrap();
    let ids: Vec<&str> = items.iter().map(|i| i.item_id.as_str()).collect();
    assert_eq!(ids, ["a", "c"]);
    assert_eq!(items[0].payload, serde_json::json!({ "n": 1 }));
}

#[tokio::test]
async fn malform_log_appends_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("malformed.jsonl");
    let log = JsonlMalformLog::new(&path);

    for i in 0..2 {
        log.append(&MalformRecord {
            lane: "1:urgency".to_string(),
            item_id: format!("item-{i}"),
            reason: "upstream rejected".to_string(),
            attempts: 3,
            occurred_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    let parsed: MalformRecord = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(parsed.item_id, "item-1");
}
