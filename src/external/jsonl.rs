//! File-backed collaborators: JSONL result sink, JSON item manifest
//! source, JSONL malformed-item log.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::external::{ItemSource, MalformLog, ResultSink};
use crate::model::{ItemResult, LaneKey, MalformRecord, WorkItem};

/// One sink line. Results from every lane share a file, so each line
/// carries its lane.
#[derive(Debug, Serialize, Deserialize)]
struct SinkLine {
    lane: String,
    #[serde(flatten)]
    result: ItemResult,
}

/// Append-only JSONL result sink. Appends are serialized through a
/// mutex so concurrent lane workers in one process cannot interleave
/// partial lines.
pub struct JsonlSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Archived lines land next to the live file: `results.jsonl` gains
    /// a sibling `results.jsonl.archive`.
    fn archive_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".archive");
        PathBuf::from(name)
    }

    async fn read_lines(&self) -> Result<Vec<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Split the file into (lane's lines, everyone else's lines).
    async fn partition(&self, lane: &LaneKey) -> Result<(Vec<String>, Vec<String>)> {
        let lane_text = lane.to_string();
        let mut mine = Vec::new();
        let mut others = Vec::new();
        for raw in self.read_lines().await? {
            let line: SinkLine = serde_json::from_str(&raw)
                .map_err(|e| Error::Other(format!("corrupt sink line: {e}")))?;
            if line.lane == lane_text {
                mine.push(raw);
            } else {
                others.push(raw);
            }
        }
        Ok((mine, others))
    }

    async fn rewrite(&self, lines: &[String]) -> Result<()> {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn write(&self, lane: &LaneKey, result: &ItemResult) -> Result<()> {
        let line = SinkLine {
            lane: lane.to_string(),
            result: result.clone(),
        };
        let mut encoded = serde_json::to_string(&line)
            .map_err(|e| Error::Other(format!("serialize sink line: {e}")))?;
        encoded.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(encoded.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn count(&self, lane: &LaneKey) -> Result<i64> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let lane_text = lane.to_string();
        let mut count = 0i64;
        for raw in content.lines().filter(|l| !l.trim().is_empty()) {
            let line: SinkLine = serde_json::from_str(raw)
                .map_err(|e| Error::Other(format!("corrupt sink line: {e}")))?;
            if line.lane == lane_text {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn written_ids(&self, lane: &LaneKey) -> Result<Vec<String>> {
        let lane_text = lane.to_string();
        let mut ids = Vec::new();
        for raw in self.read_lines().await? {
            let line: SinkLine = serde_json::from_str(&raw)
                .map_err(|e| Error::Other(format!("corrupt sink line: {e}")))?;
            if line.lane == lane_text {
                ids.push(line.result.item_id);
            }
        }
        Ok(ids)
    }

    async fn flush(&self, _lane: &LaneKey) -> Result<()> {
        // Every append is flushed before `write` returns, so there is
        // nothing buffered to force out.
        Ok(())
    }

    async fn archive(&self, lane: &LaneKey) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let (mine, others) = self.partition(lane).await?;
        if mine.is_empty() {
            return Ok(0);
        }
        let mut chunk = mine.join("\n");
        chunk.push('\n');
        let mut archive = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.archive_path())
            .await?;
        archive.write_all(chunk.as_bytes()).await?;
        archive.flush().await?;
        self.rewrite(&others).await?;
        Ok(mine.len() as i64)
    }

    async fn discard(&self, lane: &LaneKey) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let (mine, others) = self.partition(lane).await?;
        if mine.is_empty() {
            return Ok(0);
        }
        self.rewrite(&others).await?;
        Ok(mine.len() as i64)
    }
}

/// Manifest entry mapping items to lanes. The manifest is a JSON array.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    lane: String,
    item_id: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Item source reading a JSON manifest file.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ItemSource for FileSource {
    async fn items(&self, lane: &LaneKey) -> Result<Vec<WorkItem>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let entries: Vec<ManifestEntry> = serde_json::from_str(&content)
            .map_err(|e| Error::Other(format!("bad item manifest: {e}")))?;
        let lane_text = lane.to_string();
        Ok(entries
            .into_iter()
            .filter(|e| e.lane == lane_text)
            .map(|e| WorkItem {
                item_id: e.item_id,
                payload: e.payload,
            })
            .collect())
    }
}

/// Append-only JSONL log of malformed items.
pub struct JsonlMalformLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMalformLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl MalformLog for JsonlMalformLog {
    async fn append(&self, record: &MalformRecord) -> Result<()> {
        let mut encoded = serde_json::to_string(record)
            .map_err(|e| Error::Other(format!("serialize malform record: {e}")))?;
        encoded.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(encoded.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
