//! Subprocess-backed item processor.
//!
//! Runs a configured command once per item with the item payload on
//! stdin and lane context in the environment. Exit code 0 with JSON on
//! stdout is success; exit code 2 marks the item permanently bad;
//! anything else is treated as transient and retried.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::external::ItemProcessor;
use crate::model::{LaneKey, ProcessOutcome, WorkItem};

const PERMANENT_FAILURE_CODE: i32 = 2;

pub struct HookProcessor {
    command: String,
}

impl HookProcessor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ItemProcessor for HookProcessor {
    async fn process(&self, lane: &LaneKey, item: &WorkItem) -> Result<ProcessOutcome> {
        let start = Instant::now();
        let payload = serde_json::to_string(&item.payload)
            .map_err(|e| Error::Other(format!("serialize item payload: {e}")))?;

        debug!(lane = %lane, item_id = %item.item_id, command = %self.command, "running processor hook");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("LANE_KEY", lane.to_string())
            .env("LANE_OWNER", lane.owner.to_string())
            .env("LANE_CATEGORY", &lane.category)
            .env("LANE_ITEM_ID", &item.item_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            match serde_json::from_str(stdout.trim()) {
                Ok(data) => {
                    debug!(lane = %lane, item_id = %item.item_id, duration_ms, "hook completed");
                    Ok(ProcessOutcome::Success(data))
                }
                Err(e) => {
                    // Clean exit but unparseable output: no point retrying.
                    Ok(ProcessOutcome::Permanent(format!("bad hook output: {e}")))
                }
            }
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            warn!(lane = %lane, item_id = %item.item_id, code, duration_ms, "hook failed");
            let reason = format!("hook exited {code}: {}", stderr.trim());
            if code == PERMANENT_FAILURE_CODE {
                Ok(ProcessOutcome::Permanent(reason))
            } else {
                Ok(ProcessOutcome::Retriable(reason))
            }
        }
    }
}
