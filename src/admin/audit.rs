//! Append-only audit trail for administrative operations.
//!
//! Every destructive or state-moving admin command leaves one JSONL
//! line: what ran, against what, whether it worked, and when.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub operation: String,
    pub target: String,
    pub success: bool,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn record(
        &self,
        operation: &str,
        target: &str,
        success: bool,
        detail: Option<String>,
    ) {
        let entry = AuditEntry {
            operation: operation.to_string(),
            target: target.to_string(),
            success,
            detail,
            at: Utc::now(),
        };
        // Audit failure must not fail the operation it describes.
        if let Err(e) = self.append(&entry).await {
            warn!(operation, target, error = %e, "audit append failed");
        }
    }

    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut encoded = serde_json::to_string(entry)
            .map_err(|e| Error::Other(format!("serialize audit entry: {e}")))?;
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
