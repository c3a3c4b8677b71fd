//! Checkpoint operations: exactly-once completion records per lane.
//!
//! A checkpoint row (lane, item_id) means the item's result has already
//! been durably written to the sink. Insertion is idempotent — the
//! primary key absorbs duplicate completions from redelivered items.
//! `lane_progress.completed` is never incremented; it is recomputed from
//! the checkpoint set inside the same transaction as every mutation, so
//! the two can never drift.

use std::collections::BTreeMap;

use chrono::Utc;
use opentelemetry::KeyValue;
use sqlx::PgTransaction;

use crate::error::Result;
use crate::model::{CheckpointSnapshot, LaneCheckpoint, LaneKey, LaneProgress};
use crate::telemetry::metrics;

impl super::Db {
    /// Record an item as completed. Returns `true` if this call inserted
    /// the checkpoint, `false` if the item was already checkpointed.
    pub async fn mark_completed(&self, lane: &LaneKey, item_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO checkpoints (lane, item_id, completed_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (lane, item_id) DO NOTHING
             RETURNING item_id",
        )
        .bind(lane.to_string())
        .bind(item_id)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?;

        recompute_completed(&mut tx, lane).await?;
        tx.commit().await?;

        let newly = inserted.is_some();
        metrics::checkpoint_writes().add(
            1,
            &[
                KeyValue::new("lane", lane.to_string()),
                KeyValue::new("result", if newly { "new" } else { "duplicate" }),
            ],
        );
        Ok(newly)
    }

    /// Record a batch of items as completed in one transaction.
    /// Already-checkpointed items are skipped. Returns the number of
    /// newly inserted checkpoints.
    pub async fn mark_completed_batch(&self, lane: &LaneKey, item_ids: &[String]) -> Result<u64> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO checkpoints (lane, item_id, completed_at)
             SELECT $1, unnest($2::text[]), $3
             ON CONFLICT (lane, item_id) DO NOTHING",
        )
        .bind(lane.to_string())
        .bind(item_ids)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        recompute_completed(&mut tx, lane).await?;
        tx.commit().await?;

        if inserted > 0 {
            metrics::checkpoint_writes().add(
                inserted,
                &[
                    KeyValue::new("lane", lane.to_string()),
                    KeyValue::new("result", "new"),
                ],
            );
        }
        Ok(inserted)
    }

    /// Whether an item already has a checkpoint.
    pub async fn is_completed(&self, lane: &LaneKey, item_id: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT item_id FROM checkpoints WHERE lane = $1 AND item_id = $2",
        )
        .bind(lane.to_string())
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// All checkpointed item IDs for a lane, ordered for stable exports.
    pub async fn completed_ids(&self, lane: &LaneKey) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT item_id FROM checkpoints WHERE lane = $1 ORDER BY item_id",
        )
        .bind(lane.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Set the expected item total for a lane, preserving the recomputed
    /// completed count.
    pub async fn set_total(&self, lane: &LaneKey, total: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO lane_progress (lane, completed, total, updated_at)
             VALUES ($1, 0, $2, now())
             ON CONFLICT (lane) DO UPDATE SET total = $2, updated_at = now()",
        )
        .bind(lane.to_string())
        .bind(total)
        .execute(&mut *tx)
        .await?;
        recompute_completed(&mut tx, lane).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Progress counters for one lane. A lane with no rows reads as 0/0.
    pub async fn progress(&self, lane: &LaneKey) -> Result<LaneProgress> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT completed, total FROM lane_progress WHERE lane = $1",
        )
        .bind(lane.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let (completed, total) = row.unwrap_or((0, 0));
        Ok(LaneProgress { completed, total })
    }

    /// Progress for every lane that has any recorded state.
    pub async fn all_progress(&self) -> Result<BTreeMap<String, LaneProgress>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT lane, completed, total FROM lane_progress ORDER BY lane",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(lane, completed, total)| (lane, LaneProgress { completed, total }))
            .collect())
    }

    /// Delete all checkpoint state for one lane.
    pub async fn reset_checkpoints(&self, lane: &LaneKey) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM checkpoints WHERE lane = $1")
            .bind(lane.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM lane_progress WHERE lane = $1")
            .bind(lane.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Delete checkpoint state for every lane belonging to one owner.
    pub async fn reset_owner_checkpoints(&self, owner: i32) -> Result<u64> {
        let pattern = format!("{owner}:%");
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM checkpoints WHERE lane LIKE $1")
            .bind(&pattern)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM lane_progress WHERE lane LIKE $1")
            .bind(&pattern)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Export checkpoint state for the given lanes, or every lane when
    /// `lanes` is `None`.
    pub async fn export_checkpoints(
        &self,
        lanes: Option<&[LaneKey]>,
    ) -> Result<CheckpointSnapshot> {
        let lane_keys: Vec<String> = match lanes {
            Some(keys) => keys.iter().map(|k| k.to_string()).collect(),
            None => {
                let rows: Vec<(String,)> = sqlx::query_as(
                    "SELECT DISTINCT lane FROM (
                         SELECT lane FROM checkpoints
                         UNION SELECT lane FROM lane_progress
                     ) AS known ORDER BY lane",
                )
                .fetch_all(&self.pool)
                .await?;
                rows.into_iter().map(|(lane,)| lane).collect()
            }
        };

        let mut out = BTreeMap::new();
        for lane_text in lane_keys {
            let lane: LaneKey = lane_text.parse()?;
            let completed = self.completed_ids(&lane).await?;
            let progress = self.progress(&lane).await?;
            out.insert(
                lane_text,
                LaneCheckpoint {
                    completed,
                    total: progress.total,
                },
            );
        }

        Ok(CheckpointSnapshot {
            taken_at: Utc::now(),
            lanes: out,
        })
    }

    /// Import a snapshot. With `merge` the snapshot's checkpoints are
    /// added to what exists and completion only grows; without it each
    /// named lane is replaced wholesale. Lanes absent from the snapshot
    /// are never touched.
    pub async fn import_checkpoints(
        &self,
        snapshot: &CheckpointSnapshot,
        merge: bool,
    ) -> Result<u64> {
        let mut imported = 0u64;
        for (lane_text, cp) in &snapshot.lanes {
            let lane: LaneKey = lane_text.parse()?;
            if !merge {
                self.reset_checkpoints(&lane).await?;
            }
            imported += self.mark_completed_batch(&lane, &cp.completed).await?;
            // Merge keeps the larger total so completion never regresses.
            let total = if merge {
                self.progress(&lane).await?.total.max(cp.total)
            } else {
                cp.total
            };
            self.set_total(&lane, total).await?;
        }
        Ok(imported)
    }
}

/// Re-derive `lane_progress.completed` from the checkpoint rows, inside
/// the caller's transaction.
async fn recompute_completed(tx: &mut PgTransaction<'_>, lane: &LaneKey) -> Result<()> {
    let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM checkpoints WHERE lane = $1")
        .bind(lane.to_string())
        .fetch_one(&mut **tx)
        .await?;
    sqlx::query(
        "INSERT INTO lane_progress (lane, completed, total, updated_at)
         VALUES ($1, $2, 0, now())
         ON CONFLICT (lane) DO UPDATE SET completed = $2, updated_at = now()",
    )
    .bind(lane.to_string())
    .bind(count)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
