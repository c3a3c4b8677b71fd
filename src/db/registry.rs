//! Lane registry: durable status, pid, heartbeat, and error record per lane.
//!
//! Status changes use optimistic concurrency — the UPDATE carries the
//! expected current status, and zero rows affected means someone else
//! moved the lane first.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::model::{LaneKey, LaneStatus, RegistryEntry};
use crate::telemetry::metrics;

/// Validate a status transition, returning an error if disallowed.
fn validate_transition(from: LaneStatus, to: LaneStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

impl super::Db {
    /// Register a lane as launched: status Running, fresh pid and start
    /// time, heartbeat primed so the monitor does not immediately flag it.
    pub async fn register_launch(&self, lane: &LaneKey, pid: i32) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO lane_registry (lane, status, pid, started_at, last_heartbeat, processed_count, last_error, updated_at)
             VALUES ($1, 'running', $2, $3, $3, 0, NULL, $3)
             ON CONFLICT (lane) DO UPDATE
             SET status = 'running', pid = $2, started_at = $3, last_heartbeat = $3,
                 last_error = NULL, updated_at = $3",
        )
        .bind(lane.to_string())
        .bind(pid)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one lane's registry entry.
    pub async fn get_lane(&self, lane: &LaneKey) -> Result<RegistryEntry> {
        let row: Option<RegistryRow> = sqlx::query_as(
            "SELECT lane, status, pid, started_at, last_heartbeat, processed_count, last_error
             FROM lane_registry WHERE lane = $1",
        )
        .bind(lane.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("lane {lane}")))?
            .try_into_entry()
    }

    /// All registered lanes, ordered by key.
    pub async fn list_lanes(&self) -> Result<Vec<RegistryEntry>> {
        let rows: Vec<RegistryRow> = sqlx::query_as(
            "SELECT lane, status, pid, started_at, last_heartbeat, processed_count, last_error
             FROM lane_registry ORDER BY lane",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RegistryRow::try_into_entry).collect()
    }

    /// Lanes belonging to one owner.
    pub async fn list_owner_lanes(&self, owner: i32) -> Result<Vec<RegistryEntry>> {
        let rows: Vec<RegistryRow> = sqlx::query_as(
            "SELECT lane, status, pid, started_at, last_heartbeat, processed_count, last_error
             FROM lane_registry WHERE lane LIKE $1 ORDER BY lane",
        )
        .bind(format!("{owner}:%"))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RegistryRow::try_into_entry).collect()
    }

    /// Transition a lane's status with optimistic concurrency.
    pub async fn transition_status(
        &self,
        lane: &LaneKey,
        from: LaneStatus,
        to: LaneStatus,
    ) -> Result<()> {
        validate_transition(from, to)?;

        let rows_affected = sqlx::query(
            "UPDATE lane_registry SET status = $1, updated_at = now()
             WHERE lane = $2 AND status = $3",
        )
        .bind(to.to_string())
        .bind(lane.to_string())
        .bind(from.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::InvalidTransition { from, to });
        }

        metrics::lane_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        Ok(())
    }

    /// Mark a lane errored with the failure message. Unlike
    /// [`transition_status`] this does not contend — an error record must
    /// always land.
    pub async fn record_lane_error(&self, lane: &LaneKey, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE lane_registry SET status = 'error', last_error = $1, updated_at = now()
             WHERE lane = $2",
        )
        .bind(error)
        .bind(lane.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Worker liveness beat: refresh the heartbeat and publish the
    /// processed count for this run.
    pub async fn heartbeat(&self, lane: &LaneKey, processed_count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE lane_registry SET last_heartbeat = now(), processed_count = $1, updated_at = now()
             WHERE lane = $2",
        )
        .bind(processed_count)
        .bind(lane.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Scrub a lane's registry record as part of a reset: status Stopped,
    /// error and pid cleared, run counter zeroed. A reset lane reads
    /// clean. No-op for lanes that were never registered.
    pub async fn reset_lane_record(&self, lane: &LaneKey) -> Result<()> {
        sqlx::query(
            "UPDATE lane_registry
             SET status = 'stopped', last_error = NULL, pid = NULL,
                 processed_count = 0, updated_at = now()
             WHERE lane = $1",
        )
        .bind(lane.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record that a lane's process is gone (pid cleared).
    pub async fn clear_lane_pid(&self, lane: &LaneKey) -> Result<()> {
        sqlx::query("UPDATE lane_registry SET pid = NULL, updated_at = now() WHERE lane = $1")
            .bind(lane.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a lane from the registry entirely, along with its
    /// consumption flag.
    pub async fn remove_lane(&self, lane: &LaneKey) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("DELETE FROM lane_registry WHERE lane = $1")
            .bind(lane.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM lane_consumption WHERE lane = $1")
            .bind(lane.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Whether queue consumption is paused for a lane. Paused lanes keep
    /// their process alive but stop reading from their queue.
    pub async fn is_consumption_paused(&self, lane: &LaneKey) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT paused FROM lane_consumption WHERE lane = $1",
        )
        .bind(lane.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(paused,)| paused).unwrap_or(false))
    }

    /// Set the consumption-paused flag for a lane.
    pub async fn set_consumption_paused(&self, lane: &LaneKey, paused: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO lane_consumption (lane, paused, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (lane) DO UPDATE SET paused = $2, updated_at = now()",
        )
        .bind(lane.to_string())
        .bind(paused)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RegistryRow {
    lane: String,
    status: String,
    pid: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    processed_count: i64,
    last_error: Option<String>,
}

impl RegistryRow {
    fn try_into_entry(self) -> Result<RegistryEntry> {
        Ok(RegistryEntry {
            lane: self.lane.parse()?,
            status: self.status.parse()?,
            pid: self.pid,
            started_at: self.started_at,
            last_heartbeat: self.last_heartbeat,
            processed_count: self.processed_count,
            last_error: self.last_error,
        })
    }
}
