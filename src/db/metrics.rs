//! Per-lane item-outcome counters, consumed by the health monitor.

use opentelemetry::KeyValue;

use crate::error::Result;
use crate::model::{ItemDisposition, LaneKey, LaneMetrics};
use crate::telemetry::metrics;

impl super::Db {
    /// Tally one terminal item outcome for a lane.
    pub async fn record_outcome(
        &self,
        lane: &LaneKey,
        disposition: ItemDisposition,
    ) -> Result<()> {
        let (succ, malf, fail) = match disposition {
            ItemDisposition::Succeeded => (1i64, 0i64, 0i64),
            ItemDisposition::Malformed => (0, 1, 0),
            ItemDisposition::Failed => (0, 0, 1),
        };
        sqlx::query(
            "INSERT INTO lane_metrics (lane, total_items, succeeded, malformed, failed, updated_at)
             VALUES ($1, 1, $2, $3, $4, now())
             ON CONFLICT (lane) DO UPDATE
             SET total_items = lane_metrics.total_items + 1,
                 succeeded = lane_metrics.succeeded + $2,
                 malformed = lane_metrics.malformed + $3,
                 failed = lane_metrics.failed + $4,
                 updated_at = now()",
        )
        .bind(lane.to_string())
        .bind(succ)
        .bind(malf)
        .bind(fail)
        .execute(&self.pool)
        .await?;

        metrics::items_processed().add(
            1,
            &[
                KeyValue::new("lane", lane.to_string()),
                KeyValue::new("disposition", disposition.as_str()),
            ],
        );
        Ok(())
    }

    /// Outcome counters for a lane. Unknown lanes read as all zeros.
    pub async fn lane_metrics(&self, lane: &LaneKey) -> Result<LaneMetrics> {
        let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT total_items, succeeded, malformed, failed
             FROM lane_metrics WHERE lane = $1",
        )
        .bind(lane.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|(total_items, succeeded, malformed, failed)| LaneMetrics {
                total_items,
                succeeded,
                malformed,
                failed,
            })
            .unwrap_or_default())
    }

    /// Drop outcome counters for one lane.
    pub async fn reset_lane_metrics(&self, lane: &LaneKey) -> Result<()> {
        sqlx::query("DELETE FROM lane_metrics WHERE lane = $1")
            .bind(lane.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
