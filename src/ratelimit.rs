//! Distributed token-bucket rate limiter backed by the shared store.
//!
//! One bucket row per identity. The read-modify-write runs inside a
//! transaction holding a row lock (`SELECT ... FOR UPDATE`), so two
//! workers can never both spend the same token. The bucket math itself
//! is pure and tested without a database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use crate::db::Db;
use crate::error::Result;
use crate::telemetry::metrics;

/// Outcome of one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Granted { remaining: f64 },
    /// Not enough tokens. `wait` is how long until the deficit refills.
    Denied { wait: Duration },
}

impl RateDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, RateDecision::Granted { .. })
    }
}

/// Tokens in the bucket after `elapsed_secs` of refill, capped at capacity.
/// Time never removes tokens: negative elapsed (clock skew) refills nothing.
pub fn refill(tokens: f64, capacity: f64, refill_per_sec: f64, elapsed_secs: f64) -> f64 {
    let elapsed = elapsed_secs.max(0.0);
    capacity.min(tokens + elapsed * refill_per_sec)
}

/// Apply one acquisition against a refilled bucket. Returns the tokens
/// to persist and the decision. A denial still persists the refilled
/// value so the refill is not lost.
pub fn apply(tokens: f64, cost: f64, refill_per_sec: f64) -> (f64, RateDecision) {
    if tokens >= cost {
        let remaining = tokens - cost;
        (remaining, RateDecision::Granted { remaining })
    } else {
        let deficit = cost - tokens;
        let wait = Duration::from_secs_f64(deficit / refill_per_sec);
        (tokens, RateDecision::Denied { wait })
    }
}

/// Shared-store token bucket. Cheap to clone per worker.
#[derive(Clone)]
pub struct RateLimiter {
    db: Arc<Db>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(db: Arc<Db>, capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            db,
            capacity,
            refill_per_sec,
        }
    }

    /// Try to take `cost` tokens for an identity. Never blocks; a denial
    /// carries the suggested wait.
    pub async fn acquire(&self, identity: &str, cost: f64) -> Result<RateDecision> {
        let now = Utc::now();
        let mut tx = self.db.pool().begin().await?;

        // Row lock serializes concurrent acquisitions for this identity.
        let row: Option<(f64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT tokens, updated_at FROM rate_buckets WHERE identity = $1 FOR UPDATE",
        )
        .bind(identity)
        .fetch_optional(&mut *tx)
        .await?;

        let (tokens, last) = match row {
            Some((tokens, updated_at)) => (tokens, updated_at),
            None => {
                // First sight of this identity: bucket starts full.
                let inserted = sqlx::query(
                    "INSERT INTO rate_buckets (identity, tokens, updated_at)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (identity) DO NOTHING",
                )
                .bind(identity)
                .bind(self.capacity)
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if inserted == 1 {
                    // Our insert holds the row lock.
                    (self.capacity, now)
                } else {
                    // Lost the insert race. DO NOTHING takes no row lock,
                    // so the winner's bucket must be re-read under FOR
                    // UPDATE; assuming a full bucket here would let every
                    // racer spend the same tokens.
                    sqlx::query_as(
                        "SELECT tokens, updated_at FROM rate_buckets
                         WHERE identity = $1 FOR UPDATE",
                    )
                    .bind(identity)
                    .fetch_one(&mut *tx)
                    .await?
                }
            }
        };

        let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
        let refilled = refill(tokens, self.capacity, self.refill_per_sec, elapsed);
        let (persist, decision) = apply(refilled, cost, self.refill_per_sec);

        sqlx::query("UPDATE rate_buckets SET tokens = $1, updated_at = $2 WHERE identity = $3")
            .bind(persist)
            .bind(now)
            .bind(identity)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        match decision {
            RateDecision::Granted { .. } => {
                metrics::rate_limit_attempts().add(
                    1,
                    &[
                        KeyValue::new("identity", identity.to_string()),
                        KeyValue::new("result", "granted"),
                    ],
                );
            }
            RateDecision::Denied { wait } => {
                metrics::rate_limit_attempts().add(
                    1,
                    &[
                        KeyValue::new("identity", identity.to_string()),
                        KeyValue::new("result", "denied"),
                    ],
                );
                metrics::rate_limit_wait_ms().record(
                    wait.as_secs_f64() * 1000.0,
                    &[KeyValue::new("identity", identity.to_string())],
                );
            }
        }

        Ok(decision)
    }

    /// Acquire, sleeping out denials until a token is granted.
    pub async fn acquire_blocking(&self, identity: &str, cost: f64) -> Result<()> {
        loop {
            match self.acquire(identity, cost).await? {
                RateDecision::Granted { .. } => return Ok(()),
                RateDecision::Denied { wait } => {
                    tracing::debug!(identity, wait_ms = wait.as_millis() as u64, "rate limited");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Tokens currently available, after notional refill, without spending.
    pub async fn peek(&self, identity: &str) -> Result<f64> {
        let row: Option<(f64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT tokens, updated_at FROM rate_buckets WHERE identity = $1",
        )
        .bind(identity)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(match row {
            Some((tokens, updated_at)) => {
                let elapsed = (Utc::now() - updated_at).num_milliseconds() as f64 / 1000.0;
                refill(tokens, self.capacity, self.refill_per_sec, elapsed)
            }
            None => self.capacity,
        })
    }

    /// How long an acquisition of `cost` would have to wait right now.
    /// Zero when the tokens are already there. Read-only; nothing is
    /// spent or persisted.
    pub async fn wait_time(&self, identity: &str, cost: f64) -> Result<Duration> {
        let tokens = self.peek(identity).await?;
        if tokens >= cost {
            return Ok(Duration::ZERO);
        }
        Ok(Duration::from_secs_f64((cost - tokens) / self.refill_per_sec))
    }

    /// Forget an identity's bucket; its next acquisition starts full.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_buckets WHERE identity = $1")
            .bind(identity)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Forget every bucket. Used by factory reset.
    pub async fn reset_all(&self) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM rate_buckets")
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(rows)
    }
}
