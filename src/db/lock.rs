//! Exclusive operation leases with TTL.
//!
//! One lease per operation type. Claiming and stealing an expired lease
//! happen in a single statement, so two contenders can never both win.
//! Release is best effort — a crashed holder's lease simply expires.

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};

/// A held operation lease. Pass the token back to release.
#[derive(Debug, Clone)]
pub struct OpLease {
    pub op_type: String,
    pub token: uuid::Uuid,
    pub expires_at: DateTime<Utc>,
}

impl super::Db {
    /// Claim the lease for an operation type.
    ///
    /// Succeeds when no lease row exists or the existing one has expired.
    /// Returns [`Error::LockBusy`] when a live lease is held.
    pub async fn claim_op_lease(&self, op_type: &str, ttl_secs: i64) -> Result<OpLease> {
        let token = uuid::Uuid::new_v4();
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_secs);

        let rows_affected = sqlx::query(
            "INSERT INTO op_locks (op_type, token, acquired_at, expires_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (op_type) DO UPDATE
             SET token = $2, acquired_at = $3, expires_at = $4
             WHERE op_locks.expires_at <= $3",
        )
        .bind(op_type)
        .bind(token)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::LockBusy {
                op_type: op_type.to_string(),
            });
        }

        Ok(OpLease {
            op_type: op_type.to_string(),
            token,
            expires_at,
        })
    }

    /// Release a lease. Only removes the row if the token still matches,
    /// so a slow holder cannot release a lease someone else re-claimed
    /// after expiry.
    pub async fn release_op_lease(&self, lease: &OpLease) -> Result<bool> {
        let rows_affected = sqlx::query(
            "DELETE FROM op_locks WHERE op_type = $1 AND token = $2",
        )
        .bind(&lease.op_type)
        .bind(lease.token)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Inspect the current lease for an operation type, live or expired.
    pub async fn current_op_lease(&self, op_type: &str) -> Result<Option<OpLease>> {
        let row: Option<(uuid::Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT token, expires_at FROM op_locks WHERE op_type = $1",
        )
        .bind(op_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(token, expires_at)| OpLease {
            op_type: op_type.to_string(),
            token,
            expires_at,
        }))
    }

    /// Drop every lease row. Used by factory reset.
    pub async fn clear_op_leases(&self) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM op_locks")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }
}
