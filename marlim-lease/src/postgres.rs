//! PostgreSQL lease manager.
//!
//! Backs the lease with a heartbeat row: a conditional upsert grants the
//! key only when no unexpired holder exists, and bumps the fencing token
//! on every change of holder. All time arithmetic happens on the database
//! clock, so holders on different machines cannot disagree about expiry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::{Lease, LeaseError, LeaseKey, LeaseManager};

/// Lease manager backed by a `leases` heartbeat table.
pub struct PgLeaseManager {
    pool: PgPool,
}

impl PgLeaseManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table if it does not exist.
    pub async fn init_schema(&self) -> Result<(), LeaseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                key         TEXT PRIMARY KEY,
                token       BIGINT NOT NULL,
                expires_at  TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LeaseError::Backend(e.to_string()))?;
        Ok(())
    }

    fn ttl_secs(ttl: Duration) -> f64 {
        ttl.as_secs_f64()
    }
}

#[async_trait]
impl LeaseManager for PgLeaseManager {
    async fn acquire(&self, key: &LeaseKey, ttl: Duration) -> Result<Lease, LeaseError> {
        let row: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            INSERT INTO leases (key, token, expires_at)
            VALUES ($1, 1, now() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE
                SET token = leases.token + 1,
                    expires_at = now() + make_interval(secs => $2)
                WHERE leases.expires_at <= now()
            RETURNING token, expires_at
            "#,
        )
        .bind(key.to_string())
        .bind(Self::ttl_secs(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LeaseError::Backend(e.to_string()))?;

        match row {
            Some((token, expires_at)) => {
                debug!(%key, token, "Lease acquired");
                Ok(Lease {
                    key: key.clone(),
                    token: token as u64,
                    expires_at,
                })
            },
            None => Err(LeaseError::Conflict(key.to_string())),
        }
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LeaseError> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            UPDATE leases
            SET expires_at = now() + make_interval(secs => $3)
            WHERE key = $1 AND token = $2 AND expires_at > now()
            RETURNING expires_at
            "#,
        )
        .bind(lease.key.to_string())
        .bind(lease.token as i64)
        .bind(Self::ttl_secs(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LeaseError::Backend(e.to_string()))?;

        match row {
            Some((expires_at,)) => Ok(Lease {
                key: lease.key.clone(),
                token: lease.token,
                expires_at,
            }),
            None => Err(LeaseError::Lost(lease.key.to_string())),
        }
    }

    async fn release(&self, lease: &Lease) {
        // Best effort: expire the row immediately so the next acquirer does
        // not wait out the TTL.
        let _ = sqlx::query(
            "UPDATE leases SET expires_at = now() WHERE key = $1 AND token = $2",
        )
        .bind(lease.key.to_string())
        .bind(lease.token as i64)
        .execute(&self.pool)
        .await;
    }
}
