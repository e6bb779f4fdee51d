//! PostgreSQL lease provider
//!
//! Leases are rows in `flow_leases`; an insert takes over a row only when its
//! `expires_at` has passed. Invalidations are detected locally, when a renew
//! finds the row gone or owned by another token.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::broadcast;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{Lease, LeaseError, LeaseInvalidated, LeaseProvider, INVALIDATION_CAPACITY};

/// PostgreSQL lease provider
#[derive(Clone)]
pub struct PostgresLeaseProvider {
    pool: PgPool,
    invalidations: broadcast::Sender<LeaseInvalidated>,
}

impl PostgresLeaseProvider {
    pub fn new(pool: PgPool) -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self {
            pool,
            invalidations,
        }
    }
}

#[async_trait]
impl LeaseProvider for PostgresLeaseProvider {
    #[instrument(skip(self))]
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, LeaseError> {
        let token = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            INSERT INTO flow_leases (key, owner, token, expires_at)
            VALUES ($1, $2, $3, NOW() + $4 * INTERVAL '1 millisecond')
            ON CONFLICT (key) DO UPDATE
            SET owner = EXCLUDED.owner, token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
            WHERE flow_leases.expires_at < NOW()
            RETURNING expires_at
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(token)
        .bind(ttl.as_millis() as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to acquire lease: {}", e);
            LeaseError::Backend(e.to_string())
        })?;

        Ok(row.map(|row| Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            token,
            expires_at: row.get("expires_at"),
        }))
    }

    #[instrument(skip(self, lease), fields(key = %lease.key))]
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LeaseError> {
        let row = sqlx::query(
            r#"
            UPDATE flow_leases
            SET expires_at = NOW() + $3 * INTERVAL '1 millisecond'
            WHERE key = $1 AND token = $2
            RETURNING expires_at
            "#,
        )
        .bind(&lease.key)
        .bind(lease.token)
        .bind(ttl.as_millis() as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LeaseError::Backend(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(Lease {
                expires_at: row.get("expires_at"),
                ..lease.clone()
            })),
            None => {
                debug!("lease lost before renew");
                let _ = self.invalidations.send(LeaseInvalidated {
                    key: lease.key.clone(),
                    owner: lease.owner.clone(),
                });
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, lease), fields(key = %lease.key))]
    async fn release(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let result = sqlx::query("DELETE FROM flow_leases WHERE key = $1 AND token = $2")
            .bind(&lease.key)
            .bind(lease.token)
            .execute(&self.pool)
            .await
            .map_err(|e| LeaseError::Backend(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    fn subscribe(&self) -> broadcast::Receiver<LeaseInvalidated> {
        self.invalidations.subscribe()
    }
}
