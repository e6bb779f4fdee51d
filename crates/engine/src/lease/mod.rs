//! Named leases for cross-process mutual exclusion
//!
//! A lease is a time-bounded lock on a string key. Holders must finish (or
//! renew) before the TTL runs out; an expired lease can be taken over by
//! anyone, and the provider then announces the previous holder's lease as
//! invalidated on the [`LeaseProvider::subscribe`] channel.
//!
//! Keys used by the engine:
//! - `retry:<batch key>` around a retry batch claim
//! - `trans:<trans id>` around trans completion callbacks
//! - `trace:<trace id>` for trace ownership

mod memory;
mod postgres;

use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

pub use memory::InMemoryLeaseProvider;
pub use postgres::PostgresLeaseProvider;

/// Poll interval of the default blocking [`LeaseProvider::acquire`]
const ACQUIRE_POLL: Duration = Duration::from_millis(25);

/// Capacity of the invalidation channel
pub(crate) const INVALIDATION_CAPACITY: usize = 256;

/// Lease errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    /// Backend unavailable or failed
    #[error("lease backend error: {0}")]
    Backend(String),

    /// A blocking acquire gave up
    #[error("timed out waiting for lease {0}")]
    Timeout(String),
}

/// A held lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub owner: String,

    /// Distinguishes two acquisitions of the same key by the same owner
    pub token: Uuid,

    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(key: impl Into<String>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
            token: Uuid::now_v7(),
            expires_at: expires_after(ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Notification that a holder lost its lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInvalidated {
    pub key: String,
    pub owner: String,
}

/// Pluggable lease backend
#[async_trait]
pub trait LeaseProvider: Send + Sync + 'static {
    /// Acquire `key` if nobody holds an unexpired lease on it
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, LeaseError>;

    /// Acquire `key`, waiting up to `wait` for the current holder
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<Lease>, LeaseError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_acquire(key, owner, ttl).await? {
                return Ok(Some(lease));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    /// Extend a held lease; `None` means it was lost
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LeaseError>;

    /// Release a held lease; `false` if it was no longer held
    async fn release(&self, lease: &Lease) -> Result<bool, LeaseError>;

    /// Subscribe to lease invalidations
    fn subscribe(&self) -> broadcast::Receiver<LeaseInvalidated>;
}

/// Run `f` while holding `key`, releasing the lease afterwards
///
/// Returns `Ok(None)` without running `f` when the lease is held elsewhere.
/// The lease is released even when `f` panics; the panic then resumes.
pub async fn with_lease<F, Fut, T>(
    provider: &dyn LeaseProvider,
    key: &str,
    owner: &str,
    ttl: Duration,
    f: F,
) -> Result<Option<T>, LeaseError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let Some(lease) = provider.try_acquire(key, owner, ttl).await? else {
        return Ok(None);
    };

    let result = AssertUnwindSafe(f()).catch_unwind().await;
    release_quietly(provider, &lease).await;

    match result {
        Ok(result) => Ok(Some(result)),
        Err(panic) => resume_unwind(panic),
    }
}

/// Release a lease, logging instead of failing
pub(crate) async fn release_quietly(provider: &dyn LeaseProvider, lease: &Lease) {
    match provider.release(lease).await {
        Ok(true) => {}
        Ok(false) => warn!(key = %lease.key, "lease expired before release"),
        Err(e) => warn!(key = %lease.key, error = %e, "failed to release lease"),
    }
}

pub(crate) fn expires_after(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650))
}
