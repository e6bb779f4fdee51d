//! In-memory lease provider

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    expires_after, Lease, LeaseError, LeaseInvalidated, LeaseProvider, INVALIDATION_CAPACITY,
};

/// In-memory lease provider
///
/// Shared through an `Arc` it behaves like a coordination service seen by
/// several processes.
pub struct InMemoryLeaseProvider {
    leases: Mutex<HashMap<String, Lease>>,
    invalidations: broadcast::Sender<LeaseInvalidated>,
}

impl InMemoryLeaseProvider {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self {
            leases: Mutex::new(HashMap::new()),
            invalidations,
        }
    }

    /// Drop the lease on `key` and notify its holder (for testing)
    pub fn revoke(&self, key: &str) -> bool {
        let removed = self.leases.lock().remove(key);
        match removed {
            Some(lease) => {
                self.notify(lease);
                true
            }
            None => false,
        }
    }

    /// Number of unexpired leases
    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        self.leases
            .lock()
            .values()
            .filter(|l| !l.is_expired(now))
            .count()
    }

    fn notify(&self, lease: Lease) {
        debug!(key = %lease.key, owner = %lease.owner, "lease invalidated");
        // No subscribers is fine
        let _ = self.invalidations.send(LeaseInvalidated {
            key: lease.key,
            owner: lease.owner,
        });
    }
}

impl Default for InMemoryLeaseProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseProvider for InMemoryLeaseProvider {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, LeaseError> {
        let now = Utc::now();
        let mut leases = self.leases.lock();

        let previous = match leases.get(key) {
            Some(current) if !current.is_expired(now) => return Ok(None),
            Some(expired) => Some(expired.clone()),
            None => None,
        };

        let lease = Lease::new(key, owner, ttl);
        leases.insert(key.to_string(), lease.clone());
        drop(leases);

        if let Some(previous) = previous {
            self.notify(previous);
        }
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LeaseError> {
        let mut leases = self.leases.lock();
        match leases.get_mut(&lease.key) {
            Some(current) if current.token == lease.token => {
                current.expires_at = expires_after(ttl);
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let mut leases = self.leases.lock();
        match leases.get(&lease.key) {
            Some(current) if current.token == lease.token => {
                leases.remove(&lease.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<LeaseInvalidated> {
        self.invalidations.subscribe()
    }
}
