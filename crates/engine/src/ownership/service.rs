//! Ownership backed by `trace:<id>` leases

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{trace_lease_key, OwnershipService};
use crate::lease::{Lease, LeaseError, LeaseInvalidated, LeaseProvider};

struct OwnedTrace {
    trans_id: Uuid,
    lease: Lease,
    claimed_at: Instant,
}

/// [`OwnershipService`] over a [`LeaseProvider`]
pub struct LeaseOwnershipService {
    provider: Arc<dyn LeaseProvider>,
    owner: String,
    ttl: Duration,
    protect: Duration,
    owned: DashMap<Uuid, OwnedTrace>,
}

impl LeaseOwnershipService {
    pub fn new(
        provider: Arc<dyn LeaseProvider>,
        owner: impl Into<String>,
        ttl: Duration,
        protect: Duration,
    ) -> Self {
        Self {
            provider,
            owner: owner.into(),
            ttl,
            protect,
            owned: DashMap::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Drop ownership as soon as the provider announces a lost lease
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut invalidations = self.provider.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = invalidations.recv() => match event {
                        Ok(event) => {
                            service.remove_invalid_trace(&event);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "missed lease invalidations, renewing all");
                            if let Err(e) = service.renew().await {
                                warn!(error = %e, "renew after lag failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("invalidation listener stopped");
        })
    }

    fn insert(&self, trace_id: Uuid, trans_id: Uuid, lease: Lease) {
        self.owned.insert(
            trace_id,
            OwnedTrace {
                trans_id,
                lease,
                claimed_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl OwnershipService for LeaseOwnershipService {
    async fn own(&self, trace_id: Uuid, trans_id: Uuid) -> Result<bool, LeaseError> {
        if self.is_own(trace_id) {
            return Ok(true);
        }
        let key = trace_lease_key(trace_id);
        match self.provider.acquire(&key, &self.owner, self.ttl, self.ttl).await? {
            Some(lease) => {
                self.insert(trace_id, trans_id, lease);
                debug!(%trace_id, owner = %self.owner, "owned trace");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn try_own(&self, trace_id: Uuid, trans_id: Uuid) -> Result<bool, LeaseError> {
        if self.is_own(trace_id) {
            return Ok(true);
        }
        let key = trace_lease_key(trace_id);
        match self.provider.try_acquire(&key, &self.owner, self.ttl).await? {
            Some(lease) => {
                self.insert(trace_id, trans_id, lease);
                info!(%trace_id, owner = %self.owner, "adopted trace");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, trace_id: Uuid) -> Result<(), LeaseError> {
        if let Some((_, owned)) = self.owned.remove(&trace_id) {
            self.provider.release(&owned.lease).await?;
            debug!(%trace_id, "released trace");
        }
        Ok(())
    }

    fn is_own(&self, trace_id: Uuid) -> bool {
        self.owned.contains_key(&trace_id)
    }

    fn traces(&self) -> Vec<Uuid> {
        self.owned.iter().map(|entry| *entry.key()).collect()
    }

    fn traces_of_trans(&self, trans_id: Uuid) -> Vec<Uuid> {
        self.owned
            .iter()
            .filter(|entry| entry.trans_id == trans_id)
            .map(|entry| *entry.key())
            .collect()
    }

    fn remove_invalid_trace(&self, invalidated: &LeaseInvalidated) -> Option<Uuid> {
        if invalidated.owner != self.owner {
            return None;
        }
        let trace_id = invalidated
            .key
            .strip_prefix("trace:")
            .and_then(|id| Uuid::parse_str(id).ok())?;

        let removed = self
            .owned
            .remove_if(&trace_id, |_, owned| owned.lease.key == invalidated.key);
        removed.map(|(trace_id, _)| {
            warn!(%trace_id, owner = %self.owner, "lost trace ownership");
            trace_id
        })
    }

    fn is_in_protect_time(&self, trace_id: Uuid) -> bool {
        self.owned
            .get(&trace_id)
            .map(|owned| owned.claimed_at.elapsed() < self.protect)
            .unwrap_or(false)
    }

    async fn renew(&self) -> Result<usize, LeaseError> {
        let leases: Vec<(Uuid, Lease)> = self
            .owned
            .iter()
            .map(|entry| (*entry.key(), entry.lease.clone()))
            .collect();

        let mut lost = 0;
        for (trace_id, lease) in leases {
            match self.provider.renew(&lease, self.ttl).await? {
                Some(renewed) => {
                    if let Some(mut owned) = self.owned.get_mut(&trace_id) {
                        owned.lease = renewed;
                    }
                }
                None => {
                    self.owned.remove(&trace_id);
                    warn!(%trace_id, "trace lease lost before renew");
                    lost += 1;
                }
            }
        }
        Ok(lost)
    }
}
