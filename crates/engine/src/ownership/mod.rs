//! Trace ownership
//!
//! Exactly one process computes the status of a trace and sweeps its retry
//! batches. Ownership is a soft lease: it expires unless renewed, and an
//! expired trace can be adopted by another process.

mod service;

use async_trait::async_trait;
use uuid::Uuid;

use crate::lease::{LeaseError, LeaseInvalidated};

pub use service::LeaseOwnershipService;

/// Lease key of a trace
pub fn trace_lease_key(trace_id: Uuid) -> String {
    format!("trace:{trace_id}")
}

/// Ownership of traces by this process
#[async_trait]
pub trait OwnershipService: Send + Sync + 'static {
    /// Claim a trace, waiting for a previous holder's lease if necessary
    async fn own(&self, trace_id: Uuid, trans_id: Uuid) -> Result<bool, LeaseError>;

    /// Claim a trace only if nobody holds it
    async fn try_own(&self, trace_id: Uuid, trans_id: Uuid) -> Result<bool, LeaseError>;

    /// Give a trace up
    async fn release(&self, trace_id: Uuid) -> Result<(), LeaseError>;

    fn is_own(&self, trace_id: Uuid) -> bool;

    fn is_any_own(&self, trace_ids: &[Uuid]) -> bool {
        trace_ids.iter().any(|id| self.is_own(*id))
    }

    /// Every trace owned by this process
    fn traces(&self) -> Vec<Uuid>;

    /// Owned traces of one trans
    fn traces_of_trans(&self, trans_id: Uuid) -> Vec<Uuid>;

    /// Drop local ownership behind an invalidated lease; returns the trace
    fn remove_invalid_trace(&self, invalidated: &LeaseInvalidated) -> Option<Uuid>;

    /// Whether the trace was claimed too recently to be released as missing
    fn is_in_protect_time(&self, trace_id: Uuid) -> bool;

    /// Extend every owned lease, dropping the ones that were lost
    async fn renew(&self) -> Result<usize, LeaseError>;
}
