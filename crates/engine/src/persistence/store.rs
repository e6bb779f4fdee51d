//! Store traits for contexts, traces and retry tickets

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    Context, ContextStatus, InvalidTransition, RetryTicket, Trace, TraceStatus, TransCompletion,
};

/// Error type for store operations
///
/// Lost optimistic races are not errors: conditional operations report the
/// number of rows they changed and callers treat zero as "someone else won".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write would break the context state machine
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Atomic claim of a retry batch
///
/// Applied as one transaction: the ticket moves only if its retry count is
/// still `expected_retry_count`, and every context in `context_ids` must
/// still be RETRYABLE under `batch_key`. Otherwise nothing changes.
#[derive(Debug, Clone)]
pub struct BatchClaim {
    pub batch_key: String,
    pub expected_retry_count: u32,
    pub context_ids: Vec<Uuid>,
    pub retried_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
}

/// Context persistence
#[async_trait]
pub trait ContextStore: Send + Sync + 'static {
    /// Insert new contexts and attach their ids to every trace they belong to
    async fn insert_contexts(&self, contexts: &[Context]) -> Result<(), StoreError>;

    /// Get one context
    async fn get_context(&self, id: Uuid) -> Result<Option<Context>, StoreError>;

    /// Get every existing context among `ids` (missing ids are skipped)
    async fn get_contexts(&self, ids: &[Uuid]) -> Result<Vec<Context>, StoreError>;

    /// All contexts that belong to a trace
    async fn contexts_by_trace(&self, trace_id: Uuid) -> Result<Vec<Context>, StoreError>;

    /// Replace full context rows, all-or-nothing
    ///
    /// Every row must still have status `expected`; if any does not, nothing
    /// is written and 0 is returned. Otherwise returns the number of rows.
    async fn update_contexts(
        &self,
        contexts: &[Context],
        expected: ContextStatus,
    ) -> Result<u64, StoreError>;

    /// Move every context among `ids` whose status is in `from` to `to`
    ///
    /// Clears the batch key unless `to` is RETRYABLE. Returns rows changed.
    async fn update_status_if(
        &self,
        ids: &[Uuid],
        from: &[ContextStatus],
        to: ContextStatus,
    ) -> Result<u64, StoreError>;
}

/// Trace and trans persistence
#[async_trait]
pub trait TraceStore: Send + Sync + 'static {
    /// Get one trace
    async fn get_trace(&self, id: Uuid) -> Result<Option<Trace>, StoreError>;

    /// All traces of a trans
    async fn traces_of_trans(&self, trans_id: Uuid) -> Result<Vec<Trace>, StoreError>;

    /// RUNNING traces, oldest first
    async fn running_traces(&self, limit: usize) -> Result<Vec<Trace>, StoreError>;

    /// Set a terminal status on a RUNNING trace
    ///
    /// Returns 0 if the trace is missing or already terminal.
    async fn finish_trace(&self, id: Uuid, status: TraceStatus) -> Result<u64, StoreError>;

    /// Record that a trans completed, only if no marker exists yet
    async fn record_trans_completion(
        &self,
        completion: &TransCompletion,
    ) -> Result<u64, StoreError>;

    /// Get the completion marker of a trans
    async fn get_trans_completion(
        &self,
        trans_id: Uuid,
    ) -> Result<Option<TransCompletion>, StoreError>;
}

/// Retry ticket persistence
#[async_trait]
pub trait RetryTicketStore: Send + Sync + 'static {
    /// Get a ticket by batch key
    async fn get_ticket(&self, batch_key: &str) -> Result<Option<RetryTicket>, StoreError>;

    /// Tickets whose next retry time has elapsed, earliest first
    async fn due_tickets(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryTicket>, StoreError>;

    /// Cheap check used by the scheduler before waking the sweep
    async fn has_due_tickets(&self, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Delete a ticket, returning rows removed
    async fn delete_ticket(&self, batch_key: &str) -> Result<u64, StoreError>;
}

/// Compound operations that must be atomic across the three stores
#[async_trait]
pub trait FlowStore: ContextStore + TraceStore + RetryTicketStore {
    /// Persist new traces together with their initial contexts
    async fn create_run(&self, traces: &[Trace], contexts: &[Context]) -> Result<(), StoreError>;

    /// Replace `finished` (still in `expected`) and insert its successors
    ///
    /// Returns 0 without writing anything if `finished` moved meanwhile.
    async fn advance(
        &self,
        finished: &Context,
        expected: ContextStatus,
        successors: &[Context],
    ) -> Result<u64, StoreError>;

    /// Store RETRYABLE contexts (all still in `expected`) and create their
    /// ticket unless one already exists for the batch key
    async fn park_retryable(
        &self,
        contexts: &[Context],
        expected: ContextStatus,
        ticket: &RetryTicket,
    ) -> Result<u64, StoreError>;

    /// Claim a retry batch, see [`BatchClaim`]
    ///
    /// Returns 1 when the claim won, 0 when it lost the race.
    async fn claim_retry_batch(&self, claim: &BatchClaim) -> Result<u64, StoreError>;

    /// Delete a trace together with its contexts and their tickets
    async fn delete_run(&self, trace_id: Uuid) -> Result<u64, StoreError>;
}
