//! In-memory implementation of FlowStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::model::{Context, ContextStatus, RetryTicket, Trace, TraceStatus, TransCompletion};

#[derive(Default)]
struct State {
    contexts: HashMap<Uuid, Context>,
    traces: HashMap<Uuid, Trace>,
    tickets: HashMap<String, RetryTicket>,
    completions: HashMap<Uuid, TransCompletion>,
}

impl State {
    fn insert_contexts(&mut self, contexts: &[Context]) {
        for ctx in contexts {
            for trace_id in &ctx.trace_ids {
                if let Some(trace) = self.traces.get_mut(trace_id) {
                    trace.context_ids.insert(ctx.id);
                }
            }
            self.contexts.insert(ctx.id, ctx.clone());
        }
    }

    fn all_in(&self, contexts: &[Context], expected: ContextStatus) -> bool {
        contexts.iter().all(|ctx| {
            self.contexts
                .get(&ctx.id)
                .map(|stored| stored.status == expected)
                .unwrap_or(false)
        })
    }

    fn replace(&mut self, contexts: &[Context]) -> u64 {
        for ctx in contexts {
            self.contexts.insert(ctx.id, ctx.clone());
        }
        contexts.len() as u64
    }
}

/// In-memory implementation of [`FlowStore`]
///
/// Every compound operation runs under one write lock, which gives it the
/// same all-or-nothing semantics as a database transaction. Several engine
/// instances sharing one `Arc<InMemoryFlowStore>` behave like processes
/// sharing one database.
///
/// # Example
///
/// ```
/// use flowmesh_engine::persistence::InMemoryFlowStore;
///
/// let store = InMemoryFlowStore::new();
/// assert_eq!(store.context_count(), 0);
/// ```
pub struct InMemoryFlowStore {
    state: RwLock<State>,
}

impl InMemoryFlowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Get the number of contexts
    pub fn context_count(&self) -> usize {
        self.state.read().contexts.len()
    }

    /// Get the number of retry tickets
    pub fn ticket_count(&self) -> usize {
        self.state.read().tickets.len()
    }

    /// All contexts currently in `status`
    pub fn contexts_in(&self, status: ContextStatus) -> Vec<Context> {
        self.state
            .read()
            .contexts
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect()
    }

    /// All retry tickets (for assertions)
    pub fn tickets(&self) -> Vec<RetryTicket> {
        self.state.read().tickets.values().cloned().collect()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = State::default();
    }
}

impl Default for InMemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextStore for InMemoryFlowStore {
    async fn insert_contexts(&self, contexts: &[Context]) -> Result<(), StoreError> {
        self.state.write().insert_contexts(contexts);
        Ok(())
    }

    async fn get_context(&self, id: Uuid) -> Result<Option<Context>, StoreError> {
        Ok(self.state.read().contexts.get(&id).cloned())
    }

    async fn get_contexts(&self, ids: &[Uuid]) -> Result<Vec<Context>, StoreError> {
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.contexts.get(id).cloned())
            .collect())
    }

    async fn contexts_by_trace(&self, trace_id: Uuid) -> Result<Vec<Context>, StoreError> {
        let state = self.state.read();
        let mut contexts: Vec<Context> = state
            .contexts
            .values()
            .filter(|c| c.belongs_to(trace_id))
            .cloned()
            .collect();
        contexts.sort_by_key(|c| c.id);
        Ok(contexts)
    }

    async fn update_contexts(
        &self,
        contexts: &[Context],
        expected: ContextStatus,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        if !state.all_in(contexts, expected) {
            return Ok(0);
        }
        Ok(state.replace(contexts))
    }

    async fn update_status_if(
        &self,
        ids: &[Uuid],
        from: &[ContextStatus],
        to: ContextStatus,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut changed = 0;
        for id in ids {
            if let Some(ctx) = state.contexts.get_mut(id) {
                if from.contains(&ctx.status) {
                    ctx.status = to;
                    if to != ContextStatus::Retryable {
                        ctx.batch_key = None;
                    }
                    ctx.updated_at = now;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl TraceStore for InMemoryFlowStore {
    async fn get_trace(&self, id: Uuid) -> Result<Option<Trace>, StoreError> {
        Ok(self.state.read().traces.get(&id).cloned())
    }

    async fn traces_of_trans(&self, trans_id: Uuid) -> Result<Vec<Trace>, StoreError> {
        let state = self.state.read();
        let mut traces: Vec<Trace> = state
            .traces
            .values()
            .filter(|t| t.trans_id == trans_id)
            .cloned()
            .collect();
        traces.sort_by_key(|t| t.id);
        Ok(traces)
    }

    async fn running_traces(&self, limit: usize) -> Result<Vec<Trace>, StoreError> {
        let state = self.state.read();
        let mut traces: Vec<Trace> = state
            .traces
            .values()
            .filter(|t| t.status == TraceStatus::Running)
            .cloned()
            .collect();
        traces.sort_by_key(|t| t.started_at);
        traces.truncate(limit);
        Ok(traces)
    }

    async fn finish_trace(&self, id: Uuid, status: TraceStatus) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        match state.traces.get_mut(&id) {
            Some(trace) if trace.status == TraceStatus::Running && status.is_terminal() => {
                trace.status = status;
                trace.ended_at = Some(Utc::now());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn record_trans_completion(
        &self,
        completion: &TransCompletion,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        if state.completions.contains_key(&completion.trans_id) {
            return Ok(0);
        }
        state
            .completions
            .insert(completion.trans_id, completion.clone());
        Ok(1)
    }

    async fn get_trans_completion(
        &self,
        trans_id: Uuid,
    ) -> Result<Option<TransCompletion>, StoreError> {
        Ok(self.state.read().completions.get(&trans_id).cloned())
    }
}

#[async_trait]
impl RetryTicketStore for InMemoryFlowStore {
    async fn get_ticket(&self, batch_key: &str) -> Result<Option<RetryTicket>, StoreError> {
        Ok(self.state.read().tickets.get(batch_key).cloned())
    }

    async fn due_tickets(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryTicket>, StoreError> {
        let state = self.state.read();
        let mut due: Vec<RetryTicket> = state
            .tickets
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn has_due_tickets(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.state.read().tickets.values().any(|t| t.is_due(now)))
    }

    async fn delete_ticket(&self, batch_key: &str) -> Result<u64, StoreError> {
        Ok(self.state.write().tickets.remove(batch_key).map_or(0, |_| 1))
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn create_run(&self, traces: &[Trace], contexts: &[Context]) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for trace in traces {
            state.traces.insert(trace.id, trace.clone());
        }
        state.insert_contexts(contexts);
        Ok(())
    }

    async fn advance(
        &self,
        finished: &Context,
        expected: ContextStatus,
        successors: &[Context],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        if !state.all_in(std::slice::from_ref(finished), expected) {
            return Ok(0);
        }
        state.replace(std::slice::from_ref(finished));
        state.insert_contexts(successors);
        Ok(1)
    }

    async fn park_retryable(
        &self,
        contexts: &[Context],
        expected: ContextStatus,
        ticket: &RetryTicket,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        if !state.all_in(contexts, expected) {
            return Ok(0);
        }
        let changed = state.replace(contexts);
        state
            .tickets
            .entry(ticket.entity_id.clone())
            .and_modify(|existing| {
                existing
                    .context_ids
                    .extend(ticket.context_ids.iter().copied())
            })
            .or_insert_with(|| ticket.clone());
        Ok(changed)
    }

    async fn claim_retry_batch(&self, claim: &BatchClaim) -> Result<u64, StoreError> {
        let mut state = self.state.write();

        let ticket_matches = state
            .tickets
            .get(&claim.batch_key)
            .map(|t| t.retry_count == claim.expected_retry_count)
            .unwrap_or(false);
        let batch_intact = !claim.context_ids.is_empty()
            && claim.context_ids.iter().all(|id| {
                state
                    .contexts
                    .get(id)
                    .map(|c| {
                        c.status == ContextStatus::Retryable
                            && c.batch_key.as_deref() == Some(claim.batch_key.as_str())
                    })
                    .unwrap_or(false)
            });
        if !ticket_matches || !batch_intact {
            return Ok(0);
        }

        if let Some(ticket) = state.tickets.get_mut(&claim.batch_key) {
            ticket.retry_count += 1;
            ticket.last_retry_at = Some(claim.retried_at);
            ticket.next_retry_at = claim.next_retry_at;
        }
        for id in &claim.context_ids {
            if let Some(ctx) = state.contexts.get_mut(id) {
                ctx.status = ContextStatus::Ready;
                ctx.batch_key = None;
                ctx.updated_at = claim.retried_at;
            }
        }
        Ok(1)
    }

    async fn delete_run(&self, trace_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let Some(trace) = state.traces.remove(&trace_id) else {
            return Ok(0);
        };

        // Contexts shared with another trace survive, minus this trace id
        let mut removed = vec![];
        for id in &trace.context_ids {
            if let Some(ctx) = state.contexts.get_mut(id) {
                ctx.trace_ids.remove(&trace_id);
                if ctx.trace_ids.is_empty() {
                    removed.push(*id);
                }
            }
        }
        for id in &removed {
            state.contexts.remove(id);
        }
        state
            .tickets
            .retain(|_, t| !t.context_ids.iter().all(|id| removed.contains(id)));
        Ok(1)
    }
}
