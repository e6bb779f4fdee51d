//! Retry sweep
//!
//! A sweep reads due tickets, keeps the batches this process owns and whose
//! node has room, and claims each one under the `retry:<batch key>` lease.
//! The claim itself is a conditional write on the ticket's retry count, so
//! two processes racing for the same batch never both resubmit it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{new_batch_key, Dispatch, Orchestrator};
use crate::error::Result;
use crate::lease::with_lease;
use crate::model::{Context, ContextStatus, RetryTicket};
use crate::node::{NodeFailure, RETRY_EXHAUSTED_KIND};
use crate::persistence::BatchClaim;

/// Lease key guarding a retry batch
pub fn retry_lease_key(batch_key: &str) -> String {
    format!("retry:{batch_key}")
}

/// Single-flight state of the sweep in this process
#[derive(Default)]
pub struct RetrySweeper {
    running: AtomicBool,
    candidates: Mutex<BTreeMap<String, RetryTicket>>,
}

impl RetrySweeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn begin(&self) -> Option<SweepGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard { sweeper: self })
    }

    fn stage(&self, ticket: RetryTicket) {
        self.candidates.lock().insert(ticket.entity_id.clone(), ticket);
    }

    fn drain(&self) -> Vec<RetryTicket> {
        std::mem::take(&mut *self.candidates.lock())
            .into_values()
            .collect()
    }
}

struct SweepGuard<'a> {
    sweeper: &'a RetrySweeper,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.sweeper.candidates.lock().clear();
        self.sweeper.running.store(false, Ordering::Release);
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Another sweep was already running; nothing was examined
    pub skipped: bool,

    pub examined: usize,
    pub claimed: usize,

    /// Claims that lost against another process
    pub lost: usize,

    /// Batches whose lease was held elsewhere
    pub busy: usize,

    /// Batches left alone because their node is saturated
    pub saturated: usize,

    /// Batches whose traces this process does not own
    pub not_owned: usize,

    /// Batches still executing from an earlier claim
    pub in_flight: usize,

    /// Tickets deleted because none of their contexts can be retried
    pub stale: usize,

    pub exhausted: usize,
}

/// Outcome of one claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClaimOutcome {
    Claimed,
    Lost,
    Busy,
    Stale,
    Exhausted,
    Saturated,
}

impl Orchestrator {
    /// Run one retry sweep
    ///
    /// At most one sweep runs per process; a concurrent call returns a
    /// skipped report.
    #[instrument(skip(self), fields(worker_id = %self.worker_id()))]
    pub async fn sweep_retries(&self) -> Result<SweepReport> {
        let sweeper = &self.inner.sweeper;
        let Some(_flight) = sweeper.begin() else {
            return Ok(SweepReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = SweepReport::default();
        let tickets = self
            .inner
            .store
            .due_tickets(Utc::now(), self.inner.config.sweep_batch_size)
            .await?;
        for ticket in tickets {
            report.examined += 1;
            let batch_key = ticket.entity_id.clone();
            if let Err(e) = self.stage_ticket(ticket, &mut report).await {
                warn!(batch_key = %batch_key, error = %e, "failed to examine retry ticket");
            }
        }

        for ticket in sweeper.drain() {
            let handle = match self.node_handle(ticket.graph_id, &ticket.node_id).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(batch_key = %ticket.entity_id, error = %e, "retry batch node unavailable");
                    continue;
                }
            };
            if handle.is_saturated() {
                debug!(batch_key = %ticket.entity_id, "node saturated, retry postponed");
                report.saturated += 1;
                continue;
            }

            match self.retry_batch(&ticket).await {
                Ok(ClaimOutcome::Claimed) => report.claimed += 1,
                Ok(ClaimOutcome::Lost) => report.lost += 1,
                Ok(ClaimOutcome::Busy) => report.busy += 1,
                Ok(ClaimOutcome::Stale) => report.stale += 1,
                Ok(ClaimOutcome::Exhausted) => report.exhausted += 1,
                Ok(ClaimOutcome::Saturated) => report.saturated += 1,
                Err(e) => {
                    warn!(batch_key = %ticket.entity_id, error = %e, "retry claim failed");
                }
            }
        }

        if report.claimed > 0 || report.stale > 0 || report.exhausted > 0 {
            info!(
                examined = report.examined,
                claimed = report.claimed,
                stale = report.stale,
                exhausted = report.exhausted,
                "retry sweep finished"
            );
        }
        Ok(report)
    }

    // Classify a due ticket by the contexts it covers: RETRYABLE ones make
    // it a candidate, READY ones (a claimed batch back at its node) make it
    // wait, and with neither it is stale.
    async fn stage_ticket(&self, ticket: RetryTicket, report: &mut SweepReport) -> Result<()> {
        let ids: Vec<Uuid> = ticket.context_ids.iter().copied().collect();
        let contexts = self.inner.store.get_contexts(&ids).await?;

        let retryable: Vec<Uuid> = contexts
            .iter()
            .filter(|c| {
                c.status == ContextStatus::Retryable
                    && c.batch_key.as_deref() == Some(ticket.entity_id.as_str())
            })
            .flat_map(|c| c.trace_ids.iter().copied())
            .collect();

        if !retryable.is_empty() {
            if self.inner.ownership.is_any_own(&retryable) {
                self.inner.sweeper.stage(ticket);
            } else {
                report.not_owned += 1;
            }
            return Ok(());
        }
        if contexts.iter().any(|c| c.status == ContextStatus::Ready) {
            report.in_flight += 1;
            return Ok(());
        }

        report.stale += self.inner.store.delete_ticket(&ticket.entity_id).await? as usize;
        debug!(batch_key = %ticket.entity_id, "stale retry ticket removed");
        Ok(())
    }

    /// Claim one batch under its lease and resubmit it
    pub(crate) async fn retry_batch(&self, ticket: &RetryTicket) -> Result<ClaimOutcome> {
        let key = retry_lease_key(&ticket.entity_id);
        let outcome = with_lease(
            self.inner.leases.as_ref(),
            &key,
            self.worker_id(),
            self.inner.config.lease_ttl,
            || self.claim_and_resubmit(ticket),
        )
        .await?;

        match outcome {
            Some(outcome) => outcome,
            None => Ok(ClaimOutcome::Busy),
        }
    }

    async fn claim_and_resubmit(&self, ticket: &RetryTicket) -> Result<ClaimOutcome> {
        let store = &self.inner.store;
        let batch_key = ticket.entity_id.as_str();

        let Some(current) = store.get_ticket(batch_key).await? else {
            return Ok(ClaimOutcome::Stale);
        };
        if current.retry_count != ticket.retry_count {
            return Ok(ClaimOutcome::Lost);
        }

        let ids: Vec<Uuid> = current.context_ids.iter().copied().collect();
        let contexts = store.get_contexts(&ids).await?;
        let mut retryable: Vec<_> = contexts
            .iter()
            .filter(|c| {
                c.status == ContextStatus::Retryable && c.batch_key.as_deref() == Some(batch_key)
            })
            .cloned()
            .collect();
        if retryable.is_empty() {
            if contexts.iter().all(|c| c.status.is_terminal()) {
                store.delete_ticket(batch_key).await?;
                return Ok(ClaimOutcome::Stale);
            }
            return Ok(ClaimOutcome::Lost);
        }

        let graph = self.graph_by_id(current.graph_id).await?;
        let node = Self::node(&graph, &current.node_id)?;
        let policy = &self.inner.config.retry;

        if policy.is_exhausted(current.retry_count) {
            let failure = NodeFailure::non_retryable(format!(
                "retry attempts exhausted after {} retries",
                current.retry_count
            ))
            .with_kind(RETRY_EXHAUSTED_KIND);
            for ctx in retryable {
                self.fail_context(ctx, &node.id, &failure, ContextStatus::Retryable)
                    .await?;
            }
            store.delete_ticket(batch_key).await?;
            return Ok(ClaimOutcome::Exhausted);
        }

        // The node takes what fits; the rest moves to a batch of its own
        let handle = self.inner.handles.handle(graph.id, node);
        let admitted = handle.admit(retryable.len());
        if admitted.is_empty() {
            return Ok(ClaimOutcome::Saturated);
        }
        let overflow = retryable.split_off(admitted.len());
        if !overflow.is_empty() && self.split_batch(&current, overflow).await? == 0 {
            return Ok(ClaimOutcome::Lost);
        }

        let now = Utc::now();
        let backoff = policy.backoff_after(current.retry_count + 1);
        let claim = BatchClaim {
            batch_key: batch_key.to_string(),
            expected_retry_count: current.retry_count,
            context_ids: retryable.iter().map(|c| c.id).collect(),
            retried_at: now,
            next_retry_at: now
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::days(1)),
        };
        if store.claim_retry_batch(&claim).await? == 0 {
            debug!(batch_key, "retry claim lost");
            return Ok(ClaimOutcome::Lost);
        }

        let claimed: Vec<_> = store
            .get_contexts(&claim.context_ids)
            .await?
            .into_iter()
            .filter(|c| c.status == ContextStatus::Ready)
            .collect();
        info!(
            batch_key,
            retry = current.retry_count + 1,
            contexts = claimed.len(),
            "retry batch claimed"
        );
        self.dispatch(
            graph.clone(),
            node.id.clone(),
            claimed,
            Dispatch::Retry {
                batch_key: batch_key.to_string(),
                admitted,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    // Re-park contexts the node has no room for under a fresh batch key.
    // The new ticket keeps the retry count and is due at once.
    async fn split_batch(&self, ticket: &RetryTicket, mut overflow: Vec<Context>) -> Result<u64> {
        let batch_key = new_batch_key(ticket.graph_id, &ticket.node_id);
        for ctx in &mut overflow {
            ctx.rebatch(&batch_key)?;
        }

        let mut split = RetryTicket::for_batch(
            &batch_key,
            ticket.graph_id,
            &ticket.node_id,
            overflow.iter().map(|c| c.id),
            Utc::now(),
        );
        split.retry_count = ticket.retry_count;
        let moved = self
            .inner
            .store
            .park_retryable(&overflow, ContextStatus::Retryable, &split)
            .await?;
        debug!(
            from = %ticket.entity_id,
            to = %batch_key,
            contexts = moved,
            "retry batch split to fit the node"
        );
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::broadcast;

    use super::*;
    use crate::config::EngineConfig;
    use crate::graph::{GraphDefinition, InMemoryGraphRepository, NodeDefinition};
    use crate::lease::{InMemoryLeaseProvider, Lease, LeaseError, LeaseInvalidated, LeaseProvider};
    use crate::model::{Context, Payload, Trace};
    use crate::node::{NodeExecutor, NodeInput, NodeOutcome};
    use crate::persistence::{ContextStore, FlowStore, InMemoryFlowStore};
    use crate::RetryPolicy;

    /// Grants every lease, leaving the store as the only arbiter
    struct AlwaysGrant {
        invalidations: broadcast::Sender<LeaseInvalidated>,
    }

    impl AlwaysGrant {
        fn new() -> Self {
            Self {
                invalidations: broadcast::channel(4).0,
            }
        }
    }

    #[async_trait]
    impl LeaseProvider for AlwaysGrant {
        async fn try_acquire(
            &self,
            key: &str,
            owner: &str,
            ttl: Duration,
        ) -> std::result::Result<Option<Lease>, LeaseError> {
            Ok(Some(Lease::new(key, owner, ttl)))
        }

        async fn renew(
            &self,
            lease: &Lease,
            ttl: Duration,
        ) -> std::result::Result<Option<Lease>, LeaseError> {
            Ok(Some(Lease::new(&lease.key, &lease.owner, ttl)))
        }

        async fn release(&self, _lease: &Lease) -> std::result::Result<bool, LeaseError> {
            Ok(true)
        }

        fn subscribe(&self) -> broadcast::Receiver<LeaseInvalidated> {
            self.invalidations.subscribe()
        }
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeExecutor for Counting {
        fn executor_type(&self) -> &str {
            "counting"
        }

        async fn execute(&self, _input: &NodeInput) -> NodeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            NodeOutcome::Completed(json!({"done": true}))
        }
    }

    fn graph() -> GraphDefinition {
        GraphDefinition::new("retry", 1, "start")
            .with_node(NodeDefinition::start("start"))
            .with_node(NodeDefinition::task("work", "counting"))
            .with_event("e1", "start", "work")
    }

    struct Fixture {
        store: Arc<InMemoryFlowStore>,
        orchestrators: Vec<Orchestrator>,
        ticket: RetryTicket,
        calls: Arc<AtomicUsize>,
    }

    /// One RETRYABLE context parked at "work", and `k` orchestrators that
    /// share the store and the lease provider
    async fn fixture(k: usize, leases: Arc<dyn LeaseProvider>, policy: RetryPolicy) -> Fixture {
        let store = Arc::new(InMemoryFlowStore::new());
        let graphs = Arc::new(InMemoryGraphRepository::new());
        let graph = graph();
        graphs.register(graph.clone()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let orchestrators = (0..k)
            .map(|i| {
                Orchestrator::builder(store.clone(), graphs.clone(), leases.clone())
                    .config(
                        EngineConfig::default()
                            .with_worker_id(format!("worker-{i}"))
                            .with_retry_policy(policy.clone()),
                    )
                    .executor(Counting {
                        calls: calls.clone(),
                    })
                    .build()
                    .unwrap()
            })
            .collect();

        let trace = Trace::new(Uuid::now_v7(), graph.stream_id(), None);
        let mut ctx = Context::new(
            graph.stream_id(),
            trace.trans_id,
            BTreeSet::from([trace.id]),
            "work",
            Some("e1".into()),
            Payload::default(),
        );
        store.create_run(&[trace], &[]).await.unwrap();
        ctx.transition(ContextStatus::Pending).unwrap();
        ctx.transition(ContextStatus::Ready).unwrap();
        store.insert_contexts(&[ctx.clone()]).await.unwrap();

        let ticket = RetryTicket::for_batch("batch-1", graph.id, "work", [ctx.id], Utc::now());
        ctx.mark_retryable("batch-1").unwrap();
        store
            .park_retryable(&[ctx], ContextStatus::Ready, &ticket)
            .await
            .unwrap();

        Fixture {
            store,
            orchestrators,
            ticket,
            calls,
        }
    }

    #[tokio::test]
    async fn test_k_racers_exactly_one_claims() {
        let f = fixture(8, Arc::new(AlwaysGrant::new()), RetryPolicy::default()).await;

        let racers = f.orchestrators.iter().map(|o| {
            let o = o.clone();
            let ticket = f.ticket.clone();
            tokio::spawn(async move { o.retry_batch(&ticket).await.unwrap() })
        });
        let outcomes: Vec<ClaimOutcome> = futures::future::join_all(racers)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let winners = outcomes.iter().filter(|o| **o == ClaimOutcome::Claimed).count();
        assert_eq!(winners, 1, "outcomes: {outcomes:?}");

        for o in &f.orchestrators {
            o.quiesce().await;
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.ticket_count(), 0);
    }

    #[tokio::test]
    async fn test_held_lease_reports_busy() {
        let leases = Arc::new(InMemoryLeaseProvider::new());
        let f = fixture(1, leases.clone(), RetryPolicy::default()).await;

        let held = leases
            .try_acquire(&retry_lease_key("batch-1"), "someone-else", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let outcome = f.orchestrators[0].retry_batch(&f.ticket).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Busy);

        leases.release(&held).await.unwrap();
        let outcome = f.orchestrators[0].retry_batch(&f.ticket).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_stale_snapshot_loses() {
        let f = fixture(1, Arc::new(AlwaysGrant::new()), RetryPolicy::default()).await;
        let mut stale = f.ticket.clone();
        stale.retry_count = 3;

        let outcome = f.orchestrators[0].retry_batch(&stale).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Lost);
        assert_eq!(f.store.ticket_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_batch_goes_to_error() {
        let f = fixture(
            1,
            Arc::new(AlwaysGrant::new()),
            RetryPolicy::no_retry(),
        )
        .await;

        let outcome = f.orchestrators[0].retry_batch(&f.ticket).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Exhausted);
        assert_eq!(f.store.ticket_count(), 0);
        assert_eq!(f.store.contexts_in(ContextStatus::Error).len(), 1);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_unowned_batches() {
        let f = fixture(1, Arc::new(InMemoryLeaseProvider::new()), RetryPolicy::default()).await;

        let report = f.orchestrators[0].sweep_retries().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.not_owned, 1);
        assert_eq!(report.claimed, 0);
        assert_eq!(f.store.ticket_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_ticket_of_terminated_batch() {
        let f = fixture(1, Arc::new(InMemoryLeaseProvider::new()), RetryPolicy::default()).await;
        let ids: Vec<Uuid> = f.ticket.context_ids.iter().copied().collect();
        f.store
            .update_status_if(&ids, &[ContextStatus::Retryable], ContextStatus::Terminate)
            .await
            .unwrap();

        let report = f.orchestrators[0].sweep_retries().await.unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(f.store.ticket_count(), 0);
    }

    #[test]
    fn test_single_flight_guard() {
        let sweeper = RetrySweeper::new();
        let first = sweeper.begin();
        assert!(first.is_some());
        assert!(sweeper.begin().is_none());
        assert!(sweeper.is_running());

        drop(first);
        assert!(!sweeper.is_running());
        assert!(sweeper.begin().is_some());
    }
}
