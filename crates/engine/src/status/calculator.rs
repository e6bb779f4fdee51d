//! Status calculation of owned traces
//!
//! Every tick the calculator:
//! - renews the ownership leases of this process
//! - adopts RUNNING traces nobody owns any more
//! - rolls each owned trace up from its contexts and persists terminal
//!   statuses
//! - reports a trans once all of its traces are done, under the
//!   `trans:<id>` lease, exactly once across all processes

use std::panic::{resume_unwind, AssertUnwindSafe};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{panic_message, rollup_traces, Orchestrator};
use crate::error::Result;
use crate::lease::{release_quietly, LeaseError};
use crate::listener::RunGroupCompleted;
use crate::model::{TraceStatus, TransCompletion};

/// Lease key serializing completion of a trans
pub fn trans_lease_key(trans_id: Uuid) -> String {
    format!("trans:{trans_id}")
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Owned traces examined
    pub examined: usize,

    /// Traces that reached a terminal status
    pub finished: usize,

    /// Traces given up because they no longer exist or failed to process
    pub released: usize,

    /// Orphaned traces taken over
    pub adopted: usize,

    /// Ownership leases lost since the last tick
    pub lost: usize,

    /// Trans completion callbacks fired
    pub completions: usize,
}

enum TraceOutcome {
    Running,
    Protected,
    Released,
    Finished { completed_trans: bool },
}

/// Periodic status calculation for the traces this process owns
pub struct StatusCalculator {
    orchestrator: Orchestrator,
    interval: Duration,
}

impl StatusCalculator {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let interval = orchestrator.config().status_interval;
        Self {
            orchestrator,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One full pass over the owned traces
    #[instrument(skip(self), fields(worker_id = %self.orchestrator.worker_id()))]
    pub async fn tick(&self) -> Result<StatusReport> {
        let ownership = self.orchestrator.ownership();
        let mut report = StatusReport {
            lost: ownership.renew().await?,
            ..Default::default()
        };
        report.adopted = self.adopt_orphans().await?;

        for trace_id in ownership.traces() {
            report.examined += 1;
            match self.process_trace(trace_id).await {
                Ok(TraceOutcome::Running) | Ok(TraceOutcome::Protected) => {}
                Ok(TraceOutcome::Released) => report.released += 1,
                Ok(TraceOutcome::Finished { completed_trans }) => {
                    report.finished += 1;
                    if completed_trans {
                        report.completions += 1;
                    }
                }
                // A RUNNING trace given up here is adopted again by the next
                // orphan scan
                Err(e) => {
                    warn!(%trace_id, error = %e, "status calculation failed");
                    if let Err(e) = ownership.release(trace_id).await {
                        warn!(%trace_id, error = %e, "failed to release trace");
                    }
                    report.released += 1;
                }
            }
        }

        if report.finished > 0 || report.adopted > 0 || report.lost > 0 {
            info!(
                examined = report.examined,
                finished = report.finished,
                adopted = report.adopted,
                lost = report.lost,
                "status pass finished"
            );
        }
        Ok(report)
    }

    async fn adopt_orphans(&self) -> Result<usize> {
        let ownership = self.orchestrator.ownership();
        let running = self
            .orchestrator
            .store()
            .running_traces(self.orchestrator.config().sweep_batch_size)
            .await?;

        let mut adopted = 0;
        for trace in running {
            if ownership.is_own(trace.id) {
                continue;
            }
            if ownership.try_own(trace.id, trace.trans_id).await? {
                adopted += 1;
                if let Err(e) = self.orchestrator.recover_trace(trace.id).await {
                    warn!(trace_id = %trace.id, error = %e, "failed to recover adopted trace");
                }
            }
        }
        Ok(adopted)
    }

    async fn process_trace(&self, trace_id: Uuid) -> Result<TraceOutcome> {
        let ownership = self.orchestrator.ownership();
        let store = self.orchestrator.store();

        let Some(trace) = store.get_trace(trace_id).await? else {
            if ownership.is_in_protect_time(trace_id) {
                return Ok(TraceOutcome::Protected);
            }
            ownership.release(trace_id).await?;
            debug!(%trace_id, "released missing trace");
            return Ok(TraceOutcome::Released);
        };

        if !trace.status.is_terminal() {
            let graph = self.orchestrator.graph_by_id(trace.stream.graph_id).await?;
            let contexts = store.contexts_by_trace(trace_id).await?;
            let status = self
                .orchestrator
                .config()
                .completeness
                .rollup(&graph, &contexts);
            if status == TraceStatus::Running {
                return Ok(TraceOutcome::Running);
            }
            if store.finish_trace(trace_id, status).await? == 1 {
                info!(%trace_id, status = %status, "trace finished");
            }
        }

        let completed_trans = self.finalize_trans(trace.trans_id).await?;
        ownership.release(trace_id).await?;
        Ok(TraceOutcome::Finished { completed_trans })
    }

    /// Report a trans whose traces are all done
    ///
    /// Serialized per trans by the `trans:<id>` lease and made idempotent by
    /// the persisted completion marker: the callbacks fire at most once,
    /// whichever process gets there first. Returns whether this call fired
    /// them.
    pub async fn finalize_trans(&self, trans_id: Uuid) -> Result<bool> {
        let config = self.orchestrator.config();
        let key = trans_lease_key(trans_id);
        let lease = self
            .orchestrator
            .leases()
            .acquire(&key, &config.worker_id, config.lease_ttl, config.lease_ttl)
            .await?
            .ok_or_else(|| LeaseError::Timeout(key.clone()))?;

        let fired = AssertUnwindSafe(self.complete_trans(trans_id))
            .catch_unwind()
            .await;
        release_quietly(self.orchestrator.leases().as_ref(), &lease).await;
        fired.unwrap_or_else(|panic| resume_unwind(panic))
    }

    async fn complete_trans(&self, trans_id: Uuid) -> Result<bool> {
        let store = self.orchestrator.store();
        if store.get_trans_completion(trans_id).await?.is_some() {
            return Ok(false);
        }

        let traces = store.traces_of_trans(trans_id).await?;
        let statuses: Vec<TraceStatus> = traces.iter().map(|t| t.status).collect();

        let status = rollup_traces(&statuses);
        let Some(first) = traces.first() else {
            return Ok(false);
        };
        if status == TraceStatus::Running {
            return Ok(false);
        }

        let completion = TransCompletion {
            trans_id,
            status,
            completed_at: Utc::now(),
        };
        if store.record_trans_completion(&completion).await? == 0 {
            debug!(%trans_id, "trans already reported");
            return Ok(false);
        }

        info!(%trans_id, status = %status, traces = traces.len(), "trans completed");
        self.orchestrator
            .listeners()
            .run_group_completed(&RunGroupCompleted {
                trans_id,
                graph_id: first.stream.graph_id,
                version: first.stream.version,
                trace_ids: traces.iter().map(|t| t.id).collect(),
                status,
            })
            .await;
        Ok(true)
    }

    /// Run until `shutdown_rx` flips to true
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match AssertUnwindSafe(self.tick()).catch_unwind().await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!(error = %e, "status pass failed"),
                            Err(panic) => error!(
                                panic = %panic_message(panic.as_ref()),
                                "status pass panicked"
                            ),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("status calculator: shutdown requested");
                            break;
                        }
                    }
                }
            }

            debug!("status calculator exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::graph::{GraphDefinition, GraphRef, InMemoryGraphRepository, NodeDefinition};
    use crate::lease::InMemoryLeaseProvider;
    use crate::listener::RunGroupListener;
    use crate::persistence::{InMemoryFlowStore, TraceStore};

    #[derive(Default)]
    struct CountingCallback {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RunGroupListener for CountingCallback {
        async fn on_run_group_completed(&self, _event: &RunGroupCompleted) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(
        callback: Arc<CountingCallback>,
    ) -> (Arc<InMemoryFlowStore>, Orchestrator, Orchestrator) {
        let store = Arc::new(InMemoryFlowStore::new());
        let graphs = Arc::new(InMemoryGraphRepository::new());
        graphs
            .register(
                GraphDefinition::new("pass", 1, "start")
                    .with_node(NodeDefinition::start("start"))
                    .with_node(NodeDefinition::end("done"))
                    .with_event("e1", "start", "done"),
            )
            .unwrap();
        let leases = Arc::new(InMemoryLeaseProvider::new());

        let build = |worker: &str| {
            Orchestrator::builder(store.clone(), graphs.clone(), leases.clone())
                .config(EngineConfig::default().with_worker_id(worker))
                .run_group_listener(callback.clone())
                .build()
                .unwrap()
        };
        let a = build("worker-a");
        let b = build("worker-b");
        (store, a, b)
    }

    #[tokio::test]
    async fn test_finished_trace_is_persisted_and_released() {
        let callback = Arc::new(CountingCallback::default());
        let (store, a, _) = setup(callback.clone());

        let run = a
            .start_run(&GraphRef::meta("pass", 1), json!({}), None)
            .await
            .unwrap();
        a.quiesce().await;

        let report = StatusCalculator::new(a.clone()).tick().await.unwrap();
        assert_eq!(report.finished, 1);
        assert_eq!(report.completions, 1);
        assert_eq!(callback.calls.load(Ordering::SeqCst), 1);
        assert!(!a.ownership().is_own(run.trace_id));
        assert_eq!(
            store.get_trace(run.trace_id).await.unwrap().unwrap().status,
            TraceStatus::Archived
        );
    }

    #[tokio::test]
    async fn test_concurrent_finalizers_fire_callback_once() {
        let callback = Arc::new(CountingCallback::default());
        let (_, a, b) = setup(callback.clone());

        let group = a
            .start_group(&GraphRef::meta("pass", 1), vec![json!({"n": 1}), json!({"n": 2})], None)
            .await
            .unwrap();
        a.quiesce().await;
        let report = StatusCalculator::new(a.clone()).tick().await.unwrap();
        assert_eq!(report.finished, 2);
        assert_eq!(report.completions, 1);

        let calc_a = StatusCalculator::new(a.clone());
        let calc_b = StatusCalculator::new(b.clone());
        let (fa, fb) = tokio::join!(
            calc_a.finalize_trans(group.trans_id),
            calc_b.finalize_trans(group.trans_id)
        );
        assert!(!fa.unwrap());
        assert!(!fb.unwrap());
        assert_eq!(callback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_racing_finalizers_without_prior_report() {
        let callback = Arc::new(CountingCallback::default());
        let (store, a, b) = setup(callback.clone());

        let group = a
            .start_group(&GraphRef::meta("pass", 1), vec![json!({}), json!({})], None)
            .await
            .unwrap();
        a.quiesce().await;
        for run in &group.runs {
            store
                .finish_trace(run.trace_id, TraceStatus::Archived)
                .await
                .unwrap();
        }

        let calc_a = StatusCalculator::new(a);
        let calc_b = StatusCalculator::new(b);
        let (fa, fb) = tokio::join!(
            calc_a.finalize_trans(group.trans_id),
            calc_b.finalize_trans(group.trans_id)
        );
        assert_eq!(u8::from(fa.unwrap()) + u8::from(fb.unwrap()), 1);
        assert_eq!(callback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_orphaned_trace_is_adopted() {
        let callback = Arc::new(CountingCallback::default());
        let (_, a, b) = setup(callback);

        let run = a
            .start_run(&GraphRef::meta("pass", 1), json!({}), None)
            .await
            .unwrap();
        a.quiesce().await;
        // a dies without finishing its status work
        a.ownership().release(run.trace_id).await.unwrap();

        let report = StatusCalculator::new(b.clone()).tick().await.unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(report.finished, 1);
    }

    #[tokio::test]
    async fn test_missing_trace_kept_during_protect_time() {
        let callback = Arc::new(CountingCallback::default());
        let (_, a, _) = setup(callback);
        let ghost = Uuid::now_v7();
        a.ownership().own(ghost, Uuid::now_v7()).await.unwrap();

        // default protect window keeps it
        let report = StatusCalculator::new(a.clone()).tick().await.unwrap();
        assert_eq!(report.released, 0);
        assert!(a.ownership().is_own(ghost));
    }
}
