//! Batch execution at a node
//!
//! A batch is a set of contexts handed to one node together: the contexts a
//! run starts with, the successors of a finished context, or a claimed retry
//! batch. Every batch runs on its own task; its outcome is written back with
//! conditional updates so a concurrent terminate always wins.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::orchestrator::Orchestrator;
use crate::error::Result;
use crate::graph::{GraphDefinition, NodeDefinition};
use crate::listener::FlowEvent;
use crate::model::{Context, ContextStatus, RetryTicket};
use crate::node::{
    InFlight, NodeExecutor, NodeFailure, NodeInput, NodeOutcome, EXECUTOR_NOT_FOUND_KIND,
    PANIC_KIND,
};

/// Where a batch comes from
pub(crate) enum Dispatch {
    /// NEW or PENDING contexts entering the node
    Fresh,

    /// READY contexts of a claimed retry batch, admitted by the sweep
    Retry {
        batch_key: String,
        admitted: Vec<InFlight>,
    },
}

/// Batch key of a fresh retry batch
pub(crate) fn new_batch_key(graph_id: Uuid, node_id: &str) -> String {
    format!("{graph_id}:{node_id}:{}", Uuid::now_v7())
}

impl Orchestrator {
    /// Hand contexts to a node on a tracked task
    pub(crate) fn dispatch(
        &self,
        graph: Arc<GraphDefinition>,
        node_id: String,
        contexts: Vec<Context>,
        origin: Dispatch,
    ) {
        if contexts.is_empty() {
            return;
        }
        let batch = self.clone().run_batch(graph, node_id, contexts, origin);
        self.inner.tasks.spawn(batch);
    }

    /// Dispatch contexts grouped by the node they sit at
    pub(crate) fn dispatch_by_node(&self, graph: &Arc<GraphDefinition>, contexts: Vec<Context>) {
        let mut by_node: BTreeMap<String, Vec<Context>> = BTreeMap::new();
        for ctx in contexts {
            by_node.entry(ctx.position.clone()).or_default().push(ctx);
        }
        for (node_id, batch) in by_node {
            self.dispatch(Arc::clone(graph), node_id, batch, Dispatch::Fresh);
        }
    }

    fn run_batch(
        self,
        graph: Arc<GraphDefinition>,
        node_id: String,
        contexts: Vec<Context>,
        origin: Dispatch,
    ) -> BoxFuture<'static, ()> {
        async move {
            let size = contexts.len();
            if let Err(e) = self.execute_batch(&graph, &node_id, contexts, origin).await {
                error!(
                    graph_id = %graph.id,
                    node_id = %node_id,
                    size,
                    error = %e,
                    "batch execution failed"
                );
            }
        }
        .boxed()
    }

    async fn execute_batch(
        &self,
        graph: &Arc<GraphDefinition>,
        node_id: &str,
        contexts: Vec<Context>,
        origin: Dispatch,
    ) -> Result<()> {
        let node = Self::node(graph, node_id)?;
        let handle = self.inner.handles.handle(graph.id, node);
        let ids: Vec<Uuid> = contexts.iter().map(|c| c.id).collect();
        let store = &self.inner.store;

        let (ready, admitted, retry_of) = match origin {
            Dispatch::Fresh => {
                store
                    .update_status_if(&ids, &[ContextStatus::New], ContextStatus::Pending)
                    .await?;

                // Contexts beyond the node's free slots wait for the sweep
                let admitted = handle.admit(ids.len());
                let (entering, waiting) = ids.split_at(admitted.len());
                if !waiting.is_empty() {
                    self.defer_admission(graph, node, waiting).await?;
                }
                if entering.is_empty() {
                    return Ok(());
                }

                store
                    .update_status_if(entering, &[ContextStatus::Pending], ContextStatus::Ready)
                    .await?;
                let ready = store
                    .get_contexts(entering)
                    .await?
                    .into_iter()
                    .filter(|c| c.status == ContextStatus::Ready)
                    .collect::<Vec<_>>();
                (ready, admitted, None)
            }
            Dispatch::Retry {
                batch_key,
                admitted,
            } => (contexts, admitted, Some(batch_key)),
        };
        if ready.is_empty() {
            debug!(node_id, "nothing left to execute");
            return Ok(());
        }

        let executor = node.executor.as_deref().map(|t| (t, self.inner.executors.get(t)));
        let runs = ready.into_iter().zip(admitted).map(|(mut ctx, in_flight)| {
            ctx.payload.engine.attempt += 1;
            let executor = executor.clone();
            async move {
                let outcome = match executor {
                    None => NodeOutcome::Completed(Value::Null),
                    Some((_, Some(executor))) => invoke(executor, node, &ctx).await,
                    Some((executor_type, None)) => NodeOutcome::Failed(
                        NodeFailure::non_retryable(format!(
                            "no executor registered for type {executor_type}"
                        ))
                        .with_kind(EXECUTOR_NOT_FOUND_KIND),
                    ),
                };
                (ctx, outcome, in_flight)
            }
        });
        let results = join_all(runs).await;

        let mut retryable = vec![];
        for (ctx, outcome, _in_flight) in results {
            let context_id = ctx.id;
            let settled = match outcome {
                NodeOutcome::Completed(output) => self
                    .complete_context(graph, node, ctx, &output, ContextStatus::Ready)
                    .await
                    .map(|_| ()),
                NodeOutcome::Deferred => self.defer_context(ctx).await,
                NodeOutcome::Failed(failure)
                    if failure.retryable
                        && self.inner.config.retry.should_retry(failure.kind.as_deref()) =>
                {
                    retryable.push((ctx, failure));
                    Ok(())
                }
                NodeOutcome::Failed(failure) => self
                    .fail_context(ctx, &node.id, &failure, ContextStatus::Ready)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = settled {
                warn!(%context_id, node_id, error = %e, "failed to record outcome");
            }
        }

        self.park_failures(graph, node, retryable, retry_of.as_deref())
            .await
    }

    /// Finish a context at `node` and hand its successors on
    ///
    /// Returns false when the context moved meanwhile (terminated, or
    /// completed elsewhere); nothing is written then.
    pub(crate) async fn complete_context(
        &self,
        graph: &Arc<GraphDefinition>,
        node: &NodeDefinition,
        mut ctx: Context,
        output: &Value,
        expected: ContextStatus,
    ) -> Result<bool> {
        if !output.is_null() {
            ctx.payload.merge(output);
        }
        if graph.output_scoping {
            ctx.payload.derive_scope(&node.id, &node.output_keys);
        }
        ctx.transition(ContextStatus::Archived)?;

        let successors: Vec<Context> = graph
            .outbound_events(&node.id)
            .filter_map(|event| graph.node(&event.target).map(|target| (event, target)))
            .map(|(event, target)| {
                let mut payload = ctx.payload.clone();
                payload.engine.node_id = target.id.clone();
                payload.engine.node_type = Some(target.node_type);
                payload.engine.attempt = 0;
                Context::new(
                    ctx.stream.clone(),
                    ctx.trans_id,
                    ctx.trace_ids.clone(),
                    &target.id,
                    Some(event.id.clone()),
                    payload,
                )
            })
            .collect();

        if self
            .inner
            .store
            .advance(&ctx, expected, &successors)
            .await?
            == 0
        {
            debug!(context_id = %ctx.id, "context moved meanwhile, result dropped");
            return Ok(false);
        }

        debug!(
            context_id = %ctx.id,
            node_id = %node.id,
            successors = successors.len(),
            "context archived"
        );
        self.dispatch_by_node(graph, successors);
        Ok(true)
    }

    /// Record a permanent failure; returns false on a lost race
    pub(crate) async fn fail_context(
        &self,
        mut ctx: Context,
        node_id: &str,
        failure: &NodeFailure,
        expected: ContextStatus,
    ) -> Result<bool> {
        let detail = failure.to_detail(node_id, ctx.payload.engine.attempt);
        ctx.mark_error(detail.clone())?;

        let written = self
            .inner
            .store
            .update_contexts(std::slice::from_ref(&ctx), expected)
            .await?;
        if written == 0 {
            return Ok(false);
        }

        warn!(
            context_id = %ctx.id,
            node_id,
            kind = ?failure.kind,
            error = %failure,
            "context failed"
        );
        self.listeners()
            .emit(&FlowEvent::NodeFailed {
                context_id: ctx.id,
                trace_ids: ctx.trace_ids.iter().copied().collect(),
                graph_id: ctx.stream.graph_id,
                error: detail,
            })
            .await;
        Ok(true)
    }

    // Executor handed the work elsewhere; the context waits for
    // resume_async_job or fail_async_job.
    async fn defer_context(&self, mut ctx: Context) -> Result<()> {
        ctx.transition(ContextStatus::Pending)?;
        self.inner
            .store
            .update_contexts(std::slice::from_ref(&ctx), ContextStatus::Ready)
            .await?;
        Ok(())
    }

    /// Park contexts the node refused to admit; the retry sweep submits them
    /// once the node has room
    async fn defer_admission(
        &self,
        graph: &GraphDefinition,
        node: &NodeDefinition,
        ids: &[Uuid],
    ) -> Result<()> {
        let batch_key = new_batch_key(graph.id, &node.id);
        let mut parked = vec![];
        for mut ctx in self.inner.store.get_contexts(ids).await? {
            if ctx.status == ContextStatus::Pending {
                ctx.mark_retryable(&batch_key)?;
                parked.push(ctx);
            }
        }
        if parked.is_empty() {
            return Ok(());
        }

        let ticket = RetryTicket::for_batch(
            &batch_key,
            graph.id,
            &node.id,
            parked.iter().map(|c| c.id),
            Utc::now(),
        );
        let written = self
            .inner
            .store
            .park_retryable(&parked, ContextStatus::Pending, &ticket)
            .await?;
        info!(
            node_id = %node.id,
            batch_key = %batch_key,
            contexts = written,
            "node saturated, batch deferred"
        );
        Ok(())
    }

    /// Park retryable failures under one batch key, or fail them for good
    /// once the policy is exhausted
    ///
    /// A retried batch keeps its key and ticket. When nothing of it failed
    /// again, its ticket is deleted.
    async fn park_failures(
        &self,
        graph: &GraphDefinition,
        node: &NodeDefinition,
        failures: Vec<(Context, NodeFailure)>,
        retry_of: Option<&str>,
    ) -> Result<()> {
        let store = &self.inner.store;

        let (batch_key, retry_count) = match retry_of {
            Some(batch_key) => {
                if failures.is_empty() {
                    store.delete_ticket(batch_key).await?;
                    debug!(batch_key = %batch_key, "retry batch settled");
                    return Ok(());
                }
                let retry_count = store
                    .get_ticket(batch_key)
                    .await?
                    .map(|t| t.retry_count)
                    .unwrap_or(0);
                (batch_key.to_string(), retry_count)
            }
            None if failures.is_empty() => return Ok(()),
            None => (new_batch_key(graph.id, &node.id), 0),
        };

        if self.inner.config.retry.is_exhausted(retry_count) {
            for (ctx, failure) in failures {
                self.fail_context(ctx, &node.id, &failure, ContextStatus::Ready)
                    .await?;
            }
            store.delete_ticket(&batch_key).await?;
            info!(batch_key = %batch_key, retry_count, "retry attempts exhausted");
            return Ok(());
        }

        let mut parked = Vec::with_capacity(failures.len());
        for (mut ctx, failure) in failures {
            ctx.error = Some(failure.to_detail(&node.id, ctx.payload.engine.attempt));
            ctx.mark_retryable(&batch_key)?;
            parked.push(ctx);
        }
        let ticket = RetryTicket::for_batch(
            &batch_key,
            graph.id,
            &node.id,
            parked.iter().map(|c| c.id),
            Utc::now(),
        );
        let written = store
            .park_retryable(&parked, ContextStatus::Ready, &ticket)
            .await?;
        if written == 0 {
            debug!(batch_key = %batch_key, "retryable batch moved meanwhile");
        } else {
            info!(
                node_id = %node.id,
                batch_key = %batch_key,
                contexts = written,
                retry_count,
                "batch parked for retry"
            );
        }
        Ok(())
    }
}

async fn invoke(executor: Arc<dyn NodeExecutor>, node: &NodeDefinition, ctx: &Context) -> NodeOutcome {
    let input = NodeInput {
        context_id: ctx.id,
        trace_ids: ctx.trace_ids.clone(),
        graph_id: ctx.stream.graph_id,
        node_id: node.id.clone(),
        attempt: ctx.payload.engine.attempt,
        business: ctx.payload.business.clone(),
        pass_through: ctx.payload.pass_through.clone(),
    };

    let execution = AssertUnwindSafe(executor.execute(&input)).catch_unwind();
    let result = match node.timeout {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(result) => result,
            Err(_) => return NodeOutcome::Failed(NodeFailure::timeout(limit)),
        },
        None => execution.await,
    };

    result.unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        error!(context_id = %ctx.id, node_id = %node.id, panic = %message, "node executor panicked");
        NodeOutcome::Failed(
            NodeFailure::non_retryable(format!("executor panicked: {message}"))
                .with_kind(PANIC_KIND),
        )
    })
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
