//! Orchestrator: the public face of the engine
//!
//! The orchestrator:
//! - Starts runs and run groups at the start node (or any node, via offer)
//! - Resumes parked contexts, and completes or fails asynchronous jobs
//! - Terminates traces
//! - Reports completeness and error information
//!
//! All state lives in the [`FlowStore`]. Several orchestrators, in one or
//! many processes, can share a store; races between them are settled by
//! conditional writes that report lost races as 0 rows changed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::completeness::{Completeness, CompletenessAlgorithm};
use super::dispatch::Dispatch;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::{GraphDefinition, GraphRef, GraphRepository, NodeDefinition};
use crate::lease::LeaseProvider;
use crate::listener::{FlowEvent, FlowListener, Listeners, RunGroupListener};
use crate::model::{Context, ContextStatus, ErrorDetail, Payload, Trace, TraceStatus};
use crate::node::{shape_output, ExecutorRegistry, NodeExecutor, NodeFailure, NodeHandle, NodeHandles};
use crate::ownership::{LeaseOwnershipService, OwnershipService};
use crate::persistence::FlowStore;
use crate::retry::RetrySweeper;

/// Identifiers of one started run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub trans_id: Uuid,
    pub trace_id: Uuid,

    /// Context created at the entry node
    pub context_id: Uuid,
}

/// Runs started together under one trans
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunGroupHandle {
    pub trans_id: Uuid,
    pub runs: Vec<RunHandle>,
}

/// How far a termination reaches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateScope {
    /// Only the addressed trace
    Trace,

    /// The trace plus every trace sharing one of its contexts
    #[default]
    WithRelated,
}

/// What a termination changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateReport {
    pub traces: u64,
    pub contexts: u64,
}

/// Failure of one context, as reported to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub context_id: Uuid,
    pub node_id: String,
    pub node_name: String,
    pub business: Value,
    pub error: ErrorDetail,
}

pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn FlowStore>,
    pub(crate) graphs: Arc<dyn GraphRepository>,
    pub(crate) leases: Arc<dyn LeaseProvider>,
    pub(crate) ownership: Arc<dyn OwnershipService>,
    pub(crate) executors: ExecutorRegistry,
    pub(crate) handles: NodeHandles,
    pub(crate) listeners: Listeners,
    pub(crate) tasks: TaskTracker,
    pub(crate) sweeper: RetrySweeper,
}

/// Entry point of the engine
///
/// Cheap to clone; clones share all state.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use flowmesh_engine::graph::{GraphDefinition, GraphRef, InMemoryGraphRepository, NodeDefinition};
/// use flowmesh_engine::lease::InMemoryLeaseProvider;
/// use flowmesh_engine::persistence::InMemoryFlowStore;
/// use flowmesh_engine::Orchestrator;
/// use serde_json::json;
///
/// # async fn example() -> flowmesh_engine::Result<()> {
/// let graphs = Arc::new(InMemoryGraphRepository::new());
/// graphs.register(
///     GraphDefinition::new("hello", 1, "start")
///         .with_node(NodeDefinition::start("start"))
///         .with_node(NodeDefinition::end("done"))
///         .with_event("e1", "start", "done"),
/// )?;
///
/// let orchestrator = Orchestrator::builder(
///     Arc::new(InMemoryFlowStore::new()),
///     graphs,
///     Arc::new(InMemoryLeaseProvider::new()),
/// )
/// .build()?;
///
/// let run = orchestrator
///     .start_run(&GraphRef::meta("hello", 1), json!({"name": "world"}), None)
///     .await?;
/// orchestrator.quiesce().await;
///
/// let report = orchestrator.get_completeness(&[run.trace_id]).await?;
/// assert_eq!(report[0].percentage, 100.0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<Inner>,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    store: Arc<dyn FlowStore>,
    graphs: Arc<dyn GraphRepository>,
    leases: Arc<dyn LeaseProvider>,
    config: EngineConfig,
    executors: ExecutorRegistry,
    ownership: Option<Arc<dyn OwnershipService>>,
    listeners: Listeners,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a node executor
    pub fn executor(mut self, executor: impl NodeExecutor) -> Self {
        self.executors.register(executor);
        self
    }

    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    /// Share an ownership service (defaults to one over the lease provider)
    pub fn ownership(mut self, ownership: Arc<dyn OwnershipService>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    pub fn flow_listener(mut self, listener: Arc<dyn FlowListener>) -> Self {
        self.listeners = self.listeners.with_flow(listener);
        self
    }

    pub fn run_group_listener(mut self, listener: Arc<dyn RunGroupListener>) -> Self {
        self.listeners = self.listeners.with_run_group(listener);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.admission.validate()?;

        let ownership: Arc<dyn OwnershipService> = match self.ownership {
            Some(ownership) => ownership,
            None => Arc::new(LeaseOwnershipService::new(
                Arc::clone(&self.leases),
                self.config.worker_id.clone(),
                self.config.ownership_ttl,
                self.config.ownership_protect,
            )),
        };
        let handles = NodeHandles::new(
            self.config.admission.clone(),
            self.config.node_max_in_flight,
        );

        info!(
            worker_id = %self.config.worker_id,
            executors = self.executors.len(),
            listeners = self.listeners.len(),
            "orchestrator ready"
        );

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                store: self.store,
                graphs: self.graphs,
                leases: self.leases,
                ownership,
                executors: self.executors,
                handles,
                listeners: self.listeners,
                tasks: TaskTracker::new(),
                sweeper: RetrySweeper::new(),
            }),
        })
    }
}

impl Orchestrator {
    pub fn builder(
        store: Arc<dyn FlowStore>,
        graphs: Arc<dyn GraphRepository>,
        leases: Arc<dyn LeaseProvider>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            graphs,
            leases,
            config: EngineConfig::default(),
            executors: ExecutorRegistry::new(),
            ownership: None,
            listeners: Listeners::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.inner.store
    }

    pub fn leases(&self) -> &Arc<dyn LeaseProvider> {
        &self.inner.leases
    }

    pub fn ownership(&self) -> &Arc<dyn OwnershipService> {
        &self.inner.ownership
    }

    pub(crate) fn listeners(&self) -> &Listeners {
        &self.inner.listeners
    }

    /// Submission handle of a node in this process
    pub async fn node_handle(&self, graph_id: Uuid, node_id: &str) -> Result<Arc<NodeHandle>> {
        let graph = self.graph_by_id(graph_id).await?;
        let node = Self::node(&graph, node_id)?;
        Ok(self.inner.handles.handle(graph.id, node))
    }

    /// Wait until every batch dispatched so far (and everything it
    /// dispatched in turn) has settled
    pub async fn quiesce(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    // ------------------------------------------------------------------
    // Starting runs
    // ------------------------------------------------------------------

    /// Start one run at the graph's start node
    #[instrument(skip(self, input), fields(graph = %graph))]
    pub async fn start_run(
        &self,
        graph: &GraphRef,
        input: Value,
        started_by: Option<String>,
    ) -> Result<RunHandle> {
        let graph = self.graph(graph).await?;
        let start = graph.start_node.clone();
        let trans_id = Uuid::now_v7();
        let (trace, context) = Self::begin(&graph, &start, trans_id, input, started_by.clone())?;
        let run = RunHandle {
            trans_id,
            trace_id: trace.id,
            context_id: context.id,
        };

        self.launch(&graph, &start, vec![trace], vec![context], started_by)
            .await?;
        Ok(run)
    }

    /// Start several runs under one trans; the trans completes once every
    /// run has
    #[instrument(skip(self, inputs), fields(graph = %graph, runs = inputs.len()))]
    pub async fn start_group(
        &self,
        graph: &GraphRef,
        inputs: Vec<Value>,
        started_by: Option<String>,
    ) -> Result<RunGroupHandle> {
        let graph = self.graph(graph).await?;
        let start = graph.start_node.clone();
        let trans_id = Uuid::now_v7();

        let mut traces = Vec::with_capacity(inputs.len());
        let mut contexts = Vec::with_capacity(inputs.len());
        for input in inputs {
            let (trace, context) = Self::begin(&graph, &start, trans_id, input, started_by.clone())?;
            traces.push(trace);
            contexts.push(context);
        }
        let runs = traces
            .iter()
            .zip(&contexts)
            .map(|(trace, context)| RunHandle {
                trans_id,
                trace_id: trace.id,
                context_id: context.id,
            })
            .collect();

        self.launch(&graph, &start, traces, contexts, started_by)
            .await?;
        Ok(RunGroupHandle { trans_id, runs })
    }

    /// Feed a node from an external publisher
    ///
    /// Every item starts a new run (own trans, own trace) at `node_id`.
    /// The returned task completes with the number of runs started once the
    /// publisher ends.
    pub async fn offer_node<S>(
        &self,
        graph: &GraphRef,
        node_id: &str,
        publisher: S,
        started_by: Option<String>,
    ) -> Result<JoinHandle<usize>>
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        let graph = self.graph(graph).await?;
        let node_id = Self::node(&graph, node_id)?.id.clone();
        let orchestrator = self.clone();

        Ok(tokio::spawn(async move {
            let mut publisher = Box::pin(publisher);
            let mut started = 0;
            while let Some(input) = publisher.next().await {
                let launched = match Self::begin(&graph, &node_id, Uuid::now_v7(), input, started_by.clone()) {
                    Ok((trace, context)) => {
                        orchestrator
                            .launch(&graph, &node_id, vec![trace], vec![context], started_by.clone())
                            .await
                    }
                    Err(e) => Err(e),
                };
                match launched {
                    Ok(()) => started += 1,
                    Err(e) => warn!(node_id = %node_id, error = %e, "offered input rejected"),
                }
            }
            debug!(node_id = %node_id, started, "publisher exhausted");
            started
        }))
    }

    fn begin(
        graph: &GraphDefinition,
        node_id: &str,
        trans_id: Uuid,
        input: Value,
        started_by: Option<String>,
    ) -> Result<(Trace, Context)> {
        let node = Self::node(graph, node_id)?;
        let mut trace = Trace::new(trans_id, graph.stream_id(), started_by);

        let mut payload = Payload::new(input);
        payload.engine.graph_id = Some(graph.id);
        payload.engine.meta_id = graph.meta_id.clone();
        payload.engine.version = graph.version;
        payload.engine.node_id = node.id.clone();
        payload.engine.node_type = Some(node.node_type);

        let context = Context::new(
            graph.stream_id(),
            trans_id,
            BTreeSet::from([trace.id]),
            &node.id,
            None,
            payload,
        );
        trace.context_ids.insert(context.id);
        Ok((trace, context))
    }

    // Ownership is taken before the trace is persisted; the protect window
    // covers the gap.
    async fn launch(
        &self,
        graph: &Arc<GraphDefinition>,
        node_id: &str,
        traces: Vec<Trace>,
        contexts: Vec<Context>,
        started_by: Option<String>,
    ) -> Result<()> {
        for trace in &traces {
            if !self.inner.ownership.own(trace.id, trace.trans_id).await? {
                warn!(trace_id = %trace.id, "could not own new trace");
            }
        }
        self.inner.store.create_run(&traces, &contexts).await?;

        for (trace, context) in traces.iter().zip(&contexts) {
            info!(
                trans_id = %trace.trans_id,
                trace_id = %trace.id,
                graph_id = %graph.id,
                node_id,
                "run started"
            );
            self.listeners()
                .emit(&FlowEvent::RunStarted {
                    trans_id: trace.trans_id,
                    trace_ids: vec![trace.id],
                    graph_id: graph.id,
                    version: graph.version,
                    input: context.payload.business.clone(),
                    started_by: started_by.clone(),
                })
                .await;
        }

        self.dispatch(Arc::clone(graph), node_id.to_string(), contexts, Dispatch::Fresh);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Parked contexts
    // ------------------------------------------------------------------

    /// Merge caller data into PENDING contexts and hand them back to their
    /// nodes
    ///
    /// Contexts that are not PENDING, or belong to another graph, are left
    /// alone. All selected contexts move together or not at all; a lost race
    /// returns 0.
    #[instrument(skip(self, patches), fields(contexts = patches.len()))]
    pub async fn resume(
        &self,
        graph_id: Uuid,
        patches: BTreeMap<Uuid, Value>,
        operator: Option<&str>,
    ) -> Result<u64> {
        let ids: Vec<Uuid> = patches.keys().copied().collect();
        let found = self.inner.store.get_contexts(&ids).await?;
        if found.is_empty() {
            return Err(EngineError::ContextsNotFound(ids));
        }
        let graph = self.graph_by_id(graph_id).await?;

        let mut resumed = vec![];
        for mut ctx in found {
            if ctx.status != ContextStatus::Pending || ctx.stream.graph_id != graph_id {
                debug!(context_id = %ctx.id, status = %ctx.status, "not resumable");
                continue;
            }
            if let Some(patch) = patches.get(&ctx.id) {
                ctx.payload.merge(patch);
                if graph.output_scoping {
                    Self::rederive_scope(&graph, &mut ctx.payload);
                }
            }
            ctx.updated_at = Utc::now();
            resumed.push(ctx);
        }
        if resumed.is_empty() {
            return Ok(0);
        }

        let written = self
            .inner
            .store
            .update_contexts(&resumed, ContextStatus::Pending)
            .await?;
        if written == 0 {
            info!("resume lost a race, nothing changed");
            return Ok(0);
        }

        info!(resumed = written, operator, "contexts resumed");
        self.dispatch_by_node(&graph, resumed);
        Ok(written)
    }

    // Scope entries are snapshots of the business data; refresh every one
    // the context carries after its data changed
    fn rederive_scope(graph: &GraphDefinition, payload: &mut Payload) {
        let scoped: Vec<String> = payload.scope.keys().cloned().collect();
        for node_id in scoped {
            if let Some(node) = graph.node(&node_id) {
                payload.derive_scope(&node.id, &node.output_keys);
            }
        }
    }

    /// Complete PENDING contexts waiting on an asynchronous job
    ///
    /// The result is shaped by the node executor's declared output before it
    /// is merged. Returns the number of contexts advanced.
    #[instrument(skip(self, result), fields(contexts = context_ids.len()))]
    pub async fn resume_async_job(&self, context_ids: &[Uuid], result: Value) -> Result<u64> {
        let found = self.inner.store.get_contexts(context_ids).await?;
        if found.is_empty() {
            return Err(EngineError::ContextsNotFound(context_ids.to_vec()));
        }

        let mut advanced = 0;
        for ctx in found {
            if ctx.status != ContextStatus::Pending {
                debug!(context_id = %ctx.id, status = %ctx.status, "not waiting on a job");
                continue;
            }
            let graph = self.graph_by_id(ctx.stream.graph_id).await?;
            let node = Self::node(&graph, &ctx.position)?;
            let shape = node
                .executor
                .as_deref()
                .and_then(|t| self.inner.executors.get(t))
                .map(|e| e.output_shape())
                .unwrap_or_else(|| Value::Object(Default::default()));
            let output = shape_output(&shape, &result);

            if self
                .complete_context(&graph, node, ctx, &output, ContextStatus::Pending)
                .await?
            {
                advanced += 1;
            }
        }
        Ok(advanced)
    }

    /// Fail PENDING contexts waiting on an asynchronous job
    #[instrument(skip(self, failure), fields(contexts = context_ids.len()))]
    pub async fn fail_async_job(&self, context_ids: &[Uuid], failure: NodeFailure) -> Result<u64> {
        let found = self.inner.store.get_contexts(context_ids).await?;
        if found.is_empty() {
            return Err(EngineError::ContextsNotFound(context_ids.to_vec()));
        }

        let mut failed = 0;
        for ctx in found {
            if ctx.status != ContextStatus::Pending {
                continue;
            }
            let position = ctx.position.clone();
            if self
                .fail_context(ctx, &position, &failure, ContextStatus::Pending)
                .await?
            {
                failed += 1;
            }
        }
        Ok(failed)
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Terminate every open context of a trace and the trace itself
    ///
    /// Idempotent: a trace that already has a terminal status is left alone.
    #[instrument(skip(self))]
    pub async fn terminate(
        &self,
        trace_id: Uuid,
        scope: TerminateScope,
        operator: Option<&str>,
    ) -> Result<TerminateReport> {
        let trace = self
            .inner
            .store
            .get_trace(trace_id)
            .await?
            .ok_or(EngineError::TraceNotFound(trace_id))?;
        if trace.status.is_terminal() {
            debug!(%trace_id, status = %trace.status, "trace already finished");
            return Ok(TerminateReport::default());
        }

        let contexts = self.inner.store.contexts_by_trace(trace_id).await?;
        let mut targets = BTreeSet::from([trace_id]);
        if scope == TerminateScope::WithRelated {
            targets.extend(contexts.iter().flat_map(|c| c.trace_ids.iter().copied()));
        }

        let mut report = TerminateReport::default();
        for target in targets {
            let open: Vec<Uuid> = if target == trace_id {
                open_ids(&contexts)
            } else {
                open_ids(&self.inner.store.contexts_by_trace(target).await?)
            };
            let changed = self
                .inner
                .store
                .update_status_if(
                    &open,
                    &[
                        ContextStatus::New,
                        ContextStatus::Pending,
                        ContextStatus::Ready,
                        ContextStatus::Retryable,
                    ],
                    ContextStatus::Terminate,
                )
                .await?;
            let finished = self
                .inner
                .store
                .finish_trace(target, TraceStatus::Terminate)
                .await?;

            report.contexts += changed;
            report.traces += finished;
            if changed > 0 || finished > 0 {
                self.listeners()
                    .emit(&FlowEvent::TraceTerminated {
                        trace_id: target,
                        contexts: changed,
                    })
                    .await;
            }
        }

        info!(
            %trace_id,
            traces = report.traces,
            contexts = report.contexts,
            operator,
            "trace terminated"
        );
        Ok(report)
    }

    /// Delete a run and everything only it references
    pub async fn delete_run(&self, trace_id: Uuid) -> Result<u64> {
        self.inner.ownership.release(trace_id).await?;
        let deleted = self.inner.store.delete_run(trace_id).await?;
        info!(%trace_id, deleted, "run deleted");
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Status and completion percentage of traces, with the configured
    /// algorithm
    pub async fn get_completeness(&self, trace_ids: &[Uuid]) -> Result<Vec<Completeness>> {
        self.get_completeness_with(trace_ids, self.inner.config.completeness)
            .await
    }

    pub async fn get_completeness_with(
        &self,
        trace_ids: &[Uuid],
        algorithm: CompletenessAlgorithm,
    ) -> Result<Vec<Completeness>> {
        let mut reports = Vec::with_capacity(trace_ids.len());
        for &trace_id in trace_ids {
            let trace = self
                .inner
                .store
                .get_trace(trace_id)
                .await?
                .ok_or(EngineError::TraceNotFound(trace_id))?;
            let graph = self.graph_by_id(trace.stream.graph_id).await?;
            let contexts = self.inner.store.contexts_by_trace(trace_id).await?;
            reports.push(algorithm.evaluate(trace_id, trace.status, &graph, &contexts));
        }
        Ok(reports)
    }

    /// Failed contexts of a trace
    pub async fn get_error_info(&self, trace_id: Uuid) -> Result<Vec<ErrorInfo>> {
        let trace = self
            .inner
            .store
            .get_trace(trace_id)
            .await?
            .ok_or(EngineError::TraceNotFound(trace_id))?;
        let graph = self.graph_by_id(trace.stream.graph_id).await?;

        let contexts = self.inner.store.contexts_by_trace(trace_id).await?;
        Ok(contexts
            .into_iter()
            .filter(|c| c.status == ContextStatus::Error)
            .filter_map(|c| {
                let error = c.error?;
                let node_name = graph
                    .node(&c.position)
                    .map(|n| n.name.clone())
                    .unwrap_or_else(|| c.position.clone());
                Some(ErrorInfo {
                    context_id: c.id,
                    node_id: c.position,
                    node_name,
                    business: c.payload.business,
                    error,
                })
            })
            .collect())
    }

    /// Re-dispatch the contexts an adopted trace was left with
    ///
    /// NEW contexts were never consumed. READY ones were executing in the
    /// previous owner, or were claimed for a retry by it, and died with it;
    /// they go back through admission at their node.
    pub async fn recover_trace(&self, trace_id: Uuid) -> Result<usize> {
        let store = &self.inner.store;
        let contexts = store.contexts_by_trace(trace_id).await?;

        let abandoned: Vec<Uuid> = contexts
            .iter()
            .filter(|c| c.status == ContextStatus::Ready)
            .map(|c| c.id)
            .collect();
        if !abandoned.is_empty() {
            store
                .update_status_if(&abandoned, &[ContextStatus::Ready], ContextStatus::Pending)
                .await?;
        }

        let candidates: Vec<Uuid> = contexts
            .iter()
            .filter(|c| c.status == ContextStatus::New || c.status == ContextStatus::Ready)
            .map(|c| c.id)
            .collect();
        let stranded: Vec<Context> = store
            .get_contexts(&candidates)
            .await?
            .into_iter()
            .filter(|c| match c.status {
                ContextStatus::New => true,
                ContextStatus::Pending => abandoned.contains(&c.id),
                _ => false,
            })
            .collect();
        let Some(first) = stranded.first() else {
            return Ok(0);
        };

        let graph = self.graph_by_id(first.stream.graph_id).await?;
        let count = stranded.len();
        info!(
            %trace_id,
            contexts = count,
            abandoned = abandoned.len(),
            "recovering stranded contexts"
        );
        self.dispatch_by_node(&graph, stranded);
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Resolve a graph that new runs may start on
    pub(crate) async fn graph(&self, graph: &GraphRef) -> Result<Arc<GraphDefinition>> {
        let resolved = self
            .inner
            .graphs
            .resolve(graph)
            .await
            .ok_or_else(|| EngineError::GraphNotFound(graph.to_string()))?;
        if !resolved.active {
            return Err(EngineError::GraphInactive(graph.to_string()));
        }
        Ok(resolved)
    }

    /// Graph of existing contexts; inactive versions still finish their runs
    pub(crate) async fn graph_by_id(&self, graph_id: Uuid) -> Result<Arc<GraphDefinition>> {
        self.inner
            .graphs
            .get(graph_id)
            .await
            .ok_or_else(|| EngineError::GraphNotFound(graph_id.to_string()))
    }

    pub(crate) fn node<'a>(graph: &'a GraphDefinition, node_id: &str) -> Result<&'a NodeDefinition> {
        graph.node(node_id).ok_or_else(|| EngineError::NodeNotFound {
            graph: graph.id.to_string(),
            node: node_id.to_string(),
        })
    }
}

fn open_ids(contexts: &[Context]) -> Vec<Uuid> {
    contexts
        .iter()
        .filter(|c| !c.status.is_terminal())
        .map(|c| c.id)
        .collect()
}
