//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use flowmesh_engine::graph::{GraphDefinition, InMemoryGraphRepository, NodeDefinition};
use flowmesh_engine::node::{ExecutorRegistry, NodeExecutor, NodeFailure, NodeInput, NodeOutcome};
use flowmesh_engine::{EngineConfig, InMemoryFlowStore, InMemoryLeaseProvider, Orchestrator, RetryPolicy};

/// Store, graphs and leases shared by every orchestrator of a test, the way
/// processes share a database
pub struct Cluster {
    pub store: Arc<InMemoryFlowStore>,
    pub graphs: Arc<InMemoryGraphRepository>,
    pub leases: Arc<InMemoryLeaseProvider>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryFlowStore::new()),
            graphs: Arc::new(InMemoryGraphRepository::new()),
            leases: Arc::new(InMemoryLeaseProvider::new()),
        }
    }

    pub fn register(&self, graph: GraphDefinition) -> Uuid {
        self.graphs.register(graph).unwrap()
    }

    pub fn orchestrator(&self, worker_id: &str, executors: ExecutorRegistry) -> Orchestrator {
        Orchestrator::builder(self.store.clone(), self.graphs.clone(), self.leases.clone())
            .config(test_config(worker_id))
            .executors(executors)
            .build()
            .unwrap()
    }
}

/// Retries become due again only after a minute, so a test drives every
/// attempt explicitly
pub fn test_config(worker_id: &str) -> EngineConfig {
    EngineConfig::default()
        .with_worker_id(worker_id)
        .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(60), 3))
}

/// start -> `node` -> done
pub fn chain(meta_id: &str, node: NodeDefinition) -> GraphDefinition {
    let node_id = node.id.clone();
    GraphDefinition::new(meta_id, 1, "start")
        .with_node(NodeDefinition::start("start"))
        .with_node(node)
        .with_node(NodeDefinition::end("done"))
        .with_event("e1", "start", &node_id)
        .with_event("e2", &node_id, "done")
}

/// How a [`Flaky`] executor misbehaves on its early attempts
#[derive(Debug, Clone, Copy)]
pub enum Misbehave {
    /// Sleeps far past any node timeout
    Hang,
    /// Returns a retryable failure
    Fail,
}

/// Misbehaves on the first `bad_attempts` attempts of each context, then
/// succeeds
pub struct Flaky {
    pub bad_attempts: u32,
    pub mode: Misbehave,
    pub calls: Arc<AtomicUsize>,
}

impl Flaky {
    pub fn new(bad_attempts: u32, mode: Misbehave) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                bad_attempts,
                mode,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl NodeExecutor for Flaky {
    fn executor_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, input: &NodeInput) -> NodeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if input.attempt > self.bad_attempts {
            return NodeOutcome::Completed(json!({"handled_by": "flaky"}));
        }
        match self.mode {
            Misbehave::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                NodeOutcome::Completed(Value::Null)
            }
            Misbehave::Fail => NodeOutcome::Failed(NodeFailure::retryable("upstream unavailable")),
        }
    }
}

/// Always fails for good
pub struct Reject;

#[async_trait]
impl NodeExecutor for Reject {
    fn executor_type(&self) -> &str {
        "reject"
    }

    async fn execute(&self, _input: &NodeInput) -> NodeOutcome {
        NodeOutcome::Failed(NodeFailure::non_retryable("rejected").with_kind("REJECTED"))
    }
}

/// Hands work to an outside system unless the business data is approved
pub struct Approval;

#[async_trait]
impl NodeExecutor for Approval {
    fn executor_type(&self) -> &str {
        "approval"
    }

    fn output_shape(&self) -> Value {
        json!({"approved": false})
    }

    async fn execute(&self, input: &NodeInput) -> NodeOutcome {
        if input.business.get("approved") == Some(&json!(true)) {
            NodeOutcome::Completed(Value::Null)
        } else {
            NodeOutcome::Deferred
        }
    }
}

/// Always hands work to an outside system
pub struct Hold;

#[async_trait]
impl NodeExecutor for Hold {
    fn executor_type(&self) -> &str {
        "hold"
    }

    async fn execute(&self, _input: &NodeInput) -> NodeOutcome {
        NodeOutcome::Deferred
    }
}

/// Records how many executions overlap at most
pub struct Gauge {
    current: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

impl Gauge {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        (
            Self {
                current: AtomicUsize::new(0),
                peak: peak.clone(),
            },
            peak,
        )
    }
}

#[async_trait]
impl NodeExecutor for Gauge {
    fn executor_type(&self) -> &str {
        "gauge"
    }

    async fn execute(&self, _input: &NodeInput) -> NodeOutcome {
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        NodeOutcome::Completed(Value::Null)
    }
}

/// Panics on every call
pub struct Crash;

#[async_trait]
impl NodeExecutor for Crash {
    fn executor_type(&self) -> &str {
        "crash"
    }

    async fn execute(&self, _input: &NodeInput) -> NodeOutcome {
        panic!("index out of bounds")
    }
}

/// Every executor the fixtures define
pub fn all_executors() -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with(Reject)
        .with(Approval)
        .with(Hold)
        .with(Crash)
}
