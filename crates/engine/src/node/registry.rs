//! Executor registry and per-node handles

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::{AdmissionConfig, AdmissionGate, InFlight, NodeExecutor};
use crate::graph::NodeDefinition;

/// Registry of node executors keyed by executor type
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under its own type name
    pub fn register(&mut self, executor: impl NodeExecutor) {
        let executor: Arc<dyn NodeExecutor> = Arc::new(executor);
        self.executors
            .insert(executor.executor_type().to_string(), executor);
    }

    /// Builder form of [`ExecutorRegistry::register`]
    pub fn with(mut self, executor: impl NodeExecutor) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, executor_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(executor_type).cloned()
    }

    pub fn contains(&self, executor_type: &str) -> bool {
        self.executors.contains_key(executor_type)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executor_types", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Admission-controlled entry point of one (graph, node) in this process
pub struct NodeHandle {
    graph_id: Uuid,
    node_id: String,
    gate: Arc<AdmissionGate>,
}

impl NodeHandle {
    pub fn graph_id(&self) -> Uuid {
        self.graph_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn is_saturated(&self) -> bool {
        self.gate.is_saturated()
    }

    /// Count one context in flight regardless of the gate
    pub fn submit(&self) -> InFlight {
        self.gate.enter()
    }

    /// Admit up to `wanted` contexts, see [`AdmissionGate::try_enter`]
    pub fn admit(&self, wanted: usize) -> Vec<InFlight> {
        self.gate.try_enter(wanted)
    }
}

/// Lazily created node handles of this process
pub struct NodeHandles {
    config: AdmissionConfig,
    default_max_in_flight: usize,
    handles: DashMap<(Uuid, String), Arc<NodeHandle>>,
}

impl NodeHandles {
    pub fn new(config: AdmissionConfig, default_max_in_flight: usize) -> Self {
        Self {
            config,
            default_max_in_flight,
            handles: DashMap::new(),
        }
    }

    /// Handle for `node`, created on first use
    pub fn handle(&self, graph_id: Uuid, node: &NodeDefinition) -> Arc<NodeHandle> {
        self.handles
            .entry((graph_id, node.id.clone()))
            .or_insert_with(|| {
                let max = node.max_in_flight.unwrap_or(self.default_max_in_flight);
                Arc::new(NodeHandle {
                    graph_id,
                    node_id: node.id.clone(),
                    gate: Arc::new(AdmissionGate::new(self.config.clone(), max)),
                })
            })
            .clone()
    }
}
