//! Graph definitions consumed read-only by the engine

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::StreamId;

/// Kind of a node, as far as the engine cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Entry node of the graph
    Start,

    /// Regular work node
    Task,

    /// Node whose work completes out of band (resume_async_job)
    Async,

    /// Exit node; ARCHIVED contexts here count towards PARTIAL_ERROR
    End,
}

/// Graph validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("start node {0} is not defined")]
    MissingStartNode(String),

    #[error("duplicate node id {0}")]
    DuplicateNode(String),

    #[error("event {event} references unknown node {node}")]
    UnknownEventNode { event: String, node: String },
}

/// A node of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,

    /// Registered executor type; `None` makes the node pass-through
    pub executor: Option<String>,

    /// Admission limit for in-flight contexts (engine default when absent)
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    /// Execution timeout; expiry is a retryable failure
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,

    /// Business keys this node exposes to the output scope
    #[serde(default)]
    pub output_keys: Vec<String>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            node_type,
            executor: None,
            max_in_flight: None,
            timeout: None,
            output_keys: vec![],
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, NodeType::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, NodeType::End)
    }

    pub fn task(id: impl Into<String>, executor: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, NodeType::Task).with_executor(executor)
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max.max(1));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_output_keys(mut self, keys: Vec<String>) -> Self {
        self.output_keys = keys;
        self
    }
}

/// A directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub id: String,
    pub source: String,
    pub target: String,
}

/// Versioned graph of nodes and events
///
/// # Example
///
/// ```
/// use flowmesh_engine::graph::{GraphDefinition, NodeDefinition};
///
/// let graph = GraphDefinition::new("orders", 1, "start")
///     .with_node(NodeDefinition::start("start"))
///     .with_node(NodeDefinition::task("charge", "payment"))
///     .with_node(NodeDefinition::end("done"))
///     .with_event("e1", "start", "charge")
///     .with_event("e2", "charge", "done");
///
/// assert!(graph.validate().is_ok());
/// assert_eq!(graph.layers().len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub id: Uuid,
    pub meta_id: String,
    pub version: u32,
    pub active: bool,

    /// Maintain the per-node output-scope cache on payloads
    #[serde(default)]
    pub output_scoping: bool,

    pub start_node: String,
    pub nodes: Vec<NodeDefinition>,
    pub events: Vec<EventDefinition>,
}

impl GraphDefinition {
    pub fn new(meta_id: impl Into<String>, version: u32, start_node: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            meta_id: meta_id.into(),
            version,
            active: true,
            output_scoping: false,
            start_node: start_node.into(),
            nodes: vec![],
            events: vec![],
        }
    }

    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_event(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.events.push(EventDefinition {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn with_output_scoping(mut self, enabled: bool) -> Self {
        self.output_scoping = enabled;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn stream_id(&self) -> StreamId {
        StreamId::new(self.id, self.version)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn start(&self) -> Option<&NodeDefinition> {
        self.node(&self.start_node)
    }

    pub fn outbound_events<'a>(
        &'a self,
        node_id: &'a str,
    ) -> impl Iterator<Item = &'a EventDefinition> + 'a {
        self.events.iter().filter(move |e| e.source == node_id)
    }

    pub fn inbound_events<'a>(
        &'a self,
        node_id: &'a str,
    ) -> impl Iterator<Item = &'a EventDefinition> + 'a {
        self.events.iter().filter(move |e| e.target == node_id)
    }

    pub fn is_end(&self, node_id: &str) -> bool {
        self.node(node_id)
            .map(|n| n.node_type == NodeType::End)
            .unwrap_or(false)
    }

    /// Check structural consistency
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }
        if !ids.contains(self.start_node.as_str()) {
            return Err(GraphError::MissingStartNode(self.start_node.clone()));
        }
        for event in &self.events {
            for node in [&event.source, &event.target] {
                if !ids.contains(node.as_str()) {
                    return Err(GraphError::UnknownEventNode {
                        event: event.id.clone(),
                        node: node.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Breadth-first layers from the start node
    ///
    /// Every reachable node appears exactly once, in the first layer it is
    /// reached at. Unreachable nodes are not part of any layer.
    pub fn layers(&self) -> Vec<Vec<&NodeDefinition>> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for event in &self.events {
            adjacency
                .entry(event.source.as_str())
                .or_default()
                .push(event.target.as_str());
        }

        let mut layers = vec![];
        let mut visited: HashSet<&str> = HashSet::new();
        let mut frontier: VecDeque<&str> = VecDeque::new();
        if self.start().is_some() {
            visited.insert(self.start_node.as_str());
            frontier.push_back(self.start_node.as_str());
        }

        while !frontier.is_empty() {
            let mut layer = vec![];
            let mut next = VecDeque::new();
            while let Some(node_id) = frontier.pop_front() {
                if let Some(node) = self.node(node_id) {
                    layer.push(node);
                }
                for target in adjacency.get(node_id).into_iter().flatten() {
                    if visited.insert(*target) {
                        next.push_back(*target);
                    }
                }
            }
            layers.push(layer);
            frontier = next;
        }

        layers
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
