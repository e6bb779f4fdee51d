//! Graph definition lookup

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::{GraphDefinition, GraphError};

/// How callers address a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GraphRef {
    /// Concrete graph id (already pinned to a version)
    Id(Uuid),

    /// Logical graph id plus version
    Meta { meta_id: String, version: u32 },
}

impl GraphRef {
    pub fn meta(meta_id: impl Into<String>, version: u32) -> Self {
        Self::Meta {
            meta_id: meta_id.into(),
            version,
        }
    }
}

impl std::fmt::Display for GraphRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Meta { meta_id, version } => write!(f, "{meta_id}@{version}"),
        }
    }
}

/// Read-only access to graph definitions
///
/// The authoring and storage of graphs lives outside the engine; this is
/// the boundary it is consumed through.
#[async_trait]
pub trait GraphRepository: Send + Sync + 'static {
    /// Resolve a graph reference
    async fn resolve(&self, graph: &GraphRef) -> Option<Arc<GraphDefinition>>;

    /// Look up by concrete graph id
    async fn get(&self, graph_id: Uuid) -> Option<Arc<GraphDefinition>> {
        self.resolve(&GraphRef::Id(graph_id)).await
    }
}

/// In-memory graph repository
#[derive(Default)]
pub struct InMemoryGraphRepository {
    by_id: DashMap<Uuid, Arc<GraphDefinition>>,
    by_meta: DashMap<(String, u32), Uuid>,
}

impl InMemoryGraphRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a graph, returning its id
    pub fn register(&self, graph: GraphDefinition) -> Result<Uuid, GraphError> {
        graph.validate()?;
        let id = graph.id;
        self.by_meta
            .insert((graph.meta_id.clone(), graph.version), id);
        self.by_id.insert(id, Arc::new(graph));
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl GraphRepository for InMemoryGraphRepository {
    async fn resolve(&self, graph: &GraphRef) -> Option<Arc<GraphDefinition>> {
        let id = match graph {
            GraphRef::Id(id) => *id,
            GraphRef::Meta { meta_id, version } => {
                *self.by_meta.get(&(meta_id.clone(), *version))?
            }
        };
        self.by_id.get(&id).map(|g| Arc::clone(g.value()))
    }
}
