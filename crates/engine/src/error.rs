//! Engine error types

use uuid::Uuid;

use crate::graph::GraphError;
use crate::lease::LeaseError;
use crate::model::InvalidTransition;
use crate::node::AdmissionError;
use crate::persistence::StoreError;

/// Errors returned to callers of the orchestrator
///
/// Lost races are not errors; operations that lose one simply change
/// nothing.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No graph matches the reference
    #[error("graph not found: {0}")]
    GraphNotFound(String),

    /// The graph version is deactivated
    #[error("graph {0} is inactive")]
    GraphInactive(String),

    /// The graph definition is inconsistent
    #[error("invalid graph: {0}")]
    InvalidGraph(#[from] GraphError),

    /// Node id not part of the graph
    #[error("node {node} not found in graph {graph}")]
    NodeNotFound { graph: String, node: String },

    /// None of the referenced contexts exist
    #[error("none of the referenced contexts exist: {0:?}")]
    ContextsNotFound(Vec<Uuid>),

    /// Trace not found
    #[error("trace not found: {0}")]
    TraceNotFound(Uuid),

    /// Context state machine violation
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Lease backend error
    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),

    /// Engine configuration rejected at build time
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] AdmissionError),
}

/// Result alias for engine operations
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
