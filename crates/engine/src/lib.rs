//! # Flowmesh Engine
//!
//! A distributed engine that runs data through graphs of nodes. Every
//! process runs the same engine against a shared store; cooperation between
//! processes goes through leases only.
//!
//! ## Features
//!
//! - **Contexts**: each unit of data at each graph position is a persisted
//!   [`Context`] whose status moves through a guarded state machine
//! - **Retries**: retryable failures are parked in batches and resubmitted by
//!   the retry sweep, with exactly one process winning each attempt
//! - **Ownership**: exactly one process computes the status of a trace, and
//!   orphaned traces are adopted
//! - **Completion**: a group of runs reports its completion exactly once
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                           │
//! │  (start / resume / terminate, dispatch to node handles)     │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌────────────────────┐
//! │ RetryScheduler  │ │ StatusCalculator │ │ OwnershipService   │
//! │ (sweep tickets) │ │ (rollup, trans)  │ │ (trace leases)     │
//! └─────────────────┘ └──────────────────┘ └────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            FlowStore + LeaseProvider (PostgreSQL)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowmesh_engine::prelude::*;
//!
//! let orchestrator = Orchestrator::builder(store, graphs, leases)
//!     .config(EngineConfig::from_env())
//!     .executor(HttpExecutor::new())
//!     .build()?;
//!
//! let run = orchestrator
//!     .start_run(&GraphRef::meta("orders", 1), json!({"id": 7}), None)
//!     .await?;
//! let completeness = orchestrator.get_completeness(&[run.trace_id]).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod lease;
pub mod listener;
pub mod model;
pub mod node;
pub mod ownership;
pub mod persistence;
pub mod retry;
pub mod status;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{
        Completeness, CompletenessAlgorithm, Orchestrator, RunGroupHandle, RunHandle,
        TerminateScope,
    };
    pub use crate::error::{EngineError, Result};
    pub use crate::graph::{
        EventDefinition, GraphDefinition, GraphRef, GraphRepository, InMemoryGraphRepository,
        NodeDefinition, NodeType,
    };
    pub use crate::lease::{InMemoryLeaseProvider, LeaseProvider, PostgresLeaseProvider};
    pub use crate::listener::{FlowEvent, FlowListener, RunGroupCompleted, RunGroupListener};
    pub use crate::model::{Context, ContextStatus, ErrorDetail, Trace, TraceStatus};
    pub use crate::node::{NodeExecutor, NodeFailure, NodeInput, NodeOutcome};
    pub use crate::ownership::{LeaseOwnershipService, OwnershipService};
    pub use crate::persistence::{FlowStore, InMemoryFlowStore, PostgresFlowStore};
    pub use crate::retry::{RetryPolicy, RetryScheduler};
    pub use crate::status::StatusCalculator;
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use engine::{
    Completeness, CompletenessAlgorithm, ErrorInfo, Orchestrator, OrchestratorBuilder,
    RunGroupHandle, RunHandle, TerminateReport, TerminateScope,
};
pub use error::{EngineError, Result};
pub use graph::{GraphDefinition, GraphRef, GraphRepository, InMemoryGraphRepository};
pub use lease::{InMemoryLeaseProvider, LeaseProvider, PostgresLeaseProvider};
pub use model::{Context, ContextStatus, Trace, TraceStatus};
pub use node::{NodeExecutor, NodeFailure, NodeOutcome};
pub use ownership::{LeaseOwnershipService, OwnershipService};
pub use persistence::{FlowStore, InMemoryFlowStore, PostgresFlowStore, StoreError};
pub use retry::{RetryPolicy, RetryScheduler, SweepReport};
pub use status::{StatusCalculator, StatusReport};
