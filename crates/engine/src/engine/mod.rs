//! Orchestration: runs, batches and progress reporting
//!
//! The [`Orchestrator`] starts runs, executes batches of contexts at their
//! nodes and answers progress queries. [`CompletenessAlgorithm`] rolls
//! contexts up into trace status and completion percentage.

mod completeness;
mod dispatch;
mod orchestrator;

pub use completeness::{rollup_traces, Completeness, CompletenessAlgorithm};
pub use orchestrator::{
    ErrorInfo, Orchestrator, OrchestratorBuilder, RunGroupHandle, RunHandle, TerminateReport,
    TerminateScope,
};

pub(crate) use dispatch::{new_batch_key, panic_message, Dispatch};
