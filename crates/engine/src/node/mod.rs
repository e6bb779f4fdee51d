//! Nodes as the engine sees them: executors, admission gates and handles

mod admission;
mod executor;
mod registry;

pub use admission::{AdmissionConfig, AdmissionError, AdmissionGate, InFlight};
pub use executor::{
    shape_output, NodeExecutor, NodeFailure, NodeInput, NodeOutcome, EXECUTOR_NOT_FOUND_KIND,
    PANIC_KIND, RETRY_EXHAUSTED_KIND, TIMEOUT_KIND,
};
pub use registry::{ExecutorRegistry, NodeHandle, NodeHandles};
