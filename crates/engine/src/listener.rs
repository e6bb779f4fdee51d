// Flow listeners
//
// Listeners are notified after the state they describe has been persisted.
// They must be fast; heavy work belongs in a spawned task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::panic_message;
use crate::model::{ErrorDetail, TraceStatus};

// ============================================================================
// FlowListener
// ============================================================================

/// Observable moments in the life of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A run (or run group) was started, with a snapshot of its input
    RunStarted {
        trans_id: Uuid,
        trace_ids: Vec<Uuid>,
        graph_id: Uuid,
        version: u32,
        input: Value,
        started_by: Option<String>,
    },

    /// A context failed permanently at a node
    NodeFailed {
        context_id: Uuid,
        trace_ids: Vec<Uuid>,
        graph_id: Uuid,
        error: ErrorDetail,
    },

    /// Contexts of a trace were terminated
    TraceTerminated { trace_id: Uuid, contexts: u64 },
}

/// Receives [`FlowEvent`]s
#[async_trait]
pub trait FlowListener: Send + Sync {
    async fn on_event(&self, event: &FlowEvent);

    fn name(&self) -> &'static str {
        "FlowListener"
    }
}

// ============================================================================
// RunGroupListener
// ============================================================================

/// A trans reached a non-RUNNING status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunGroupCompleted {
    pub trans_id: Uuid,
    pub graph_id: Uuid,
    pub version: u32,
    pub trace_ids: Vec<Uuid>,
    pub status: TraceStatus,
}

/// Completion callback consumer; called at most once per trans
#[async_trait]
pub trait RunGroupListener: Send + Sync {
    async fn on_run_group_completed(&self, event: &RunGroupCompleted);

    fn name(&self) -> &'static str {
        "RunGroupListener"
    }
}

/// Fan-out to several flow listeners
#[derive(Clone, Default)]
pub struct Listeners {
    flow: Vec<Arc<dyn FlowListener>>,
    run_group: Vec<Arc<dyn RunGroupListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flow(mut self, listener: Arc<dyn FlowListener>) -> Self {
        self.flow.push(listener);
        self
    }

    pub fn with_run_group(mut self, listener: Arc<dyn RunGroupListener>) -> Self {
        self.run_group.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.flow.len() + self.run_group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notify every flow listener; a panicking listener is logged and skipped
    pub async fn emit(&self, event: &FlowEvent) {
        for listener in &self.flow {
            if let Err(panic) = AssertUnwindSafe(listener.on_event(event)).catch_unwind().await {
                tracing::error!(
                    listener = listener.name(),
                    panic = %panic_message(panic.as_ref()),
                    "flow listener panicked"
                );
            }
        }
    }

    /// Fire the completion callbacks of a trans
    pub async fn run_group_completed(&self, event: &RunGroupCompleted) {
        for listener in &self.run_group {
            tracing::debug!(listener = listener.name(), trans_id = %event.trans_id, "run group callback");
            let callback = AssertUnwindSafe(listener.on_run_group_completed(event)).catch_unwind();
            if let Err(panic) = callback.await {
                tracing::error!(
                    listener = listener.name(),
                    trans_id = %event.trans_id,
                    panic = %panic_message(panic.as_ref()),
                    "run group listener panicked"
                );
            }
        }
    }
}
