//! Node executor contract
//!
//! Executors perform the business work of a node. The engine never looks
//! inside business data; it merges whatever an executor returns.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::ErrorDetail;

/// Failure kind recorded when an execution exceeds the node timeout
pub const TIMEOUT_KIND: &str = "TIMEOUT";

/// Failure kind of a batch that used up every retry attempt
pub const RETRY_EXHAUSTED_KIND: &str = "RETRY_EXHAUSTED";

/// Failure kind of a node whose executor type is not registered
pub const EXECUTOR_NOT_FOUND_KIND: &str = "EXECUTOR_NOT_FOUND";

/// Failure kind of an executor that panicked
pub const PANIC_KIND: &str = "PANIC";

/// Failure returned by a node executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub message: String,

    /// Error code for programmatic handling
    pub kind: Option<String>,

    /// Retryable failures park the context for the retry sweep
    pub retryable: bool,

    pub details: Option<Value>,
}

impl NodeFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: false,
            details: None,
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::retryable(format!("node execution timed out after {after:?}")).with_kind(TIMEOUT_KIND)
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Error record stored on the failed context
    pub fn to_detail(&self, node_id: &str, attempt: u32) -> ErrorDetail {
        ErrorDetail {
            node_id: node_id.to_string(),
            message: self.message.clone(),
            kind: self.kind.clone(),
            details: self.details.clone(),
            attempt,
            occurred_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NodeFailure {}

impl From<anyhow::Error> for NodeFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Result of executing one context at a node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Work done; the value is merged into the business data (`null`
    /// leaves it untouched)
    Completed(Value),

    /// Work handed to an external system; completes through
    /// `resume_async_job` or `fail_async_job`
    Deferred,

    Failed(NodeFailure),
}

/// What an executor sees of a context
#[derive(Debug, Clone)]
pub struct NodeInput {
    pub context_id: Uuid,
    pub trace_ids: BTreeSet<Uuid>,
    pub graph_id: Uuid,
    pub node_id: String,

    /// 1 on first execution, incremented by every retry
    pub attempt: u32,

    pub business: Value,
    pub pass_through: Value,
}

/// Business work behind a node
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use flowmesh_engine::node::{NodeExecutor, NodeInput, NodeOutcome};
/// use serde_json::json;
///
/// struct Approve;
///
/// #[async_trait]
/// impl NodeExecutor for Approve {
///     fn executor_type(&self) -> &str {
///         "approve"
///     }
///
///     async fn execute(&self, _input: &NodeInput) -> NodeOutcome {
///         NodeOutcome::Completed(json!({"approved": true}))
///     }
/// }
/// ```
#[async_trait]
pub trait NodeExecutor: Send + Sync + 'static {
    /// Type name referenced by node definitions
    fn executor_type(&self) -> &str;

    /// Declared output fields with their defaults
    fn output_shape(&self) -> Value {
        Value::Object(Default::default())
    }

    async fn execute(&self, input: &NodeInput) -> NodeOutcome;
}

/// Merge an asynchronous job result onto the executor's declared shape
///
/// Declared fields keep their default unless the result carries them. With
/// no declared fields the result is taken as is.
pub fn shape_output(shape: &Value, result: &Value) -> Value {
    match shape {
        Value::Object(declared) if !declared.is_empty() => {
            let mut out = declared.clone();
            if let Value::Object(result) = result {
                for (key, value) in out.iter_mut() {
                    if let Some(v) = result.get(key) {
                        *value = v.clone();
                    }
                }
            }
            Value::Object(out)
        }
        _ => result.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shape_output_overwrites_only_present_fields() {
        let shape = json!({"status": "unknown", "score": 0});
        let result = json!({"score": 42, "extra": true});

        assert_eq!(
            shape_output(&shape, &result),
            json!({"status": "unknown", "score": 42})
        );
    }

    #[test]
    fn test_shape_output_without_declared_fields() {
        let result = json!({"anything": 1});
        assert_eq!(shape_output(&json!({}), &result), result);
    }

    #[test]
    fn test_timeout_failure_is_retryable() {
        let failure = NodeFailure::timeout(std::time::Duration::from_millis(10));
        assert!(failure.retryable);
        assert_eq!(failure.kind.as_deref(), Some(TIMEOUT_KIND));
    }
}
