//! Context: the execution token of the engine

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Payload;

/// Identity of the graph a context belongs to (graph id + version)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub graph_id: Uuid,
    pub version: u32,
}

impl StreamId {
    pub fn new(graph_id: Uuid, version: u32) -> Self {
        Self { graph_id, version }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.graph_id, self.version)
    }
}

/// Context status
///
/// ```text
/// NEW ──► PENDING ──► READY ──► ARCHIVED
///            ▲  │       │  └──► ERROR
///            │  │       └─────► RETRYABLE ──► READY (retry claim)
///            │  └─────────────► RETRYABLE (deferred admission)
///            └──────────────── READY (asynchronous job sent)
///
/// any non-terminal state ──► TERMINATE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// Created at a node, not yet consumed
    New,

    /// Accepted by the node and parked (dispatch, async job or caller input)
    Pending,

    /// Handed to the node executor
    Ready,

    /// Node executed successfully
    Archived,

    /// Node failed permanently
    Error,

    /// Node failed and the batch waits for the retry sweep
    Retryable,

    /// Explicitly terminated
    Terminate,
}

impl ContextStatus {
    /// ARCHIVED, ERROR and TERMINATE never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived | Self::Error | Self::Terminate)
    }

    /// Statuses that keep a trace RUNNING
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::New | Self::Pending | Self::Ready | Self::Retryable
        )
    }

    /// Contexts that count as "done" for the completion percentage
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Archived | Self::Error)
    }

    /// Check whether `next` is reachable from `self` in one step
    pub fn can_transition_to(&self, next: ContextStatus) -> bool {
        use ContextStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Terminate {
            return true;
        }

        matches!(
            (self, next),
            (New, Pending)
                | (Pending, Ready)
                | (Pending, Retryable)
                | (Pending, Archived)
                | (Pending, Error)
                | (Ready, Archived)
                | (Ready, Error)
                | (Ready, Retryable)
                | (Ready, Pending)
                | (Retryable, Ready)
                | (Retryable, Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Archived => "archived",
            Self::Error => "error",
            Self::Retryable => "retryable",
            Self::Terminate => "terminate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "new" => Self::New,
            "pending" => Self::Pending,
            "ready" => Self::Ready,
            "archived" => Self::Archived,
            "error" => Self::Error,
            "retryable" => Self::Retryable,
            "terminate" => Self::Terminate,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("context {context_id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub context_id: Uuid,
    pub from: ContextStatus,
    pub to: ContextStatus,
}

/// Structured error recorded on a failed context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub node_id: String,
    pub message: String,
    pub kind: Option<String>,
    pub details: Option<serde_json::Value>,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// One unit of data at one position in a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: Uuid,
    pub stream: StreamId,
    pub trans_id: Uuid,

    /// Node the context currently sits at
    pub position: String,

    /// Event that delivered the context to `position` (none at the entry node)
    pub inbound_event: Option<String>,

    pub status: ContextStatus,

    /// A context can belong to several traces once branches merge
    pub trace_ids: BTreeSet<Uuid>,

    /// Set only while RETRYABLE
    pub batch_key: Option<String>,

    pub payload: Payload,
    pub error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    pub fn new(
        stream: StreamId,
        trans_id: Uuid,
        trace_ids: BTreeSet<Uuid>,
        position: impl Into<String>,
        inbound_event: Option<String>,
        payload: Payload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            stream,
            trans_id,
            position: position.into(),
            inbound_event,
            status: ContextStatus::New,
            trace_ids,
            batch_key: None,
            payload,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, keeping the batch key invariant
    pub fn transition(&mut self, next: ContextStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                context_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next != ContextStatus::Retryable {
            self.batch_key = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Park the context in a retry batch
    pub fn mark_retryable(&mut self, batch_key: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(ContextStatus::Retryable)?;
        self.batch_key = Some(batch_key.into());
        Ok(())
    }

    /// Move a RETRYABLE context to another retry batch
    pub fn rebatch(&mut self, batch_key: impl Into<String>) -> Result<(), InvalidTransition> {
        if self.status != ContextStatus::Retryable {
            return Err(InvalidTransition {
                context_id: self.id,
                from: self.status,
                to: ContextStatus::Retryable,
            });
        }
        self.batch_key = Some(batch_key.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a permanent failure
    pub fn mark_error(&mut self, detail: ErrorDetail) -> Result<(), InvalidTransition> {
        self.transition(ContextStatus::Error)?;
        self.error = Some(detail);
        Ok(())
    }

    pub fn belongs_to(&self, trace_id: Uuid) -> bool {
        self.trace_ids.contains(&trace_id)
    }
}
