//! Trace: one run of a graph

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StreamId;

/// Status of a trace (and, derived, of a trans)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Archived,
    Error,
    PartialError,
    Terminate,
}

impl TraceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Archived => "archived",
            Self::Error => "error",
            Self::PartialError => "partial_error",
            Self::Terminate => "terminate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "running" => Self::Running,
            "archived" => Self::Archived,
            "error" => Self::Error,
            "partial_error" => Self::PartialError,
            "terminate" => Self::Terminate,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: Uuid,
    pub trans_id: Uuid,
    pub stream: StreamId,
    pub status: TraceStatus,

    /// Every context ever associated with the run
    pub context_ids: BTreeSet<Uuid>,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Operator that started the run
    pub started_by: Option<String>,
}

impl Trace {
    pub fn new(trans_id: Uuid, stream: StreamId, started_by: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            trans_id,
            stream,
            status: TraceStatus::Running,
            context_ids: BTreeSet::new(),
            started_at: Utc::now(),
            ended_at: None,
            started_by,
        }
    }
}
