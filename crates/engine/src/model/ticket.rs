//! Retry tickets and trans completion markers

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TraceStatus;

/// What a retry ticket covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketEntityType {
    /// All contexts sharing one batch key
    ContextBatch,
}

impl TicketEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextBatch => "context_batch",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "context_batch" => Some(Self::ContextBatch),
            _ => None,
        }
    }
}

/// Bookkeeping for one retry batch
///
/// Exists while at least one context with `entity_id` as batch key is
/// RETRYABLE, and while a claimed batch is back in flight at its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTicket {
    /// The batch key
    pub entity_id: String,
    pub entity_type: TicketEntityType,
    pub graph_id: Uuid,
    pub node_id: String,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: DateTime<Utc>,
    pub retry_count: u32,

    /// Every context ever parked under this batch key
    pub context_ids: BTreeSet<Uuid>,

    pub created_at: DateTime<Utc>,
}

impl RetryTicket {
    pub fn for_batch(
        batch_key: impl Into<String>,
        graph_id: Uuid,
        node_id: impl Into<String>,
        context_ids: impl IntoIterator<Item = Uuid>,
        next_retry_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: batch_key.into(),
            entity_type: TicketEntityType::ContextBatch,
            graph_id,
            node_id: node_id.into(),
            last_retry_at: None,
            next_retry_at,
            retry_count: 0,
            context_ids: context_ids.into_iter().collect(),
            created_at: Utc::now(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at <= now
    }
}

/// Persisted marker that a trans has been reported complete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransCompletion {
    pub trans_id: Uuid,
    pub status: TraceStatus,
    pub completed_at: DateTime<Utc>,
}
