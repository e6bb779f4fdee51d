//! Completion percentage and status rollup
//!
//! The layered algorithm walks the graph breadth-first. Every node weighs
//! `1/N`; a layer contributes its weight times the share of finished contexts
//! observed at its nodes, damped by the product of the shares of all earlier
//! layers.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{GraphDefinition, NodeDefinition};
use crate::model::{Context, ContextStatus, TraceStatus};

/// Which completion/status algorithm to apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletenessAlgorithm {
    /// Layered percentage; PARTIAL_ERROR when an END node was reached
    #[default]
    Layered,

    /// Share of fully finished nodes; errors always roll up to ERROR
    Flat,
}

/// Progress report of one trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completeness {
    pub trace_id: Uuid,
    pub status: TraceStatus,

    /// 0 to 100
    pub percentage: f64,

    /// Nodes holding an ERROR context, sorted
    pub error_nodes: Vec<String>,
}

impl CompletenessAlgorithm {
    /// Roll the contexts of one trace up to a trace status
    pub fn rollup(&self, graph: &GraphDefinition, contexts: &[Context]) -> TraceStatus {
        let statuses = || contexts.iter().map(|c| c.status);

        if contexts.is_empty() {
            return TraceStatus::Running;
        }
        if statuses().any(|s| s == ContextStatus::Terminate) {
            return TraceStatus::Terminate;
        }
        if statuses().any(|s| s.is_running()) {
            return TraceStatus::Running;
        }
        if statuses().all(|s| s == ContextStatus::Archived) {
            return TraceStatus::Archived;
        }

        let reached_end = contexts
            .iter()
            .any(|c| c.status == ContextStatus::Archived && graph.is_end(&c.position));
        match self {
            Self::Layered if reached_end => TraceStatus::PartialError,
            _ => TraceStatus::Error,
        }
    }

    /// Completion percentage of one trace, 0 to 100
    pub fn percentage(&self, graph: &GraphDefinition, contexts: &[Context]) -> f64 {
        let total_nodes = graph.nodes.len();
        if total_nodes == 0 {
            return 0.0;
        }

        let percentage = match self {
            Self::Layered => {
                let weight = 1.0 / total_nodes as f64;
                let mut carried = 1.0;
                let mut total = 0.0;
                for layer in graph.layers() {
                    let share = finished_share(graph, &layer, contexts);
                    total += weight * layer.len() as f64 * share * carried;
                    carried *= share;
                }
                total
            }
            Self::Flat => {
                let done = graph
                    .nodes
                    .iter()
                    .filter(|node| finished_share(graph, &[*node], contexts) >= 1.0)
                    .count();
                done as f64 / total_nodes as f64
            }
        };

        (percentage * 100.0).clamp(0.0, 100.0)
    }

    /// Full report for one trace
    ///
    /// `stored` is the persisted trace status; an ARCHIVED trace reports
    /// 100 without walking the graph.
    pub fn evaluate(
        &self,
        trace_id: Uuid,
        stored: TraceStatus,
        graph: &GraphDefinition,
        contexts: &[Context],
    ) -> Completeness {
        let status = if stored.is_terminal() {
            stored
        } else {
            self.rollup(graph, contexts)
        };
        let percentage = if status == TraceStatus::Archived {
            100.0
        } else {
            self.percentage(graph, contexts)
        };

        Completeness {
            trace_id,
            status,
            percentage,
            error_nodes: error_nodes(contexts),
        }
    }
}

/// Roll trace statuses up to a trans status
///
/// Same precedence as for contexts; a trace that reached an END node
/// (ARCHIVED or PARTIAL_ERROR) next to a failed one makes PARTIAL_ERROR.
pub fn rollup_traces(statuses: &[TraceStatus]) -> TraceStatus {
    use TraceStatus::*;

    if statuses.is_empty() {
        return Running;
    }
    if statuses.contains(&Terminate) {
        return Terminate;
    }
    if statuses.contains(&Running) {
        return Running;
    }
    if statuses.iter().all(|s| *s == Archived) {
        return Archived;
    }
    let reached_end = statuses.iter().any(|s| matches!(s, Archived | PartialError));
    if reached_end {
        PartialError
    } else {
        Error
    }
}

fn error_nodes(contexts: &[Context]) -> Vec<String> {
    contexts
        .iter()
        .filter(|c| c.status == ContextStatus::Error)
        .map(|c| c.position.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Finished contexts / observed contexts at `nodes`; 0 when none observed
fn finished_share(graph: &GraphDefinition, nodes: &[&NodeDefinition], contexts: &[Context]) -> f64 {
    let node_ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let inbound: HashSet<&str> = nodes
        .iter()
        .flat_map(|n| graph.inbound_events(&n.id))
        .map(|e| e.id.as_str())
        .collect();

    let mut observed = 0usize;
    let mut finished = 0usize;
    for ctx in contexts {
        let at_node = node_ids.contains(ctx.position.as_str())
            || ctx
                .inbound_event
                .as_deref()
                .is_some_and(|e| inbound.contains(e));
        if at_node {
            observed += 1;
            if ctx.status.is_finished() {
                finished += 1;
            }
        }
    }

    if observed == 0 {
        0.0
    } else {
        finished as f64 / observed as f64
    }
}
