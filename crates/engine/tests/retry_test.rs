//! Retry batches across competing processes

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_test::assert_ok;

use common::{chain, test_config, Cluster, Flaky, Gauge, Misbehave};
use flowmesh_engine::graph::{GraphDefinition, GraphRef, NodeDefinition};
use flowmesh_engine::model::{ContextStatus, TraceStatus};
use flowmesh_engine::node::ExecutorRegistry;
use flowmesh_engine::persistence::{BatchClaim, FlowStore, TraceStore};
use flowmesh_engine::{
    LeaseOwnershipService, Orchestrator, OwnershipService, RetryPolicy, StatusCalculator,
    TerminateScope,
};

/// Every RETRYABLE context is covered by the ticket of its batch key
fn assert_tickets_cover_retryable(cluster: &Cluster) {
    let tickets = cluster.store.tickets();
    for ctx in cluster.store.contexts_in(ContextStatus::Retryable) {
        let key = ctx.batch_key.clone().unwrap();
        let ticket = tickets.iter().find(|t| t.entity_id == key);
        assert!(ticket.is_some(), "no ticket for batch {key}");
        assert!(ticket.unwrap().context_ids.contains(&ctx.id));
    }
}

#[test_log::test(tokio::test)]
async fn test_racing_processes_resubmit_batch_once() {
    let cluster = Cluster::new();
    cluster.register(chain("race", NodeDefinition::task("work", "flaky")));
    let (flaky, calls) = Flaky::new(1, Misbehave::Fail);
    let executors = ExecutorRegistry::new().with(flaky);

    let config = test_config("owner");
    let shared: Arc<dyn OwnershipService> = Arc::new(LeaseOwnershipService::new(
        cluster.leases.clone(),
        "owner",
        config.ownership_ttl,
        config.ownership_protect,
    ));
    let racers: Vec<Orchestrator> = (0..6)
        .map(|i| {
            Orchestrator::builder(
                cluster.store.clone(),
                cluster.graphs.clone(),
                cluster.leases.clone(),
            )
            .config(test_config(&format!("racer-{i}")))
            .executors(executors.clone())
            .ownership(shared.clone())
            .build()
            .unwrap()
        })
        .collect();

    assert_ok!(
        racers[0]
            .start_run(&GraphRef::meta("race", 1), json!({}), None)
            .await
    );
    racers[0].quiesce().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.store.ticket_count(), 1);

    let sweeps = futures::future::join_all(racers.iter().map(|r| r.sweep_retries())).await;
    let claimed: usize = sweeps.into_iter().map(|s| s.unwrap().claimed).sum();
    assert_eq!(claimed, 1);

    for racer in &racers {
        racer.quiesce().await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cluster.store.ticket_count(), 0);
    assert_eq!(cluster.store.contexts_in(ContextStatus::Archived).len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_exhausted_batch_ends_in_error() {
    let cluster = Cluster::new();
    cluster.register(chain("doomed", NodeDefinition::task("work", "flaky")));
    let (flaky, calls) = Flaky::new(u32::MAX, Misbehave::Fail);
    let orchestrator = Orchestrator::builder(
        cluster.store.clone(),
        cluster.graphs.clone(),
        cluster.leases.clone(),
    )
    .config(test_config("worker-a").with_retry_policy(RetryPolicy::fixed(Duration::ZERO, 2)))
    .executor(flaky)
    .build()
    .unwrap();

    let run = assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("doomed", 1), json!({}), None)
            .await
    );
    orchestrator.quiesce().await;
    assert_tickets_cover_retryable(&cluster);

    let sweep = assert_ok!(orchestrator.sweep_retries().await);
    assert_eq!(sweep.claimed, 1);
    orchestrator.quiesce().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cluster.store.ticket_count(), 0);
    let failed = cluster.store.contexts_in(ContextStatus::Error);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload.engine.attempt, 2);
    assert!(failed[0].batch_key.is_none());

    let report = assert_ok!(orchestrator.get_completeness(&[run.trace_id]).await);
    assert_eq!(report[0].status, TraceStatus::Error);
}

#[test_log::test(tokio::test)]
async fn test_saturated_node_defers_fresh_contexts() {
    let cluster = Cluster::new();
    let graph_id = cluster.register(chain(
        "busy",
        NodeDefinition::task("work", "flaky").with_max_in_flight(1),
    ));
    let (flaky, calls) = Flaky::new(0, Misbehave::Fail);
    let orchestrator = cluster.orchestrator("worker-a", ExecutorRegistry::new().with(flaky));

    let handle = assert_ok!(orchestrator.node_handle(graph_id, "work").await);
    let occupied = handle.submit();

    assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("busy", 1), json!({}), None)
            .await
    );
    orchestrator.quiesce().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(cluster.store.contexts_in(ContextStatus::Retryable).len(), 1);
    assert_tickets_cover_retryable(&cluster);

    drop(occupied);
    let sweep = assert_ok!(orchestrator.sweep_retries().await);
    assert_eq!(sweep.claimed, 1);
    orchestrator.quiesce().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.store.ticket_count(), 0);
    assert_eq!(cluster.store.contexts_in(ContextStatus::Archived).len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_terminated_batch_leaves_no_ticket_behind() {
    let cluster = Cluster::new();
    cluster.register(chain("cancel", NodeDefinition::task("work", "flaky")));
    let (flaky, calls) = Flaky::new(1, Misbehave::Fail);
    let orchestrator = cluster.orchestrator("worker-a", ExecutorRegistry::new().with(flaky));

    let run = assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("cancel", 1), json!({}), None)
            .await
    );
    orchestrator.quiesce().await;
    assert_eq!(cluster.store.ticket_count(), 1);

    let report = assert_ok!(
        orchestrator
            .terminate(run.trace_id, TerminateScope::Trace, Some("ops"))
            .await
    );
    assert_eq!(report.traces, 1);
    assert_eq!(report.contexts, 1);

    let sweep = assert_ok!(orchestrator.sweep_retries().await);
    assert_eq!(sweep.claimed, 0);
    assert_eq!(sweep.stale, 1);
    assert_eq!(cluster.store.ticket_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_failures_of_one_batch_share_a_ticket() {
    let cluster = Cluster::new();
    // entry node, so the whole group reaches it as one batch
    cluster.register(
        GraphDefinition::new("bulk", 1, "work")
            .with_node(NodeDefinition::task("work", "flaky"))
            .with_node(NodeDefinition::end("done"))
            .with_event("e1", "work", "done"),
    );
    let (flaky, _) = Flaky::new(1, Misbehave::Fail);
    let orchestrator = cluster.orchestrator("worker-a", ExecutorRegistry::new().with(flaky));

    assert_ok!(
        orchestrator
            .start_group(
                &GraphRef::meta("bulk", 1),
                vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
                None,
            )
            .await
    );
    orchestrator.quiesce().await;

    let parked = cluster.store.contexts_in(ContextStatus::Retryable);
    assert_eq!(parked.len(), 3);
    let keys: BTreeSet<_> = parked.iter().filter_map(|c| c.batch_key.clone()).collect();
    assert_eq!(keys.len(), 1);
    assert_eq!(cluster.store.ticket_count(), 1);
    assert_tickets_cover_retryable(&cluster);

    let sweep = assert_ok!(orchestrator.sweep_retries().await);
    assert_eq!(sweep.claimed, 1);
    orchestrator.quiesce().await;
    assert_eq!(cluster.store.contexts_in(ContextStatus::Archived).len(), 6);
    assert_eq!(cluster.store.ticket_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_large_batch_never_exceeds_node_capacity() {
    let cluster = Cluster::new();
    cluster.register(
        GraphDefinition::new("fanin", 1, "work")
            .with_node(NodeDefinition::task("work", "gauge").with_max_in_flight(2))
            .with_node(NodeDefinition::end("done"))
            .with_event("e1", "work", "done"),
    );
    let (gauge, peak) = Gauge::new();
    let orchestrator = cluster.orchestrator("worker-a", ExecutorRegistry::new().with(gauge));

    let inputs = (0..10).map(|n| json!({"n": n})).collect();
    assert_ok!(
        orchestrator
            .start_group(&GraphRef::meta("fanin", 1), inputs, None)
            .await
    );
    orchestrator.quiesce().await;
    assert_eq!(cluster.store.contexts_in(ContextStatus::Retryable).len(), 8);
    assert_tickets_cover_retryable(&cluster);

    for _ in 0..10 {
        if cluster.store.ticket_count() == 0 {
            break;
        }
        assert_ok!(orchestrator.sweep_retries().await);
        assert_tickets_cover_retryable(&cluster);
        orchestrator.quiesce().await;
    }

    assert_eq!(cluster.store.ticket_count(), 0);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(cluster.store.contexts_in(ContextStatus::Archived).len(), 20);
}

#[test_log::test(tokio::test)]
async fn test_abandoned_retry_claim_is_recovered() {
    let cluster = Cluster::new();
    cluster.register(chain("orphan", NodeDefinition::task("work", "flaky")));
    let (flaky, calls) = Flaky::new(1, Misbehave::Fail);
    let executors = ExecutorRegistry::new().with(flaky);
    let crashed = cluster.orchestrator("worker-a", executors.clone());

    let run = assert_ok!(
        crashed
            .start_run(&GraphRef::meta("orphan", 1), json!({}), None)
            .await
    );
    crashed.quiesce().await;
    let ticket = cluster.store.tickets().remove(0);

    // the batch is claimed, then its process dies before executing it
    let claim = BatchClaim {
        batch_key: ticket.entity_id.clone(),
        expected_retry_count: ticket.retry_count,
        context_ids: ticket.context_ids.iter().copied().collect(),
        retried_at: Utc::now(),
        next_retry_at: Utc::now(),
    };
    assert_eq!(assert_ok!(cluster.store.claim_retry_batch(&claim).await), 1);
    assert_eq!(cluster.store.contexts_in(ContextStatus::Ready).len(), 1);
    assert_ok!(crashed.ownership().release(run.trace_id).await);

    let survivor = cluster.orchestrator("worker-b", executors);
    let calculator = StatusCalculator::new(survivor.clone());
    let report = assert_ok!(calculator.tick().await);
    assert_eq!(report.adopted, 1);
    survivor.quiesce().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cluster.store.contexts_in(ContextStatus::Ready).is_empty());

    let sweep = assert_ok!(survivor.sweep_retries().await);
    assert_eq!(sweep.claimed, 0);
    assert_eq!(sweep.stale, 1);
    assert_eq!(cluster.store.ticket_count(), 0);

    assert_ok!(calculator.tick().await);
    let stored = assert_ok!(cluster.store.get_trace(run.trace_id).await).unwrap();
    assert_eq!(stored.status, TraceStatus::Archived);
}
