//! Run lifecycle: parking, resuming, failing, terminating and reporting

mod common;

use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use common::{all_executors, chain, Cluster};
use flowmesh_engine::graph::{GraphDefinition, GraphRef, GraphRepository, NodeDefinition, NodeType};
use flowmesh_engine::model::{Context, ContextStatus, Payload, Trace, TraceStatus};
use flowmesh_engine::node::{NodeFailure, EXECUTOR_NOT_FOUND_KIND, PANIC_KIND};
use flowmesh_engine::persistence::{FlowStore, TraceStore};
use flowmesh_engine::{
    CompletenessAlgorithm, EngineError, Orchestrator, StatusCalculator, TerminateScope,
};

fn pending_ids(cluster: &Cluster) -> Vec<Uuid> {
    cluster
        .store
        .contexts_in(ContextStatus::Pending)
        .into_iter()
        .map(|c| c.id)
        .collect()
}

fn two_holds() -> GraphDefinition {
    GraphDefinition::new("holds", 1, "start")
        .with_node(NodeDefinition::start("start"))
        .with_node(NodeDefinition::task("first", "hold"))
        .with_node(NodeDefinition::task("second", "hold"))
        .with_node(NodeDefinition::end("done"))
        .with_event("e1", "start", "first")
        .with_event("e2", "first", "second")
        .with_event("e3", "second", "done")
}

async fn percentage(orchestrator: &Orchestrator, trace_id: Uuid, algorithm: CompletenessAlgorithm) -> f64 {
    orchestrator
        .get_completeness_with(&[trace_id], algorithm)
        .await
        .unwrap()[0]
        .percentage
}

#[test_log::test(tokio::test)]
async fn test_percentage_never_decreases_along_a_chain() {
    let cluster = Cluster::new();
    cluster.register(two_holds());
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    let run = assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("holds", 1), json!({}), None)
            .await
    );
    orchestrator.quiesce().await;

    let mut layered = vec![percentage(&orchestrator, run.trace_id, CompletenessAlgorithm::Layered).await];
    let mut flat = vec![percentage(&orchestrator, run.trace_id, CompletenessAlgorithm::Flat).await];
    for _ in 0..2 {
        let waiting = pending_ids(&cluster);
        assert_eq!(waiting.len(), 1);
        assert_eq!(assert_ok!(orchestrator.resume_async_job(&waiting, json!({})).await), 1);
        orchestrator.quiesce().await;
        layered.push(percentage(&orchestrator, run.trace_id, CompletenessAlgorithm::Layered).await);
        flat.push(percentage(&orchestrator, run.trace_id, CompletenessAlgorithm::Flat).await);
    }

    assert_eq!(layered, vec![25.0, 50.0, 100.0]);
    assert!(flat.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(flat.last(), Some(&100.0));
}

#[test_log::test(tokio::test)]
async fn test_terminate_is_idempotent() {
    let cluster = Cluster::new();
    cluster.register(chain("held", NodeDefinition::task("wait", "hold")));
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    let run = assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("held", 1), json!({}), None)
            .await
    );
    orchestrator.quiesce().await;
    let waiting = pending_ids(&cluster);

    let first = assert_ok!(
        orchestrator
            .terminate(run.trace_id, TerminateScope::WithRelated, Some("ops"))
            .await
    );
    assert_eq!(first.traces, 1);
    assert_eq!(first.contexts, 1);

    let second = assert_ok!(
        orchestrator
            .terminate(run.trace_id, TerminateScope::WithRelated, Some("ops"))
            .await
    );
    assert_eq!(second.traces, 0);
    assert_eq!(second.contexts, 0);

    // a late job result does not revive the context
    assert_eq!(assert_ok!(orchestrator.resume_async_job(&waiting, json!({})).await), 0);

    let report = assert_ok!(orchestrator.get_completeness(&[run.trace_id]).await);
    assert_eq!(report[0].status, TraceStatus::Terminate);
    assert_eq!(cluster.store.contexts_in(ContextStatus::Terminate).len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_resume_merges_caller_data() {
    let cluster = Cluster::new();
    let graph_id = cluster.register(chain("review", NodeDefinition::task("check", "approval")));
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    let run = assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("review", 1), json!({"amount": 40}), None)
            .await
    );
    orchestrator.quiesce().await;
    let waiting = pending_ids(&cluster);
    assert_eq!(waiting.len(), 1);

    let patches = BTreeMap::from([(waiting[0], json!({"approved": true}))]);
    let resumed = assert_ok!(orchestrator.resume(graph_id, patches.clone(), Some("ops")).await);
    assert_eq!(resumed, 1);
    orchestrator.quiesce().await;

    // already moved on
    assert_eq!(assert_ok!(orchestrator.resume(graph_id, patches, None).await), 0);

    let done = cluster
        .store
        .contexts_in(ContextStatus::Archived)
        .into_iter()
        .find(|c| c.position == "done")
        .unwrap();
    assert_eq!(done.payload.business, json!({"amount": 40, "approved": true}));

    let report = assert_ok!(orchestrator.get_completeness(&[run.trace_id]).await);
    assert_eq!(report[0].status, TraceStatus::Archived);
}

#[test_log::test(tokio::test)]
async fn test_resume_refreshes_output_scope() {
    let cluster = Cluster::new();
    let graph_id = cluster.register(
        chain("scoped", NodeDefinition::task("check", "approval")).with_output_scoping(true),
    );
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("scoped", 1), json!({"amount": 40}), None)
            .await
    );
    orchestrator.quiesce().await;
    let waiting = cluster.store.contexts_in(ContextStatus::Pending);
    assert_eq!(waiting[0].payload.scope["start"], json!({"amount": 40}));

    let patches = BTreeMap::from([(waiting[0].id, json!({"amount": 50, "approved": true}))]);
    assert_eq!(assert_ok!(orchestrator.resume(graph_id, patches, None).await), 1);
    orchestrator.quiesce().await;

    let done = cluster
        .store
        .contexts_in(ContextStatus::Archived)
        .into_iter()
        .find(|c| c.position == "done")
        .unwrap();
    let expected = json!({"amount": 50, "approved": true});
    assert_eq!(done.payload.scope["start"], expected);
    assert_eq!(done.payload.scope["check"], expected);
}

#[test_log::test(tokio::test)]
async fn test_async_job_result_is_shaped() {
    let cluster = Cluster::new();
    cluster.register(chain("shaped", NodeDefinition::task("check", "approval")));
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("shaped", 1), json!({"amount": 7}), None)
            .await
    );
    orchestrator.quiesce().await;

    let waiting = pending_ids(&cluster);
    let advanced = assert_ok!(
        orchestrator
            .resume_async_job(&waiting, json!({"approved": true, "undeclared": 1}))
            .await
    );
    assert_eq!(advanced, 1);
    orchestrator.quiesce().await;

    let check = cluster
        .store
        .contexts_in(ContextStatus::Archived)
        .into_iter()
        .find(|c| c.position == "check")
        .unwrap();
    assert_eq!(check.payload.business, json!({"amount": 7, "approved": true}));
}

#[test_log::test(tokio::test)]
async fn test_failed_async_job_is_reported() {
    let cluster = Cluster::new();
    cluster.register(chain("jobs", NodeDefinition::task("job", "hold")));
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    let run = assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("jobs", 1), json!({}), None)
            .await
    );
    orchestrator.quiesce().await;

    let failure = NodeFailure::non_retryable("job crashed").with_kind("JOB_FAILED");
    let failed = assert_ok!(orchestrator.fail_async_job(&pending_ids(&cluster), failure).await);
    assert_eq!(failed, 1);

    let errors = assert_ok!(orchestrator.get_error_info(run.trace_id).await);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node_id, "job");
    assert_eq!(errors[0].error.kind.as_deref(), Some("JOB_FAILED"));

    let report = assert_ok!(orchestrator.get_completeness(&[run.trace_id]).await);
    assert_eq!(report[0].status, TraceStatus::Error);
}

#[test_log::test(tokio::test)]
async fn test_unregistered_executor_fails_without_retry() {
    let cluster = Cluster::new();
    cluster.register(chain("unknown", NodeDefinition::task("mystery", "not-registered")));
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    let run = assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("unknown", 1), json!({}), None)
            .await
    );
    orchestrator.quiesce().await;

    assert_eq!(cluster.store.ticket_count(), 0);
    let errors = assert_ok!(orchestrator.get_error_info(run.trace_id).await);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error.kind.as_deref(), Some(EXECUTOR_NOT_FOUND_KIND));
}

#[test_log::test(tokio::test)]
async fn test_panicking_executor_fails_the_context() {
    let cluster = Cluster::new();
    cluster.register(chain("fragile", NodeDefinition::task("work", "crash")));
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    let run = assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("fragile", 1), json!({}), None)
            .await
    );
    orchestrator.quiesce().await;

    assert!(cluster.store.contexts_in(ContextStatus::Ready).is_empty());
    assert_eq!(cluster.store.ticket_count(), 0);
    let errors = assert_ok!(orchestrator.get_error_info(run.trace_id).await);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node_id, "work");
    assert_eq!(errors[0].error.kind.as_deref(), Some(PANIC_KIND));
    assert!(errors[0].error.message.contains("index out of bounds"));

    let status = assert_ok!(StatusCalculator::new(orchestrator.clone()).tick().await);
    assert_eq!(status.finished, 1);
    let stored = assert_ok!(cluster.store.get_trace(run.trace_id).await).unwrap();
    assert_eq!(stored.status, TraceStatus::Error);
}

#[test_log::test(tokio::test)]
async fn test_inactive_graph_rejects_new_runs() {
    let cluster = Cluster::new();
    cluster.register(chain("retired", NodeDefinition::new("relay", "Relay", NodeType::Task)).inactive());
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    let err = assert_err!(
        orchestrator
            .start_run(&GraphRef::meta("retired", 1), json!({}), None)
            .await
    );
    assert!(matches!(err, EngineError::GraphInactive(_)));

    let err = assert_err!(
        orchestrator
            .start_run(&GraphRef::meta("missing", 1), json!({}), None)
            .await
    );
    assert!(matches!(err, EngineError::GraphNotFound(_)));
}

#[test_log::test(tokio::test)]
async fn test_offered_inputs_each_start_a_run() {
    let cluster = Cluster::new();
    cluster.register(chain("feed", NodeDefinition::new("relay", "Relay", NodeType::Task)));
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    let publisher = futures::stream::iter(vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    let task = assert_ok!(
        orchestrator
            .offer_node(&GraphRef::meta("feed", 1), "start", publisher, Some("feeder".into()))
            .await
    );
    assert_eq!(task.await.unwrap(), 3);
    orchestrator.quiesce().await;

    assert_eq!(cluster.store.context_count(), 9);
    assert_eq!(cluster.store.contexts_in(ContextStatus::Archived).len(), 9);
}

#[test_log::test(tokio::test)]
async fn test_deleted_run_is_gone() {
    let cluster = Cluster::new();
    cluster.register(chain("gone", NodeDefinition::new("relay", "Relay", NodeType::Task)));
    let orchestrator = cluster.orchestrator("worker-a", all_executors());

    let run = assert_ok!(
        orchestrator
            .start_run(&GraphRef::meta("gone", 1), json!({}), None)
            .await
    );
    orchestrator.quiesce().await;

    assert!(assert_ok!(orchestrator.delete_run(run.trace_id).await) > 0);
    assert_eq!(cluster.store.context_count(), 0);
    let err = assert_err!(orchestrator.get_completeness(&[run.trace_id]).await);
    assert!(matches!(err, EngineError::TraceNotFound(id) if id == run.trace_id));
}

#[test_log::test(tokio::test)]
async fn test_adopted_trace_recovers_stranded_contexts() {
    let cluster = Cluster::new();
    cluster.register(chain("stranded", NodeDefinition::new("relay", "Relay", NodeType::Task)));
    let graph = cluster
        .graphs
        .resolve(&GraphRef::meta("stranded", 1))
        .await
        .unwrap();

    // a process created the run and died before dispatching it
    let mut trace = Trace::new(Uuid::now_v7(), graph.stream_id(), None);
    let context = Context::new(
        graph.stream_id(),
        trace.trans_id,
        BTreeSet::from([trace.id]),
        "start",
        None,
        Payload::new(json!({})),
    );
    trace.context_ids.insert(context.id);
    assert_ok!(cluster.store.create_run(&[trace.clone()], &[context]).await);

    let survivor = cluster.orchestrator("worker-b", all_executors());
    let calculator = StatusCalculator::new(survivor.clone());
    let report = assert_ok!(calculator.tick().await);
    assert_eq!(report.adopted, 1);

    survivor.quiesce().await;
    assert_ok!(calculator.tick().await);

    let stored = assert_ok!(cluster.store.get_trace(trace.id).await).unwrap();
    assert_eq!(stored.status, TraceStatus::Archived);
    assert_eq!(cluster.store.contexts_in(ContextStatus::Archived).len(), 3);
}
