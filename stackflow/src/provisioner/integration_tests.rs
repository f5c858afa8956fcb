//! End-to-end scenarios across the graph, provisioner, controller and
//! deployment.

use crate::config::{ControllerConfig, DeploymentConfig};
use crate::core::{InputRef, Stack, StackOutputs};
use crate::deployment::Deployment;
use crate::errors::StackFailure;
use crate::events::{CollectingEventSink, RESOURCE_TRANSITION, STACK_COMPLETED};
use crate::external::{
    DocumentPayload, ExternalResourceAction, ExternalResourceController, Operation, ResourceState,
    PHYSICAL_ID_OUTPUT,
};
use crate::graph::StackGraph;
use crate::provisioner::Provisioner;
use crate::registry::{InMemoryStateStore, RunStatus, StateStore};
use crate::testing::{FailingAction, IdempotentWorker, RecordingAction, StaticAction};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn provisioner() -> Provisioner {
    Provisioner::new(Arc::new(DeploymentConfig::new("integration")))
}

fn single(key: &str, value: serde_json::Value) -> StackOutputs {
    StackOutputs::from([(key.to_string(), value)])
}

#[tokio::test]
async fn test_linear_chain_stops_at_failed_stack() {
    let c = Arc::new(RecordingAction::new(StackOutputs::new()));
    let graph = StackGraph::build(vec![
        Stack::new("a", Arc::new(StaticAction::new([("out".to_string(), json!("a-1"))]))).with_output("out"),
        Stack::new("b", Arc::new(FailingAction::new("bucket name taken")))
            .with_output("out")
            .with_input(InputRef::new("a", "out")),
        Stack::new("c", c.clone()).with_input(InputRef::new("b", "out")),
    ])
    .unwrap();
    let plan = graph.resolve();
    assert_eq!(plan.as_ids(), vec![vec!["a"], vec!["b"], vec!["c"]]);

    let failure = provisioner().run(&graph, &plan, 1).await.unwrap_err();

    assert_eq!(failure.stack, "b");
    assert!(matches!(failure.error, StackFailure::Provision(_)));
    assert_eq!(failure.completed, vec!["a".to_string()]);
    assert_eq!(failure.committed.stack_ids().collect::<Vec<_>>(), vec!["a"]);
    assert!(c.applied().is_empty());
}

#[tokio::test]
async fn test_diamond_runs_middle_layer_together() {
    let sink = Arc::new(CollectingEventSink::new());
    let b = Arc::new(
        RecordingAction::new(single("left", json!("L"))).with_delay(Duration::from_millis(100)),
    );
    let c = Arc::new(
        RecordingAction::new(single("right", json!("R"))).with_delay(Duration::from_millis(100)),
    );
    let d = Arc::new(RecordingAction::new(StackOutputs::new()));

    let graph = StackGraph::build(vec![
        Stack::new("a", Arc::new(StaticAction::new([("root".to_string(), json!("A"))]))).with_output("root"),
        Stack::new("b", b.clone())
            .with_output("left")
            .with_input(InputRef::new("a", "root")),
        Stack::new("c", c.clone())
            .with_output("right")
            .with_input(InputRef::new("a", "root")),
        Stack::new("d", d.clone())
            .with_input(InputRef::new("b", "left"))
            .with_input(InputRef::new("c", "right")),
    ])
    .unwrap();
    let plan = graph.resolve();
    assert_eq!(plan.as_ids(), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);

    let started = std::time::Instant::now();
    let registry = provisioner()
        .with_event_sink(sink.clone())
        .run(&graph, &plan, 7)
        .await
        .unwrap();

    // b and c sleep concurrently, not back to back.
    assert!(started.elapsed() < Duration::from_millis(190));
    assert_eq!(registry.len(), 4);
    let seen = &d.applied()[0];
    assert_eq!(seen.inputs.get_str("b", "left"), Some("L"));
    assert_eq!(seen.inputs.get_str("c", "right"), Some("R"));
    assert_eq!(seen.run_id, 7);

    let completed: Vec<_> = sink
        .events_of_type(STACK_COMPLETED)
        .into_iter()
        .flatten()
        .map(|data| data["stack"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(completed.len(), 4);
    assert_eq!(completed[0], "a");
    assert_eq!(completed[3], "d");
}

fn resource_stacks(controller: &Arc<ExternalResourceController>) -> Vec<Stack> {
    let collection = ExternalResourceAction::new("rag-collection", controller.clone(), |_| {
        Ok(Box::new(DocumentPayload::new("collection", json!({"name": "rag"}))))
    })
    .into_stack("collection");

    let search = Stack::new(
        "search",
        Arc::new(StaticAction::new([(
            "endpoint".to_string(),
            json!("abc123.us-east-1.aoss.amazonaws.com"),
        )])),
    )
    .with_output("endpoint");

    let index = ExternalResourceAction::search_index(
        "docs-index",
        controller.clone(),
        InputRef::new("search", "endpoint"),
    )
    .with_parent("collection", "rag-collection")
    .into_stack("index");

    vec![collection, search, index]
}

#[tokio::test]
async fn test_resource_lifecycle_through_deployment() {
    let worker = Arc::new(IdempotentWorker::new());
    let sink = Arc::new(CollectingEventSink::new());
    let controller = Arc::new(
        ExternalResourceController::new(worker.clone(), &ControllerConfig::default())
            .with_event_sink(sink.clone()),
    );
    let state = Arc::new(InMemoryStateStore::new());
    let config = DeploymentConfig::new("rag").with_stack_option("index", "index_name", json!("docs"));

    let deployment = Deployment::new(config.clone(), resource_stacks(&controller))
        .unwrap()
        .with_state_store(state.clone());
    assert_eq!(deployment.plan().as_ids(), vec![vec!["collection", "search"], vec!["index"]]);

    let first = deployment.deploy().await.unwrap().outcome.unwrap();
    assert_eq!(first.get("collection", PHYSICAL_ID_OUTPUT), Some(&json!("phys-1")));
    assert_eq!(first.get("index", PHYSICAL_ID_OUTPUT), Some(&json!("phys-2")));

    // Nothing changed: no worker traffic.
    deployment.deploy().await.unwrap().outcome.unwrap();
    assert_eq!(worker.requests().len(), 2);

    // A new dimensionality updates the index in place.
    let resized = Deployment::new(
        config.with_stack_option("index", "vector_dimension", json!(512)),
        resource_stacks(&controller),
    )
    .unwrap()
    .with_state_store(state.clone());
    let third = resized.deploy().await.unwrap();
    assert_eq!(third.run_id, 3);
    assert_eq!(third.outcome.unwrap().get("index", PHYSICAL_ID_OUTPUT), Some(&json!("phys-2")));

    let index = controller.get("docs-index").await.unwrap().unwrap();
    assert_eq!(index.state(), ResourceState::Created);
    assert_eq!(index.generation, 2);
    assert_eq!(index.last_applied_payload.as_ref().unwrap()["vector_dimension"], json!(512));

    let destroyed = resized.destroy().await.unwrap();
    assert_eq!(destroyed.torn_down, vec!["index", "search", "collection"]);
    assert_eq!(worker.live_count(), 0);

    let calls: Vec<_> = worker
        .requests()
        .into_iter()
        .map(|request| (request.operation, request.logical_id))
        .collect();
    assert_eq!(
        calls,
        vec![
            (Operation::Create, "rag-collection".to_string()),
            (Operation::Create, "docs-index".to_string()),
            (Operation::Update, "docs-index".to_string()),
            (Operation::Delete, "docs-index".to_string()),
            (Operation::Delete, "rag-collection".to_string()),
        ]
    );

    let persisted = state.load().await.unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Destroyed);
    assert_eq!(persisted.run_id, 4);
    assert!(sink.count(RESOURCE_TRANSITION) >= 8);
}

#[tokio::test]
async fn test_child_resource_waits_for_parent() {
    let worker = Arc::new(IdempotentWorker::new());
    let controller = Arc::new(ExternalResourceController::new(
        worker.clone(),
        &ControllerConfig::default(),
    ));
    let config = DeploymentConfig::new("rag").with_stack_option("index", "index_name", json!("docs"));

    // The collection stack is replaced by one that publishes a physical id
    // without creating the resource.
    let mut stacks = resource_stacks(&controller);
    stacks[0] = Stack::new(
        "collection",
        Arc::new(StaticAction::new([(PHYSICAL_ID_OUTPUT.to_string(), json!("fake"))])),
    )
    .with_output(PHYSICAL_ID_OUTPUT);

    let report = Deployment::new(config, stacks).unwrap().deploy().await.unwrap();
    let failure = report.outcome.unwrap_err();

    assert_eq!(failure.stack, "index");
    assert!(failure.error.to_string().contains("rag-collection"));
    assert!(worker.requests().is_empty());
}

#[tokio::test]
async fn test_redelivered_create_keeps_physical_id() {
    use crate::external::{Worker, WorkerRequest, WorkerStatus};

    let worker = IdempotentWorker::new();
    let request = WorkerRequest {
        operation: Operation::Create,
        logical_id: "docs-index".to_string(),
        physical_id: None,
        payload: json!({"index_name": "docs"}),
        idempotency_token: "idx-1".to_string(),
        attempt: 1,
    };

    let first = worker.invoke(&request).await.unwrap();
    let redelivered = worker
        .invoke(&WorkerRequest { attempt: 2, ..request.clone() })
        .await
        .unwrap();

    assert_eq!(first.status, WorkerStatus::Success);
    assert_eq!(redelivered.physical_id, first.physical_id);
    assert_eq!(worker.live_count(), 1);
    assert_eq!(worker.tokens_seen(), vec!["idx-1".to_string(), "idx-1".to_string()]);
}
