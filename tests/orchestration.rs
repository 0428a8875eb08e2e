use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use weave_agent::{AgentRuntime, Orchestrator, PricingTable, WorkflowDefinition};
use weave_core::config::{QueueConfig, RuntimeConfig};
use weave_core::types::{CostFilter, ExecutionStatus};
use weave_memory::InMemoryStore;
use weave_queue::{EnqueueOptions, JobState, QueueEvent, TaskQueue};
use weave_test_utils::*;

const PIPELINE: &str = r#"
name = "pipeline"
entry_point = "fetch"

[[steps]]
id = "fetch"
agent = "fetcher"
next = ["summarize", "tag"]

[[steps]]
id = "summarize"
agent = "writer"
next = "publish"

[[steps]]
id = "tag"
agent = "fetcher"
next = "publish"
condition = "fetch.ready"

[[steps]]
id = "publish"
agent = "publisher"
"#;

fn queue_config(dir: &tempfile::TempDir) -> QueueConfig {
    QueueConfig {
        name: "e2e".into(),
        database: dir.path().join("queue.db").display().to_string(),
        poll_interval_ms: 10,
        ..QueueConfig::default()
    }
}

async fn next_outcome(rx: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("queue event in time")
            .expect("queue open");
        if !matches!(event, QueueEvent::Added { .. }) {
            return event;
        }
    }
}

fn orchestrator(store: Arc<InMemoryStore>, queue: Arc<TaskQueue>) -> Orchestrator {
    let runtime = Arc::new(AgentRuntime::new(RuntimeConfig::default()));
    let provider = Arc::new(MockProvider::new("openai").with_usage(1200, 300).with_fallback("summary"));
    runtime.register_provider("openai", provider);
    runtime.set_default_provider("openai").unwrap();

    runtime
        .create_agent(test_config("fetcher"), constant_logic(json!({"ready": true, "doc": "text"})))
        .unwrap();
    runtime
        .create_agent(test_config("writer").with_model("gpt-4o"), provider_logic())
        .unwrap();
    runtime.create_agent(test_config("publisher"), echo_logic()).unwrap();

    let orch = Orchestrator::new(runtime, store, Arc::new(PricingTable::default())).with_queue(queue);
    orch.register_workflow(WorkflowDefinition::parse(PIPELINE).unwrap())
        .unwrap();
    orch
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workflow_submitted_by_producer_runs_on_worker() {
    let dir = temp_dir();
    let store = Arc::new(InMemoryStore::new());

    // Producer and worker open the same database separately
    let producer = TaskQueue::open(queue_config(&dir)).unwrap();
    let worker_queue = Arc::new(TaskQueue::open(queue_config(&dir)).unwrap());
    let mut rx = worker_queue.subscribe();
    let orch = orchestrator(store.clone(), worker_queue);
    orch.start_worker().unwrap();

    let job_id = producer
        .add_task("workflow", json!({"workflow": "pipeline", "input": {"url": "https://x"}}))
        .await
        .unwrap();

    let execution_id = match next_outcome(&mut rx).await {
        QueueEvent::Completed { job_id: done, result } => {
            assert_eq!(done, job_id);
            result["execution_id"].as_str().unwrap().to_string()
        }
        other => panic!("unexpected {:?}", other),
    };

    let job = producer.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);

    orch.shutdown().await;
    producer.close().await;

    let trace = orch.get_trace(&execution_id).await.unwrap().expect("workflow trace");
    let steps: Vec<&str> = trace.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(steps.len(), 4);
    assert_eq!(steps[0], "fetch");
    assert_eq!(steps[3], "publish");

    let executions = orch.get_executions().await.unwrap();
    assert_eq!(executions.len(), 4);
    assert!(executions.iter().all(|e| e.status == ExecutionStatus::Completed));

    // Only the writer talks to the provider
    let costs = orch.get_costs(CostFilter::default()).await.unwrap();
    assert_eq!(costs.total, 1);
    assert_eq!(costs.items[0].model, "gpt-4o");
    assert_eq!(costs.items[0].total_tokens, 1500);
}

#[tokio::test]
async fn estimate_uses_recorded_history() {
    let dir = temp_dir();
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(TaskQueue::open(queue_config(&dir)).unwrap());
    let orch = orchestrator(store, queue);

    let before = orch.estimate_workflow_cost("pipeline", &json!({})).await.unwrap();
    assert_eq!(before.steps.len(), 4);

    orch.execute_workflow("pipeline", json!({"url": "https://x"})).await.unwrap();

    // Give the recorder a moment to persist the writer's cost
    for _ in 0..200 {
        if orch.get_costs(CostFilter::default()).await.unwrap().total > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let after = orch.estimate_workflow_cost("pipeline", &json!({})).await.unwrap();
    let summarize = after.steps.iter().find(|s| s.step_id == "summarize").unwrap();
    assert_eq!(summarize.token_usage.total_tokens, 1500);
    assert_eq!(
        serde_json::to_value(after.source).unwrap(),
        json!("historical")
    );
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_from_another_handle_holds_worker() {
    let dir = temp_dir();
    let admin = TaskQueue::open(queue_config(&dir)).unwrap();
    let worker_queue = Arc::new(TaskQueue::open(queue_config(&dir)).unwrap());
    let mut rx = worker_queue.subscribe();
    let orch = orchestrator(Arc::new(InMemoryStore::new()), worker_queue);

    admin.pause().await.unwrap();
    orch.start_worker().unwrap();
    let job_id = orch
        .submit_agent("publisher", json!("hello"), EnqueueOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        admin.get_job(&job_id).await.unwrap().unwrap().state,
        JobState::Waiting
    );

    admin.resume().await.unwrap();
    match next_outcome(&mut rx).await {
        QueueEvent::Completed { result, .. } => assert_eq!(result["output"], "hello"),
        other => panic!("unexpected {:?}", other),
    }

    orch.shutdown().await;
    admin.close().await;
}
