use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weave_core::event::{EventBus, WeaveEvent};
use weave_core::traits::ExecutionStore;
use weave_core::types::{new_id, CostRecord, ExecutionResult, TraceNode};

use crate::pricing::PricingTable;

/// Writes executions, costs and traces to an [`ExecutionStore`] as events
/// arrive on the bus.
///
/// Store failures are logged and dropped; they never reach the execution
/// that produced the event.
pub struct ExecutionRecorder {
    store: Arc<dyn ExecutionStore>,
    pricing: Arc<PricingTable>,
}

impl ExecutionRecorder {
    pub fn new(store: Arc<dyn ExecutionStore>, pricing: Arc<PricingTable>) -> Self {
        Self { store, pricing }
    }

    /// Subscribe now and record in a background task until `cancel` fires
    /// or the bus is closed.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: broadcast::Receiver<WeaveEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("ExecutionRecorder cancelled");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(event) => self.record(&event).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "ExecutionRecorder lagged, events not recorded");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, ExecutionRecorder stopping");
                        break;
                    }
                },
            }
        }
    }

    /// Persist whatever `event` carries. Other events are ignored.
    pub async fn record(&self, event: &WeaveEvent) {
        match event {
            WeaveEvent::AgentCompleted { agent_name, model, result }
            | WeaveEvent::AgentFailed { agent_name, model, result } => {
                self.record_execution(agent_name, model, result).await;
            }
            WeaveEvent::WorkflowCompleted { execution_id, trace, .. }
            | WeaveEvent::WorkflowFailed { execution_id, trace, .. } => {
                self.record_trace(execution_id, trace.clone()).await;
            }
            _ => {}
        }
    }

    async fn record_execution(&self, agent_name: &str, model: &str, result: &ExecutionResult) {
        if let Err(e) = self.store.add_execution(result.clone()).await {
            warn!(execution_id = %result.execution_id, error = %e, "Failed to record execution");
        }

        self.record_trace(
            &result.execution_id,
            TraceNode::from_execution(agent_name, serde_json::Value::Null, result),
        )
        .await;

        let Some(usage) = result.token_usage else {
            return;
        };
        let record = CostRecord {
            id: new_id(),
            execution_id: result.execution_id.clone(),
            agent_id: result.agent_id.clone(),
            model: model.to_string(),
            provider: self.pricing.provider_name(model).to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cost: self.pricing.cost_for(model, &usage),
            timestamp: result.completed_at,
        };
        debug!(execution_id = %result.execution_id, model, cost = record.cost, "Recording cost");
        if let Err(e) = self.store.add_cost(record).await {
            warn!(execution_id = %result.execution_id, error = %e, "Failed to record cost");
        }
    }

    async fn record_trace(&self, execution_id: &str, trace: TraceNode) {
        if let Err(e) = self.store.add_trace(execution_id.to_string(), trace).await {
            warn!(execution_id, error = %e, "Failed to record trace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use weave_core::config::RuntimeConfig;
    use weave_core::types::{CostFilter, ExecutionStatus};
    use weave_memory::InMemoryStore;
    use weave_test_utils::*;

    use crate::runtime::AgentRuntime;
    use crate::workflow::{WorkflowDefinition, WorkflowScheduler, WorkflowStep};

    #[tokio::test]
    async fn records_executions_costs_and_traces() {
        let store = Arc::new(InMemoryStore::new());
        let runtime = Arc::new(AgentRuntime::new(RuntimeConfig::default()));
        let provider = Arc::new(MockProvider::new("openai").with_usage(2000, 500));
        runtime.register_provider("openai", provider);
        runtime.set_default_provider("openai").unwrap();

        let cancel = CancellationToken::new();
        let recorder = ExecutionRecorder::new(store.clone(), Arc::new(PricingTable::default()))
            .spawn(runtime.event_bus(), cancel.clone());

        runtime
            .create_agent(test_config("writer").with_model("gpt-4o"), provider_logic())
            .unwrap();
        let scheduler = WorkflowScheduler::new(runtime.clone());
        scheduler
            .register_workflow(WorkflowDefinition::new("one", "w").with_step(WorkflowStep::new("w", "writer")))
            .unwrap();
        let run = scheduler.execute_workflow("one", serde_json::json!("hi")).await.unwrap();
        let step = run.step_results["w"].clone();
        assert_eq!(step.status, ExecutionStatus::Completed);

        // The workflow trace is the last thing recorded for this run
        for _ in 0..200 {
            if store.get_trace(run.execution_id.clone()).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let executions = store.get_all_executions().await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].execution_id, step.execution_id);

        let costs = store.get_costs(CostFilter::default()).await.unwrap();
        assert_eq!(costs.total, 1);
        let cost = &costs.items[0];
        assert_eq!(cost.provider, "openai");
        assert_eq!(cost.total_tokens, 2500);
        // 2 * 0.0025 + 0.5 * 0.01
        assert!((cost.cost - 0.01).abs() < 1e-9);

        let trace = store.get_trace(run.execution_id.clone()).await.unwrap().unwrap();
        assert_eq!(trace.children.len(), 1);
        let step_trace = store.get_trace(step.execution_id.clone()).await.unwrap().unwrap();
        assert_eq!(step_trace.name, "writer");

        cancel.cancel();
        recorder.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_bus_closes() {
        let bus = EventBus::default();
        let recorder = ExecutionRecorder::new(Arc::new(InMemoryStore::new()), Arc::new(PricingTable::default()))
            .spawn(&bus, CancellationToken::new());
        bus.close();
        tokio::time::timeout(Duration::from_secs(1), recorder)
            .await
            .expect("recorder stops")
            .unwrap();
    }
}
