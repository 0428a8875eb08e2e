use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weave_core::error::{Result, WeaveError};
use weave_core::traits::ExecutionStore;
use weave_core::types::{
    AgentId, CostFilter, CostRecord, ExecutionResult, ExecutionStatus, Page, TraceNode,
};
use weave_queue::{EnqueueOptions, TaskQueue, TaskQueueItem};

use crate::cost::{CostEstimate, CostEstimator};
use crate::pricing::PricingTable;
use crate::recorder::ExecutionRecorder;
use crate::runtime::AgentRuntime;
use crate::workflow::{WorkflowDefinition, WorkflowRun, WorkflowScheduler};

/// Queue routing key for single-agent jobs.
pub const AGENT_TASK: &str = "agent";
/// Queue routing key for workflow jobs.
pub const WORKFLOW_TASK: &str = "workflow";

/// Payload of an `agent` job. `agent` is an agent id or, failing that, a
/// name, since ids are local to the process that created the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub agent: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Payload of a `workflow` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub workflow: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Front door over the runtime, scheduler, estimator, store and queue.
pub struct Orchestrator {
    runtime: Arc<AgentRuntime>,
    scheduler: Arc<WorkflowScheduler>,
    estimator: CostEstimator,
    store: Arc<dyn ExecutionStore>,
    queue: Option<Arc<TaskQueue>>,
    recorder: Mutex<Option<JoinHandle<()>>>,
    recorder_cancel: CancellationToken,
}

impl Orchestrator {
    /// Wire the components and start recording to `store`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        runtime: Arc<AgentRuntime>,
        store: Arc<dyn ExecutionStore>,
        pricing: Arc<PricingTable>,
    ) -> Self {
        let scheduler = Arc::new(WorkflowScheduler::new(runtime.clone()));
        let estimator = CostEstimator::new(runtime.clone(), pricing.clone()).with_store(store.clone());
        let recorder_cancel = CancellationToken::new();
        let recorder = ExecutionRecorder::new(store.clone(), pricing)
            .spawn(runtime.event_bus(), recorder_cancel.clone());

        Self {
            runtime,
            scheduler,
            estimator,
            store,
            queue: None,
            recorder: Mutex::new(Some(recorder)),
            recorder_cancel,
        }
    }

    pub fn with_queue(mut self, queue: Arc<TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    pub fn scheduler(&self) -> &Arc<WorkflowScheduler> {
        &self.scheduler
    }

    pub fn queue(&self) -> Option<&Arc<TaskQueue>> {
        self.queue.as_ref()
    }

    fn require_queue(&self) -> Result<&Arc<TaskQueue>> {
        self.queue
            .as_ref()
            .ok_or_else(|| WeaveError::Queue("no task queue configured".into()))
    }

    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        self.scheduler.register_workflow(definition)
    }

    pub async fn execute_agent(
        &self,
        id: &AgentId,
        input: serde_json::Value,
    ) -> Result<ExecutionResult> {
        self.runtime.execute_agent(id, input).await
    }

    pub async fn execute_workflow(&self, name: &str, input: serde_json::Value) -> Result<WorkflowRun> {
        self.scheduler.execute_workflow(name, input).await
    }

    /// Estimate a registered workflow.
    pub async fn estimate_workflow_cost(
        &self,
        name: &str,
        input: &serde_json::Value,
    ) -> Result<CostEstimate> {
        let definition = self
            .scheduler
            .get_workflow(name)
            .ok_or_else(|| WeaveError::WorkflowNotFound(name.to_string()))?;
        self.estimator.estimate_workflow_cost(&definition, input).await
    }

    /// Enqueue a single-agent job. Returns the job id.
    pub async fn submit_agent(
        &self,
        agent: &str,
        input: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        let payload = serde_json::to_value(AgentTask {
            agent: agent.to_string(),
            input,
        })?;
        let job_id = self
            .require_queue()?
            .add(TaskQueueItem::new(AGENT_TASK, payload), options)
            .await?;
        debug!(job_id = %job_id, agent, "Agent job submitted");
        Ok(job_id)
    }

    /// Enqueue a workflow job. Returns the job id.
    pub async fn submit_workflow(
        &self,
        workflow: &str,
        input: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        let payload = serde_json::to_value(WorkflowTask {
            workflow: workflow.to_string(),
            input,
        })?;
        let job_id = self
            .require_queue()?
            .add(TaskQueueItem::new(WORKFLOW_TASK, payload), options)
            .await?;
        debug!(job_id = %job_id, workflow, "Workflow job submitted");
        Ok(job_id)
    }

    /// Register this process as the queue consumer.
    ///
    /// An agent job whose execution does not complete, or a workflow job
    /// whose run fails, fails the job so the queue's retry policy applies.
    /// Jobs naming an unknown agent or workflow, or carrying a payload that
    /// does not decode, fail without further attempts.
    pub fn start_worker(&self) -> Result<()> {
        let queue = self.require_queue()?;
        let runtime = self.runtime.clone();
        let scheduler = self.scheduler.clone();
        queue.process(move |item| {
            let runtime = runtime.clone();
            let scheduler = scheduler.clone();
            async move { handle_task(&runtime, &scheduler, item).await }
        })?;
        info!(queue = %queue.name(), "Orchestrator worker started");
        Ok(())
    }

    pub async fn get_trace(&self, execution_id: &str) -> Result<Option<TraceNode>> {
        self.store.get_trace(execution_id.to_string()).await
    }

    pub async fn get_costs(&self, filter: CostFilter) -> Result<Page<CostRecord>> {
        self.store.get_costs(filter).await
    }

    pub async fn get_executions(&self) -> Result<Vec<ExecutionResult>> {
        self.store.get_all_executions().await
    }

    /// Close the queue, shut the runtime down and let the recorder drain
    /// the events already published. Call once.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            queue.close().await;
        }
        self.runtime.shutdown().await;

        let recorder = self
            .recorder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(recorder) = recorder {
            if let Err(e) = recorder.await {
                warn!(error = %e, "Execution recorder ended abnormally");
            }
        }
        info!("Orchestrator shut down");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.recorder_cancel.cancel();
    }
}

async fn handle_task(
    runtime: &AgentRuntime,
    scheduler: &WorkflowScheduler,
    item: TaskQueueItem,
) -> Result<serde_json::Value> {
    match item.kind.as_str() {
        AGENT_TASK => {
            let task: AgentTask = serde_json::from_value(item.payload)?;
            let agent = runtime
                .get_agent(&AgentId::from_string(&task.agent))
                .or_else(|| runtime.get_agent_by_name(&task.agent))
                .ok_or_else(|| WeaveError::AgentNotFound(task.agent.clone()))?;

            let result = runtime.execute_agent(agent.id(), task.input).await?;
            if result.status != ExecutionStatus::Completed {
                return Err(WeaveError::Execution(format!(
                    "agent '{}' did not complete ({:?}): {}",
                    task.agent,
                    result.status,
                    result.error.as_deref().unwrap_or_default()
                )));
            }
            Ok(serde_json::to_value(&result)?)
        }
        WORKFLOW_TASK => {
            let task: WorkflowTask = serde_json::from_value(item.payload)?;
            let run = scheduler.execute_workflow(&task.workflow, task.input).await?;
            Ok(serde_json::json!({
                "execution_id": run.execution_id,
                "workflow": run.workflow,
                "output": run.output,
            }))
        }
        other => Err(WeaveError::Queue(format!("unknown task type '{}'", other))),
    }
}
