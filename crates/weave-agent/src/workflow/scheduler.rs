use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info};

use weave_core::error::{Result, WeaveError};
use weave_core::event::WeaveEvent;
use weave_core::types::{new_id, ExecutionResult, ExecutionStatus, TraceKind, TraceNode};

use super::definition::{WorkflowDefinition, WorkflowStep};
use crate::runtime::AgentRuntime;

/// Outcome of a successful workflow invocation.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub execution_id: String,
    pub workflow: String,
    /// The single terminal step's output, or a map of step id to output.
    pub output: serde_json::Value,
    pub step_results: HashMap<String, ExecutionResult>,
    /// Steps whose condition was unsatisfied, in the order they were seen.
    pub skipped: Vec<String>,
    pub trace: TraceNode,
}

/// Registers workflow definitions and runs them on an [`AgentRuntime`].
pub struct WorkflowScheduler {
    runtime: Arc<AgentRuntime>,
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowScheduler {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self {
            runtime,
            workflows: RwLock::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Validate and store a definition, replacing any with the same name.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        info!(
            workflow = %definition.name,
            steps = definition.steps.len(),
            "Workflow registered"
        );
        self.workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get_workflow(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Registered workflow names, sorted.
    pub fn list_workflows(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn remove_workflow(&self, name: &str) -> bool {
        self.workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    /// Run a registered workflow.
    pub async fn execute_workflow(&self, name: &str, input: serde_json::Value) -> Result<WorkflowRun> {
        let definition = self
            .get_workflow(name)
            .ok_or_else(|| WeaveError::WorkflowNotFound(name.to_string()))?;
        self.run(&definition, input).await
    }

    /// Run `definition` round by round.
    ///
    /// Each round executes every frontier step whose predecessors have all
    /// been executed, concurrently. The first step that fails or times out
    /// aborts the run; siblings still in flight are abandoned and siblings
    /// that already finished are kept in the trace.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<WorkflowRun> {
        let execution_id = new_id();
        let workflow = definition.name.clone();
        let events = self.runtime.event_bus();
        let mut root = TraceNode::start_with_id(
            execution_id.clone(),
            workflow.clone(),
            TraceKind::Workflow,
            input.clone(),
        );

        info!(workflow = %workflow, execution_id = %execution_id, "Workflow started");
        events.publish(WeaveEvent::WorkflowStarted {
            execution_id: execution_id.clone(),
            workflow: workflow.clone(),
        });

        let mut executed: HashSet<String> = HashSet::new();
        let mut outputs = serde_json::Map::new();
        let mut step_results = HashMap::new();
        let mut skipped = Vec::new();
        let mut frontier = vec![definition.entry_point.clone()];

        while !frontier.is_empty() {
            let ready: Vec<&WorkflowStep> = frontier
                .iter()
                .filter_map(|id| definition.step(id))
                .filter(|step| !executed.contains(&step.id))
                .filter(|step| {
                    definition
                        .predecessors(&step.id)
                        .all(|p| executed.contains(&p.id))
                })
                .collect();

            if ready.is_empty() {
                debug!(
                    workflow = %workflow,
                    frontier = ?frontier,
                    "No step is ready, stopping"
                );
                break;
            }

            let step_input = serde_json::json!({
                "initial": input,
                "previousSteps": serde_json::Value::Object(outputs.clone()),
            });

            let mut in_flight = FuturesUnordered::new();
            for step in &ready {
                if let Some(condition) = &step.condition {
                    if !condition.evaluate(&outputs) {
                        debug!(workflow = %workflow, step_id = %step.id, condition = %condition, "Condition unsatisfied, skipping step");
                        skipped.push(step.id.clone());
                        continue;
                    }
                }
                in_flight.push(self.run_step(step, step_input.clone()));
            }

            while let Some((step, outcome)) = in_flight.next().await {
                let result = match outcome {
                    Ok(result) => result,
                    Err(e) => {
                        let mut node = TraceNode::start(step.id.clone(), TraceKind::Agent, step_input.clone());
                        node.fail(e.to_string());
                        root.push_child(node);
                        let message = format!("step '{}' could not run: {}", step.id, e);
                        return Err(self.fail(&execution_id, root, Some(&step.id), message));
                    }
                };

                root.push_child(TraceNode::from_execution(
                    step.id.clone(),
                    step_input.clone(),
                    &result,
                ));
                events.publish(WeaveEvent::WorkflowStepCompleted {
                    execution_id: execution_id.clone(),
                    workflow: workflow.clone(),
                    step_id: step.id.clone(),
                    result: result.clone(),
                });

                if !result.status.is_success() {
                    let status = match result.status {
                        ExecutionStatus::Timeout => "timed out",
                        _ => "failed",
                    };
                    let message = format!(
                        "step '{}' {}: {}",
                        step.id,
                        status,
                        result.error.as_deref().unwrap_or("no error reported")
                    );
                    return Err(self.fail(&execution_id, root, Some(&step.id), message));
                }

                debug!(workflow = %workflow, step_id = %step.id, duration_ms = result.duration_ms, "Step completed");
                outputs.insert(step.id.clone(), result.output.clone());
                step_results.insert(step.id.clone(), result);
            }
            drop(in_flight);

            executed.extend(ready.iter().map(|step| step.id.clone()));
            frontier = definition
                .steps
                .iter()
                .filter(|step| !executed.contains(&step.id))
                .filter(|step| definition.predecessors(&step.id).any(|p| executed.contains(&p.id)))
                .map(|step| step.id.clone())
                .collect();
        }

        let mut terminals = definition.terminal_steps();
        let output = match (terminals.next(), terminals.next()) {
            (Some(terminal), None) => outputs
                .get(&terminal.id)
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            _ => serde_json::Value::Object(outputs),
        };

        root.complete(output.clone());
        info!(
            workflow = %workflow,
            execution_id = %execution_id,
            steps = step_results.len(),
            skipped = skipped.len(),
            duration_ms = root.duration_ms.unwrap_or_default(),
            "Workflow completed"
        );
        events.publish(WeaveEvent::WorkflowCompleted {
            execution_id: execution_id.clone(),
            workflow: workflow.clone(),
            trace: root.clone(),
        });

        Ok(WorkflowRun {
            execution_id,
            workflow,
            output,
            step_results,
            skipped,
            trace: root,
        })
    }

    /// Resolve the step's agent and execute it. Errors are admission errors.
    async fn run_step<'s>(
        &self,
        step: &'s WorkflowStep,
        input: serde_json::Value,
    ) -> (&'s WorkflowStep, Result<ExecutionResult>) {
        let outcome = match self.runtime.get_agent_by_name(&step.agent) {
            Some(agent) => self.runtime.execute_agent(agent.id(), input).await,
            None => Err(WeaveError::AgentNotFound(step.agent.clone())),
        };
        (step, outcome)
    }

    fn fail(
        &self,
        execution_id: &str,
        mut root: TraceNode,
        step_id: Option<&str>,
        message: String,
    ) -> WeaveError {
        root.fail(message.clone());
        error!(
            workflow = %root.name,
            execution_id = %execution_id,
            step_id = step_id.unwrap_or_default(),
            error = %message,
            "Workflow failed"
        );
        self.runtime.event_bus().publish(WeaveEvent::WorkflowFailed {
            execution_id: execution_id.to_string(),
            workflow: root.name.clone(),
            error: message.clone(),
            trace: root.clone(),
        });
        WeaveError::WorkflowFailed {
            workflow: root.name.clone(),
            step_id: step_id.map(str::to_string),
            message,
            trace: Box::new(root),
        }
    }
}
