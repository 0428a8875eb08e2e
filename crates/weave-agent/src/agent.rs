use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use weave_core::config::{AgentConfig, BackoffConfig};
use weave_core::context::{AgentContext, AgentLogic};
use weave_core::error::{Result, WeaveError};
use weave_core::event::{EventBus, WeaveEvent};
use weave_core::traits::LlmProvider;
use weave_core::types::{new_id, AgentId, AgentStatus, ExecutionResult, ExecutionStatus};

use crate::retry::calculate_backoff;

/// A configured unit of logic with its own retry and timeout policy.
///
/// Config, logic and provider binding are fixed at construction; the
/// runtime replaces the whole agent to change them.
pub struct Agent {
    id: AgentId,
    config: Arc<AgentConfig>,
    logic: AgentLogic,
    provider: Option<Arc<dyn LlmProvider>>,
    backoff: BackoffConfig,
    events: Arc<EventBus>,
    status: Mutex<AgentStatus>,
    current_execution: Mutex<Option<String>>,
    state: RwLock<HashMap<String, serde_json::Value>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("model", &self.config.model)
            .field("status", &self.status())
            .finish()
    }
}

impl Agent {
    /// Validate `config` and build an idle agent.
    pub fn new(
        id: AgentId,
        config: AgentConfig,
        logic: AgentLogic,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id,
            config: Arc::new(config),
            logic,
            provider: None,
            backoff: BackoffConfig::default(),
            events,
            status: Mutex::new(AgentStatus::Idle),
            current_execution: Mutex::new(None),
            state: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_provider(mut self, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) fn with_state(self, state: HashMap<String, serde_json::Value>) -> Self {
        match self.state.write() {
            Ok(mut current) => *current = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
        self
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn logic(&self) -> &AgentLogic {
        &self.logic
    }

    pub fn provider(&self) -> Option<&Arc<dyn LlmProvider>> {
        self.provider.as_ref()
    }

    pub fn status(&self) -> AgentStatus {
        match self.status.lock() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Id of the execution currently in flight, if any.
    pub fn current_execution(&self) -> Option<String> {
        match self.current_execution.lock() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn state(&self) -> HashMap<String, serde_json::Value> {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get_state(&self, key: &str) -> Option<serde_json::Value> {
        match self.state.read() {
            Ok(state) => state.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    /// Set a key in the private state. Executions already running keep
    /// the snapshot they started with.
    pub fn set_state(&self, key: impl Into<String>, value: serde_json::Value) {
        match self.state.write() {
            Ok(mut state) => state.insert(key.into(), value),
            Err(poisoned) => poisoned.into_inner().insert(key.into(), value),
        };
    }

    pub fn remove_state(&self, key: &str) -> Option<serde_json::Value> {
        match self.state.write() {
            Ok(mut state) => state.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        }
    }

    fn set_status(&self, status: AgentStatus) {
        let changed = match self.status.lock() {
            Ok(mut current) => std::mem::replace(&mut *current, status) != status,
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), status) != status,
        };
        if changed {
            self.events.publish(WeaveEvent::AgentStatusChanged {
                agent_id: self.id.clone(),
                status,
            });
        }
    }

    fn set_current_execution(&self, execution_id: Option<String>) {
        match self.current_execution.lock() {
            Ok(mut current) => *current = execution_id,
            Err(poisoned) => *poisoned.into_inner() = execution_id,
        }
    }

    /// Run the logic once, retrying failed attempts with backoff, all
    /// within the configured timeout.
    ///
    /// Never fails: every outcome is encoded in the returned status. The
    /// timeout is best-effort. When it fires, the running attempt is
    /// abandoned rather than cancelled and its eventual result is dropped.
    pub async fn execute(&self, input: serde_json::Value) -> ExecutionResult {
        let execution_id = new_id();
        let started_at = Utc::now();
        let clock = Instant::now();

        self.set_current_execution(Some(execution_id.clone()));
        let mut guard = ExecutionGuard {
            agent: self,
            execution_id: &execution_id,
            settled: false,
        };
        self.set_status(AgentStatus::Running);
        self.events.publish(WeaveEvent::AgentStarted {
            agent_id: self.id.clone(),
            agent_name: self.config.name.clone(),
            execution_id: execution_id.clone(),
        });
        info!(
            agent_id = %self.id,
            agent = %self.config.name,
            execution_id = %execution_id,
            "Agent execution started"
        );

        let ctx = AgentContext::new(
            execution_id.clone(),
            self.id.clone(),
            input,
            self.config.clone(),
        )
        .with_state(self.state())
        .with_provider(self.provider.clone());
        let usage = ctx.clone();

        let attempts = tokio::spawn(run_attempts(
            self.logic.clone(),
            ctx,
            self.config.max_retries,
            self.backoff.clone(),
        ));

        let timeout_ms = self.config.timeout_ms;
        let (status, output, error) =
            match tokio::time::timeout(Duration::from_millis(timeout_ms), attempts).await {
                Ok(Ok(Ok(output))) => (ExecutionStatus::Completed, output, None),
                Ok(Ok(Err(e))) => (ExecutionStatus::Failed, serde_json::Value::Null, Some(e.to_string())),
                Ok(Err(e)) => (
                    ExecutionStatus::Failed,
                    serde_json::Value::Null,
                    Some(format!("agent logic panicked: {}", e)),
                ),
                Err(_) => (
                    ExecutionStatus::Timeout,
                    serde_json::Value::Null,
                    Some(WeaveError::Timeout { timeout_ms }.to_string()),
                ),
            };

        let token_usage = usage.token_usage();
        let result = ExecutionResult {
            execution_id: execution_id.clone(),
            agent_id: self.id.clone(),
            status,
            output,
            error,
            started_at,
            completed_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            token_usage: (!token_usage.is_empty()).then_some(token_usage),
        };

        self.set_status(status.into());
        if status.is_success() {
            info!(
                agent_id = %self.id,
                execution_id = %execution_id,
                duration_ms = result.duration_ms,
                "Agent execution completed"
            );
            self.events.publish(WeaveEvent::AgentCompleted {
                agent_name: self.config.name.clone(),
                model: self.config.model.clone(),
                result: result.clone(),
            });
        } else {
            warn!(
                agent_id = %self.id,
                execution_id = %execution_id,
                status = ?status,
                error = result.error.as_deref().unwrap_or_default(),
                "Agent execution did not complete"
            );
            self.events.publish(WeaveEvent::AgentFailed {
                agent_name: self.config.name.clone(),
                model: self.config.model.clone(),
                result: result.clone(),
            });
        }

        guard.settled = true;
        result
    }
}

/// Clears the current-execution marker however `execute` exits. If the
/// execute future is dropped before it settles, the agent goes back to idle.
struct ExecutionGuard<'a> {
    agent: &'a Agent,
    execution_id: &'a str,
    settled: bool,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        let mut current = match self.agent.current_execution.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A newer execution may have started on the same agent and owns the status
        let is_current = current.as_deref() == Some(self.execution_id);
        if is_current {
            *current = None;
        }
        drop(current);

        if !self.settled && is_current {
            debug!(
                agent_id = %self.agent.id,
                execution_id = %self.execution_id,
                "Execution dropped before settling"
            );
            self.agent.set_status(AgentStatus::Idle);
        }
    }
}

async fn run_attempts(
    logic: AgentLogic,
    ctx: AgentContext,
    max_retries: u32,
    backoff: BackoffConfig,
) -> Result<serde_json::Value> {
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = calculate_backoff(attempt, &backoff);
            debug!(
                execution_id = %ctx.execution_id,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                "Backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }

        match logic(ctx.for_attempt(attempt)).await {
            Ok(output) => return Ok(output),
            Err(e) if attempt < max_retries => {
                warn!(
                    execution_id = %ctx.execution_id,
                    attempt = attempt + 1,
                    max_retries,
                    error = %e,
                    "Agent attempt failed, retrying"
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
