use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{AgentId, AgentStatus, ExecutionResult, LogLevel, TraceNode};

/// Event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum WeaveEvent {
    #[serde(rename = "agent:started")]
    AgentStarted {
        agent_id: AgentId,
        agent_name: String,
        execution_id: String,
    },
    #[serde(rename = "agent:completed")]
    AgentCompleted {
        agent_name: String,
        model: String,
        result: ExecutionResult,
    },
    /// Also used for timed-out executions; `result.status` tells them apart.
    #[serde(rename = "agent:failed")]
    AgentFailed {
        agent_name: String,
        model: String,
        result: ExecutionResult,
    },
    #[serde(rename = "agent:status")]
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
    },
    #[serde(rename = "agent:reloaded")]
    AgentReloaded {
        agent_id: AgentId,
        agent_name: String,
    },
    #[serde(rename = "agent:reload-failed")]
    AgentReloadFailed { agent_id: AgentId, reason: String },
    #[serde(rename = "workflow:started")]
    WorkflowStarted {
        execution_id: String,
        workflow: String,
    },
    /// Published for every step that settles, including failed and timed
    /// out ones. `result.status` tells them apart.
    #[serde(rename = "workflow:step:completed")]
    WorkflowStepCompleted {
        execution_id: String,
        workflow: String,
        step_id: String,
        result: ExecutionResult,
    },
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted {
        execution_id: String,
        workflow: String,
        trace: TraceNode,
    },
    #[serde(rename = "workflow:failed")]
    WorkflowFailed {
        execution_id: String,
        workflow: String,
        error: String,
        trace: TraceNode,
    },
    #[serde(rename = "log")]
    Log { level: LogLevel, message: String },
}

impl WeaveEvent {
    /// Stable wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            WeaveEvent::AgentStarted { .. } => "agent:started",
            WeaveEvent::AgentCompleted { .. } => "agent:completed",
            WeaveEvent::AgentFailed { .. } => "agent:failed",
            WeaveEvent::AgentStatusChanged { .. } => "agent:status",
            WeaveEvent::AgentReloaded { .. } => "agent:reloaded",
            WeaveEvent::AgentReloadFailed { .. } => "agent:reload-failed",
            WeaveEvent::WorkflowStarted { .. } => "workflow:started",
            WeaveEvent::WorkflowStepCompleted { .. } => "workflow:step:completed",
            WeaveEvent::WorkflowCompleted { .. } => "workflow:completed",
            WeaveEvent::WorkflowFailed { .. } => "workflow:failed",
            WeaveEvent::Log { .. } => "log",
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        WeaveEvent::Log {
            level,
            message: message.into(),
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: RwLock<broadcast::Sender<WeaveEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx: RwLock::new(tx),
            capacity,
        }
    }

    pub fn publish(&self, event: WeaveEvent) {
        if let Ok(tx) = self.tx.read() {
            // Ignore error if no receivers
            let _ = tx.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WeaveEvent> {
        match self.tx.read() {
            Ok(tx) => tx.subscribe(),
            Err(poisoned) => poisoned.into_inner().subscribe(),
        }
    }

    /// Detach every current subscriber. Their receivers observe
    /// `RecvError::Closed`; later subscribers attach to a fresh channel.
    pub fn close(&self) {
        let (fresh, _) = broadcast::channel(self.capacity);
        match self.tx.write() {
            Ok(mut tx) => *tx = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.read().map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
