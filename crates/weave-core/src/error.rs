use thiserror::Error;

use crate::types::TraceNode;

#[derive(Debug, Error)]
pub enum WeaveError {
    // Configuration errors
    #[error("Invalid agent config: {0}")]
    InvalidAgentConfig(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Execution errors
    #[error("Agent execution failed: {0}")]
    Execution(String),

    #[error("Execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // Admission errors
    #[error("Concurrent execution limit reached ({limit})")]
    ConcurrencyLimit { limit: usize },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    // Reload errors
    #[error("Reload of agent {agent_id} failed: {reason}")]
    ReloadFailed { agent_id: String, reason: String },

    // Workflow errors
    #[error("Workflow '{workflow}' failed: {message}")]
    WorkflowFailed {
        workflow: String,
        step_id: Option<String>,
        message: String,
        trace: Box<TraceNode>,
    },

    // LLM errors
    #[error("LLM rate limited: {0}")]
    RateLimited(String),

    #[error("LLM rejected API key: {0}")]
    InvalidApiKey(String),

    #[error("LLM request timed out: {0}")]
    LlmTimeout(String),

    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    // Queue errors
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Queue '{0}' already has a consumer")]
    ConsumerAlreadyRegistered(String),

    #[error("Queue '{0}' is closed")]
    QueueClosed(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeaveError {
    /// Whether a caller may reasonably retry the operation that produced
    /// this error. Providers signal transient conditions through
    /// `RateLimited`, `LlmTimeout`, or a 5xx status in `LlmRequest`.
    ///
    /// The task queue consults this to decide whether a failed job goes
    /// back for another attempt. A full runtime or a failed workflow step
    /// may pass later; a missing agent or a malformed payload will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            WeaveError::RateLimited(_) | WeaveError::LlmTimeout(_) => true,
            WeaveError::ConcurrencyLimit { .. }
            | WeaveError::Timeout { .. }
            | WeaveError::WorkflowFailed { .. } => true,
            WeaveError::LlmRequest(msg) => {
                msg.contains("429")
                    || msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("504")
                    || msg.contains("connection")
            }
            WeaveError::Execution(_) | WeaveError::Database(_) | WeaveError::Io(_) => true,
            _ => false,
        }
    }

    /// The partial trace attached to a failed workflow run, if any.
    pub fn trace(&self) -> Option<&TraceNode> {
        match self {
            WeaveError::WorkflowFailed { trace, .. } => Some(trace),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WeaveError>;
