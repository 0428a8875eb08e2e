use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique agent identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fresh identifier for an execution, trace node, or job.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Timeout,
}

/// Terminal status of a single execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Completed)
    }
}

impl From<ExecutionStatus> for AgentStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed => AgentStatus::Completed,
            ExecutionStatus::Failed => AgentStatus::Failed,
            ExecutionStatus::Timeout => AgentStatus::Timeout,
        }
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// Outcome of one `Agent::execute` call. Never mutated after it is returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub agent_id: AgentId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

/// Kind of work a trace node records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Agent,
    Tool,
    Llm,
    Workflow,
}

/// One node in a hierarchical execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TraceKind,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    /// Open a new node starting now.
    pub fn start(name: impl Into<String>, kind: TraceKind, input: serde_json::Value) -> Self {
        Self::start_with_id(new_id(), name, kind, input)
    }

    pub fn start_with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: TraceKind,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: name.into(),
            kind,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            input,
            output: serde_json::Value::Null,
            error: None,
            children: Vec::new(),
        }
    }

    /// Build a closed agent node from a finished execution.
    pub fn from_execution(
        name: impl Into<String>,
        input: serde_json::Value,
        result: &ExecutionResult,
    ) -> Self {
        Self {
            id: result.execution_id.clone(),
            parent_id: None,
            name: name.into(),
            kind: TraceKind::Agent,
            started_at: result.started_at,
            completed_at: Some(result.completed_at),
            duration_ms: Some(result.duration_ms),
            input,
            output: result.output.clone(),
            error: result.error.clone(),
            children: Vec::new(),
        }
    }

    /// Attach a child, stamping its parent id.
    pub fn push_child(&mut self, mut child: TraceNode) {
        child.parent_id = Some(self.id.clone());
        self.children.push(child);
    }

    /// Close the node successfully.
    pub fn complete(&mut self, output: serde_json::Value) {
        self.output = output;
        self.close();
    }

    /// Close the node with an error.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.completed_at.is_some()
    }

    fn close(&mut self) {
        let now = Utc::now();
        let elapsed = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.completed_at = Some(now);
        self.duration_ms = Some(elapsed);
    }

    /// Depth-first lookup by node id.
    pub fn find(&self, id: &str) -> Option<&TraceNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    /// Total number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TraceNode::node_count).sum::<usize>()
    }
}

/// One priced provider usage, recorded after an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: String,
    pub execution_id: String,
    pub agent_id: AgentId,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Cost in USD.
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// Filter for cost queries. Results are returned newest first.
#[derive(Debug, Clone, Default)]
pub struct CostFilter {
    pub agent_id: Option<AgentId>,
    pub model: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl CostFilter {
    pub fn for_agent(agent_id: &AgentId) -> Self {
        Self {
            agent_id: Some(agent_id.clone()),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &CostRecord) -> bool {
        self.agent_id.as_ref().map_or(true, |id| *id == record.agent_id)
            && self.model.as_ref().map_or(true, |m| *m == record.model)
            && self.since.map_or(true, |since| record.timestamp >= since)
    }
}

/// A page of query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Role in a provider conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A chat message sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// Per-call provider options, derived from the agent config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

/// Provider chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    pub token_usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// Severity attached to `log` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_add() {
        let mut usage = TokenUsage::new(100, 20);
        usage.add(&TokenUsage::new(50, 5));
        assert_eq!(usage.prompt_tokens, 150);
        assert_eq!(usage.completion_tokens, 25);
        assert_eq!(usage.total_tokens, 175);
        assert!(TokenUsage::default().is_empty());
    }

    #[test]
    fn test_trace_tree() {
        let mut root = TraceNode::start("wf", TraceKind::Workflow, serde_json::json!({"q": 1}));
        let mut child = TraceNode::start("step", TraceKind::Agent, serde_json::Value::Null);
        child.complete(serde_json::json!("ok"));
        let child_id = child.id.clone();
        root.push_child(child);
        root.fail("boom");

        assert!(root.is_closed());
        assert_eq!(root.error.as_deref(), Some("boom"));
        assert_eq!(root.node_count(), 2);
        let found = root.find(&child_id).unwrap();
        assert_eq!(found.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(found.output, serde_json::json!("ok"));
    }

    #[test]
    fn test_trace_kind_serializes_as_type() {
        let node = TraceNode::start("a", TraceKind::Llm, serde_json::Value::Null);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "llm");
    }

    #[test]
    fn test_cost_filter_matches() {
        let record = CostRecord {
            id: new_id(),
            execution_id: "e1".into(),
            agent_id: AgentId::from_string("a1"),
            model: "gpt-4o".into(),
            provider: "openai".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost: 0.0,
            timestamp: Utc::now(),
        };
        assert!(CostFilter::default().matches(&record));
        assert!(CostFilter::for_agent(&AgentId::from_string("a1")).matches(&record));
        assert!(!CostFilter::for_agent(&AgentId::from_string("a2")).matches(&record));
        let filter = CostFilter {
            model: Some("claude-3-opus".into()),
            ..CostFilter::default()
        };
        assert!(!filter.matches(&record));
    }

    #[test]
    fn test_execution_status_maps_to_agent_status() {
        assert_eq!(AgentStatus::from(ExecutionStatus::Timeout), AgentStatus::Timeout);
        assert!(ExecutionStatus::Completed.is_success());
        assert!(!ExecutionStatus::Failed.is_success());
    }
}
