use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// A metered chat completion backend.
///
/// Implementations surface rate limits, timeouts and rejected keys as
/// `WeaveError::RateLimited`, `WeaveError::LlmTimeout` and
/// `WeaveError::InvalidApiKey` so callers can tell them apart.
pub trait LlmProvider: Send + Sync + 'static {
    /// Provider name (e.g., "openai", "anthropic").
    fn name(&self) -> &str;

    /// Send a chat request and wait for the full response.
    fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> BoxFuture<'_, Result<ChatResponse>>;
}

/// Persistence for executions, costs and traces.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Record a finished execution.
    fn add_execution(&self, result: ExecutionResult) -> BoxFuture<'_, Result<()>>;

    /// All recorded executions, oldest first.
    fn get_all_executions(&self) -> BoxFuture<'_, Result<Vec<ExecutionResult>>>;

    /// Record a priced provider usage.
    fn add_cost(&self, record: CostRecord) -> BoxFuture<'_, Result<()>>;

    /// Query cost records, newest first.
    fn get_costs(&self, filter: CostFilter) -> BoxFuture<'_, Result<Page<CostRecord>>>;

    /// Record the trace of an execution.
    fn add_trace(&self, execution_id: String, trace: TraceNode) -> BoxFuture<'_, Result<()>>;

    /// Load the trace recorded for an execution.
    fn get_trace(&self, execution_id: String) -> BoxFuture<'_, Result<Option<TraceNode>>>;
}
