use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::config::AgentConfig;
use crate::error::{Result, WeaveError};
use crate::traits::LlmProvider;
use crate::types::{AgentId, ChatMessage, ChatOptions, ChatResponse, Role, TokenUsage};

/// The unit of logic an agent runs: `(context) -> output`.
pub type AgentLogic =
    Arc<dyn Fn(AgentContext) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Wrap an async closure as [`AgentLogic`].
pub fn agent_logic<F, Fut>(f: F) -> AgentLogic
where
    F: Fn(AgentContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Everything a logic callback sees during one attempt of an execution.
///
/// There is no cancellation signal here: when an execution times out the
/// attempt keeps running in the background and its result is discarded.
/// Logic with external side effects should watch its own deadline,
/// derived from `config().timeout_ms`.
#[derive(Clone)]
pub struct AgentContext {
    pub execution_id: String,
    pub agent_id: AgentId,
    /// Zero-based attempt number within the execution.
    pub attempt: u32,
    pub input: serde_json::Value,
    /// Snapshot of the agent's private state taken when the execution began.
    pub state: HashMap<String, serde_json::Value>,
    config: Arc<AgentConfig>,
    provider: Option<Arc<dyn LlmProvider>>,
    usage: Arc<Mutex<TokenUsage>>,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("execution_id", &self.execution_id)
            .field("agent_id", &self.agent_id)
            .field("attempt", &self.attempt)
            .field("input", &self.input)
            .field("state_keys", &self.state.len())
            .field("agent", &self.config.name)
            .field("provider", &self.provider.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl AgentContext {
    pub fn new(
        execution_id: impl Into<String>,
        agent_id: AgentId,
        input: serde_json::Value,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            agent_id,
            attempt: 0,
            input,
            state: HashMap::new(),
            config,
            provider: None,
            usage: Arc::new(Mutex::new(TokenUsage::default())),
        }
    }

    pub fn with_state(mut self, state: HashMap<String, serde_json::Value>) -> Self {
        self.state = state;
        self
    }

    pub fn with_provider(mut self, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        self.provider = provider;
        self
    }

    /// Same execution, next attempt. Token usage keeps accumulating.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        let mut ctx = self.clone();
        ctx.attempt = attempt;
        ctx
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn provider(&self) -> Option<&Arc<dyn LlmProvider>> {
        self.provider.as_ref()
    }

    /// Provider call options derived from the agent config.
    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            tools: self.config.tools.clone(),
        }
    }

    /// Call the bound provider. The agent's system prompt is prepended
    /// unless the conversation already starts with a system message.
    pub async fn chat(&self, mut messages: Vec<ChatMessage>) -> Result<ChatResponse> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            WeaveError::ProviderNotFound(format!("no provider bound to agent '{}'", self.config.name))
        })?;

        if let Some(prompt) = &self.config.system_prompt {
            if messages.first().map(|m| &m.role) != Some(&Role::System) {
                messages.insert(0, ChatMessage::system(prompt.clone()));
            }
        }

        let response = provider.chat(messages, &self.chat_options()).await?;
        self.record_usage(&response.token_usage);
        Ok(response)
    }

    /// Single-turn convenience around [`AgentContext::chat`].
    pub async fn prompt(&self, text: impl Into<String>) -> Result<String> {
        let response = self.chat(vec![ChatMessage::user(text)]).await?;
        Ok(response.content)
    }

    /// Add usage reported by a call made outside [`AgentContext::chat`].
    pub fn record_usage(&self, usage: &TokenUsage) {
        if let Ok(mut total) = self.usage.lock() {
            total.add(usage);
        }
    }

    /// Usage accumulated so far across every attempt.
    pub fn token_usage(&self) -> TokenUsage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }
}
