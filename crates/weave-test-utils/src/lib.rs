//! Mocks and fixtures shared by Weave tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use weave_core::config::AgentConfig;
use weave_core::context::{agent_logic, AgentContext, AgentLogic};
use weave_core::error::{Result, WeaveError};
use weave_core::traits::LlmProvider;
use weave_core::types::{ChatMessage, ChatOptions, ChatResponse, FinishReason, TokenUsage};

/// Agent config with the shortest allowed timeout and no retries.
pub fn test_config(name: &str) -> AgentConfig {
    AgentConfig::new(name).with_max_retries(0).with_timeout_ms(1_000)
}

/// Returns the execution input unchanged.
pub fn echo_logic() -> AgentLogic {
    agent_logic(|ctx: AgentContext| async move { Ok(ctx.input) })
}

/// Always returns `value`.
pub fn constant_logic(value: serde_json::Value) -> AgentLogic {
    agent_logic(move |_ctx: AgentContext| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

/// Always fails, counting attempts.
pub fn failing_logic(attempts: Arc<AtomicU32>) -> AgentLogic {
    agent_logic(move |_ctx: AgentContext| {
        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Err(WeaveError::Execution(format!("attempt {} failed", n))) }
    })
}

/// Fails the first `failures` attempts, then returns `value`.
pub fn flaky_logic(failures: u32, attempts: Arc<AtomicU32>, value: serde_json::Value) -> AgentLogic {
    agent_logic(move |_ctx: AgentContext| {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        async move {
            if n < failures {
                Err(WeaveError::Execution(format!("transient failure {}", n + 1)))
            } else {
                Ok(value)
            }
        }
    })
}

/// Sleeps for `ms` before returning `value`.
pub fn sleeping_logic(ms: u64, value: serde_json::Value) -> AgentLogic {
    agent_logic(move |_ctx: AgentContext| {
        let value = value.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(value)
        }
    })
}

/// Never settles.
pub fn pending_logic() -> AgentLogic {
    agent_logic(|_ctx: AgentContext| futures::future::pending())
}

/// Start/end instants of one logic invocation.
#[derive(Debug, Clone)]
pub struct Span {
    pub name: String,
    pub input: serde_json::Value,
    pub started: Instant,
    pub ended: Instant,
}

/// Shared log of [`Span`]s written by [`timed_logic`].
#[derive(Debug, Clone, Default)]
pub struct SpanLog(Arc<Mutex<Vec<Span>>>);

impl SpanLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.0.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<Span> {
        self.spans().into_iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.spans().into_iter().map(|s| s.name).collect()
    }
}

/// Sleeps `ms`, records its span under `name`, returns `value`.
pub fn timed_logic(log: SpanLog, name: &str, ms: u64, value: serde_json::Value) -> AgentLogic {
    let name = name.to_string();
    agent_logic(move |ctx: AgentContext| {
        let log = log.clone();
        let name = name.clone();
        let value = value.clone();
        async move {
            let started = Instant::now();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let ended = Instant::now();
            if let Ok(mut spans) = log.0.lock() {
                spans.push(Span {
                    name,
                    input: ctx.input,
                    started,
                    ended,
                });
            }
            Ok(value)
        }
    })
}

/// A recorded provider call.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub messages: Vec<ChatMessage>,
    pub options: ChatOptions,
}

/// Scripted LLM provider.
///
/// Replies are popped in order; once the script is empty every call gets
/// `fallback` text with `usage`.
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<Result<ChatResponse>>>,
    calls: Mutex<Vec<ProviderCall>>,
    fallback: String,
    usage: TokenUsage,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            fallback: "ok".to_string(),
            usage: TokenUsage::new(100, 50),
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = TokenUsage::new(prompt_tokens, completion_tokens);
        self
    }

    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = text.to_string();
        self
    }

    pub fn push_text(&self, text: &str) {
        let reply = Self::text_response(text, self.usage);
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(reply));
        }
    }

    pub fn push_error(&self, error: WeaveError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn text_response(text: &str, usage: TokenUsage) -> ChatResponse {
        ChatResponse {
            content: text.to_string(),
            tool_calls: None,
            token_usage: usage,
            finish_reason: FinishReason::Stop,
        }
    }
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> BoxFuture<'_, Result<ChatResponse>> {
        let options = options.clone();
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(ProviderCall { messages, options });
            }
            let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
            match scripted {
                Some(reply) => reply,
                None => Ok(Self::text_response(&self.fallback, self.usage)),
            }
        })
    }
}

/// Agent logic that sends the input (as text) to the bound provider.
pub fn provider_logic() -> AgentLogic {
    agent_logic(|ctx: AgentContext| async move {
        let text = match &ctx.input {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let reply = ctx.prompt(text).await?;
        Ok(serde_json::Value::String(reply))
    })
}

/// Fresh temp directory for on-disk fixtures.
pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}
