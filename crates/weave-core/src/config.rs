use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeaveError};

/// Top-level Weave configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub queue: Option<QueueConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Configuration of a single agent. Validated when an agent is built and
/// never changed afterwards; a reload constructs a replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_agent_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Named provider binding; the runtime default is used when unset.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

pub const MIN_TIMEOUT_MS: u64 = 1000;

fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_agent_max_retries() -> u32 { 3 }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_temperature() -> f32 { 0.7 }

impl AgentConfig {
    /// Create a config with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: default_model(),
            system_prompt: None,
            max_retries: default_agent_max_retries(),
            timeout_ms: default_timeout_ms(),
            temperature: default_temperature(),
            max_tokens: None,
            tools: vec![],
            provider: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check the invariants every agent config must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WeaveError::InvalidAgentConfig("name must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(WeaveError::InvalidAgentConfig(format!(
                "agent '{}': model must not be empty",
                self.name
            )));
        }
        if self.timeout_ms < MIN_TIMEOUT_MS {
            return Err(WeaveError::InvalidAgentConfig(format!(
                "agent '{}': timeout must be at least {}ms (got {})",
                self.name, MIN_TIMEOUT_MS, self.timeout_ms
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(WeaveError::InvalidAgentConfig(format!(
                "agent '{}': temperature must be within 0..=2 (got {})",
                self.name, self.temperature
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(WeaveError::InvalidAgentConfig(format!(
                "agent '{}': max_tokens must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Agent runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Ceiling on concurrently in-flight executions across all agents.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Capacity of the event bus broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent(),
            default_provider: None,
            backoff: BackoffConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_concurrent() -> usize { 10 }
fn default_event_capacity() -> usize { 256 }

/// Backoff between retry attempts of an agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Upper bound of the random jitter, as a fraction of the delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30_000 }
fn default_jitter_ratio() -> f64 { 0.3 }

/// Durable task queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// SQLite database holding the shared job store.
    #[serde(default = "default_queue_database")]
    pub database: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Jobs processed concurrently by the consumer.
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,
    /// How long a claimed job stays locked before another worker may
    /// take it over.
    #[serde(default = "default_lock_duration")]
    pub lock_duration_ms: u64,
    #[serde(default)]
    pub default_job_options: JobOptions,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            database: default_queue_database(),
            poll_interval_ms: default_poll_interval(),
            concurrency: default_queue_concurrency(),
            lock_duration_ms: default_lock_duration(),
            default_job_options: JobOptions::default(),
        }
    }
}

impl QueueConfig {
    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.database)
    }
}

fn default_queue_name() -> String { "weave-tasks".to_string() }
fn default_queue_database() -> String { "~/.weave/queue.db".to_string() }
fn default_poll_interval() -> u64 { 250 }
fn default_queue_concurrency() -> usize { 1 }
fn default_lock_duration() -> u64 { 300_000 }

/// Per-job retry and retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total processing attempts, including the first.
    #[serde(default = "default_job_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: JobBackoff,
    /// Completed job records to keep.
    #[serde(default = "default_remove_on_complete")]
    pub remove_on_complete: usize,
    /// Failed job records to keep.
    #[serde(default = "default_remove_on_fail")]
    pub remove_on_fail: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: default_job_attempts(),
            backoff: JobBackoff::default(),
            remove_on_complete: default_remove_on_complete(),
            remove_on_fail: default_remove_on_fail(),
        }
    }
}

fn default_job_attempts() -> u32 { 3 }
fn default_remove_on_complete() -> usize { 100 }
fn default_remove_on_fail() -> usize { 500 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Fixed,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Exponential => "exponential",
            BackoffKind::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "fixed" => BackoffKind::Fixed,
            _ => BackoffKind::Exponential,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBackoff {
    #[serde(default)]
    pub kind: BackoffKind,
    #[serde(default = "default_job_backoff_delay")]
    pub delay_ms: u64,
}

impl Default for JobBackoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::default(),
            delay_ms: default_job_backoff_delay(),
        }
    }
}

fn default_job_backoff_delay() -> u64 { 1000 }

impl JobBackoff {
    /// Delay before the retry that follows `attempts_made` failed attempts.
    pub fn delay_for(&self, attempts_made: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let exp = attempts_made.saturating_sub(1).min(32);
                self.delay_ms.saturating_mul(1u64 << exp)
            }
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaveError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| WeaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtime.max_concurrent_executions == 0 {
            return Err(WeaveError::Config(
                "runtime.max_concurrent_executions must be positive".into(),
            ));
        }
        if let Some(queue) = &self.queue {
            if queue.name.trim().is_empty() {
                return Err(WeaveError::Config("queue.name must not be empty".into()));
            }
            if queue.default_job_options.attempts == 0 {
                return Err(WeaveError::Config(
                    "queue.default_job_options.attempts must be at least 1".into(),
                ));
            }
        }
        for agent in &self.agents {
            agent.validate()?;
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
