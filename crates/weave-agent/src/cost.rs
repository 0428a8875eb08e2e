use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use weave_core::config::AgentConfig;
use weave_core::error::Result;
use weave_core::traits::ExecutionStore;
use weave_core::types::{CostFilter, TokenUsage};

use crate::pricing::{PricingTable, CURRENCY};
use crate::runtime::AgentRuntime;
use crate::workflow::{WorkflowDefinition, WorkflowStep};

/// Cost records averaged per agent when history exists.
pub const HISTORY_WINDOW: usize = 10;
/// Heuristic floor for prompt tokens.
pub const MIN_PROMPT_TOKENS: u64 = 1000;
/// Heuristic completion tokens when the agent sets no `max_tokens`.
pub const DEFAULT_COMPLETION_TOKENS: u64 = 500;

/// How far an estimate can be trusted. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateSource {
    Historical,
    Heuristic,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepCostEstimate {
    pub step_id: String,
    pub agent_name: String,
    pub model: String,
    pub token_usage: TokenUsage,
    pub cost: f64,
    pub confidence: Confidence,
    pub source: EstimateSource,
}

/// Read-only prediction of a workflow's cost.
#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub workflow: String,
    pub steps: Vec<StepCostEstimate>,
    pub total_cost: f64,
    pub total_tokens: TokenUsage,
    pub currency: String,
    /// Lowest confidence of any step.
    pub confidence: Confidence,
    /// `Historical` when at least one step used recorded usage.
    pub source: EstimateSource,
    pub estimated_at: DateTime<Utc>,
}

/// Predicts workflow cost from recorded usage, or from agent config when
/// there is none. Never calls a provider and never writes to the store.
pub struct CostEstimator {
    runtime: Arc<AgentRuntime>,
    store: Option<Arc<dyn ExecutionStore>>,
    pricing: Arc<PricingTable>,
}

impl CostEstimator {
    pub fn new(runtime: Arc<AgentRuntime>, pricing: Arc<PricingTable>) -> Self {
        Self {
            runtime,
            store: None,
            pricing,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Estimate every step of `definition`, including conditional ones.
    ///
    /// `input` is accepted for interface symmetry with execution; token
    /// counts do not depend on it.
    pub async fn estimate_workflow_cost(
        &self,
        definition: &WorkflowDefinition,
        _input: &serde_json::Value,
    ) -> Result<CostEstimate> {
        definition.validate()?;

        let mut steps = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            steps.push(self.estimate_step(step).await);
        }

        let total_cost = steps.iter().map(|s| s.cost).sum();
        let mut total_tokens = TokenUsage::default();
        for step in &steps {
            total_tokens.add(&step.token_usage);
        }
        let confidence = steps
            .iter()
            .map(|s| s.confidence)
            .min()
            .unwrap_or(Confidence::Low);
        let source = if steps.iter().any(|s| s.source == EstimateSource::Historical) {
            EstimateSource::Historical
        } else {
            EstimateSource::Heuristic
        };

        debug!(
            workflow = %definition.name,
            total_cost,
            total_tokens = total_tokens.total_tokens,
            confidence = ?confidence,
            "Workflow cost estimated"
        );

        Ok(CostEstimate {
            workflow: definition.name.clone(),
            steps,
            total_cost,
            total_tokens,
            currency: CURRENCY.to_string(),
            confidence,
            source,
            estimated_at: Utc::now(),
        })
    }

    async fn estimate_step(&self, step: &WorkflowStep) -> StepCostEstimate {
        let agent = self.runtime.get_agent_by_name(&step.agent);
        let (config, resolved) = match &agent {
            Some(agent) => (agent.config().clone(), true),
            None => {
                debug!(step_id = %step.id, agent = %step.agent, "Agent not registered, estimating from defaults");
                (AgentConfig::new(step.agent.clone()), false)
            }
        };

        let history = match &agent {
            Some(agent) => self.average_usage(agent.id()).await,
            None => None,
        };

        let (token_usage, confidence, source) = match history {
            Some(usage) => (usage, Confidence::High, EstimateSource::Historical),
            None => {
                let confidence = if resolved {
                    Confidence::Medium
                } else {
                    Confidence::Low
                };
                (heuristic_usage(&config), confidence, EstimateSource::Heuristic)
            }
        };

        StepCostEstimate {
            step_id: step.id.clone(),
            agent_name: step.agent.clone(),
            cost: self.pricing.cost_for(&config.model, &token_usage),
            model: config.model,
            token_usage,
            confidence,
            source,
        }
    }

    /// Mean usage over the agent's most recent cost records, if any.
    async fn average_usage(&self, agent_id: &weave_core::types::AgentId) -> Option<TokenUsage> {
        let store = self.store.as_ref()?;
        let filter = CostFilter::for_agent(agent_id).with_limit(HISTORY_WINDOW);
        let page = match store.get_costs(filter).await {
            Ok(page) => page,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Cost history unavailable, using heuristic");
                return None;
            }
        };
        if page.items.is_empty() {
            return None;
        }

        let n = page.items.len() as u64;
        let prompt: u64 = page.items.iter().map(|r| r.prompt_tokens).sum();
        let completion: u64 = page.items.iter().map(|r| r.completion_tokens).sum();
        Some(TokenUsage::new(prompt / n, completion / n))
    }
}

/// `max(1000, system_prompt_chars / 4)` prompt tokens and `max_tokens`
/// (or 500) completion tokens.
pub fn heuristic_usage(config: &AgentConfig) -> TokenUsage {
    let prompt_chars = config
        .system_prompt
        .as_deref()
        .map_or(0, |p| p.chars().count() as u64);
    let prompt_tokens = (prompt_chars / 4).max(MIN_PROMPT_TOKENS);
    let completion_tokens = config
        .max_tokens
        .map_or(DEFAULT_COMPLETION_TOKENS, u64::from);
    TokenUsage::new(prompt_tokens, completion_tokens)
}
