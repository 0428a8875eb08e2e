use std::collections::HashMap;

use serde::Serialize;

use weave_core::types::TokenUsage;

pub const CURRENCY: &str = "USD";

/// Rates in USD per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub const FREE: ModelPricing = ModelPricing {
        input_per_1k: 0.0,
        output_per_1k: 0.0,
    };

    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.input_per_1k
            + completion_tokens as f64 / 1000.0 * self.output_per_1k
    }
}

#[derive(Debug, Clone)]
struct ProviderPricing {
    default_model: String,
    models: HashMap<String, ModelPricing>,
}

/// Static price list keyed by provider and model id.
///
/// Lookup falls back from the exact model to the provider's default model,
/// then to zero cost for local or unrecognized models.
#[derive(Debug, Clone)]
pub struct PricingTable {
    providers: HashMap<String, ProviderPricing>,
}

const BUILTIN: &[(&str, &str, ModelPricing)] = &[
    ("openai", "gpt-4o", ModelPricing::new(0.0025, 0.01)),
    ("openai", "gpt-4o-mini", ModelPricing::new(0.00015, 0.0006)),
    ("openai", "gpt-4-turbo", ModelPricing::new(0.01, 0.03)),
    ("openai", "gpt-4", ModelPricing::new(0.03, 0.06)),
    ("openai", "gpt-3.5-turbo", ModelPricing::new(0.0005, 0.0015)),
    ("openai", "o1", ModelPricing::new(0.015, 0.06)),
    ("openai", "o1-mini", ModelPricing::new(0.003, 0.012)),
    ("openai", "o3-mini", ModelPricing::new(0.0011, 0.0044)),
    ("anthropic", "claude-3-5-sonnet", ModelPricing::new(0.003, 0.015)),
    ("anthropic", "claude-3-5-haiku", ModelPricing::new(0.0008, 0.004)),
    ("anthropic", "claude-3-opus", ModelPricing::new(0.015, 0.075)),
    ("anthropic", "claude-3-sonnet", ModelPricing::new(0.003, 0.015)),
    ("anthropic", "claude-3-haiku", ModelPricing::new(0.00025, 0.00125)),
    ("google", "gemini-1.5-pro", ModelPricing::new(0.00125, 0.005)),
    ("google", "gemini-1.5-flash", ModelPricing::new(0.000075, 0.0003)),
    ("google", "gemini-2.0-flash", ModelPricing::new(0.0001, 0.0004)),
];

const DEFAULT_MODELS: &[(&str, &str)] = &[
    ("openai", "gpt-4o"),
    ("anthropic", "claude-3-5-sonnet"),
    ("google", "gemini-1.5-pro"),
];

/// Provider that serves `model`, inferred from its id.
pub fn infer_provider(model: &str) -> Option<&'static str> {
    let model = model.to_ascii_lowercase();
    if model.starts_with("gpt-")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
        || model.starts_with("chatgpt")
    {
        Some("openai")
    } else if model.starts_with("claude") {
        Some("anthropic")
    } else if model.starts_with("gemini") {
        Some("google")
    } else {
        None
    }
}

impl PricingTable {
    /// A table with no prices; every model costs nothing.
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Set the price of a model, registering the provider if needed.
    /// The first model registered for a provider becomes its default.
    pub fn insert(&mut self, provider: &str, model: &str, pricing: ModelPricing) {
        let entry = self
            .providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderPricing {
                default_model: model.to_string(),
                models: HashMap::new(),
            });
        entry.models.insert(model.to_string(), pricing);
    }

    /// Choose the model whose rates unlisted models of `provider` use.
    pub fn set_default_model(&mut self, provider: &str, model: &str) {
        if let Some(entry) = self.providers.get_mut(provider) {
            entry.default_model = model.to_string();
        }
    }

    /// Rates for `model`, with the provider they were resolved under.
    pub fn lookup(&self, model: &str) -> Option<(&'static str, ModelPricing)> {
        let provider = infer_provider(model)?;
        let entry = self.providers.get(provider)?;
        entry
            .models
            .get(model)
            .or_else(|| entry.models.get(&entry.default_model))
            .map(|pricing| (provider, *pricing))
    }

    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.lookup(model)
            .map(|(_, pricing)| pricing)
            .unwrap_or(ModelPricing::FREE)
    }

    /// Provider name recorded with costs for `model`.
    pub fn provider_name(&self, model: &str) -> &'static str {
        infer_provider(model).unwrap_or("local")
    }

    pub fn cost_for(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.pricing_for(model)
            .cost(usage.prompt_tokens, usage.completion_tokens)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for (provider, model, pricing) in BUILTIN {
            table.insert(provider, model, *pricing);
        }
        for (provider, model) in DEFAULT_MODELS {
            table.set_default_model(provider, model);
        }
        table
    }
}
