use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ModelPricingOverride, PricingConfig};

pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;
pub const BASELINE_MODEL: &str = "claude-sonnet-4-5";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_read_per_million: f64,
    pub cache_write_per_million: f64,
    pub context_window: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    Exact,
    Alias,
    Override,
    Family,
    #[default]
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TokenCostBreakdown {
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub cache_read_cost_usd: f64,
    pub cache_write_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostComputation {
    pub pricing: ModelPricing,
    pub source: PricingSource,
    pub resolved_model: String,
    pub breakdown: TokenCostBreakdown,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingResolution {
    pub pricing: ModelPricing,
    pub source: PricingSource,
    pub resolved_model: String,
}

/// Model price lookup: config overrides and aliases layered over the
/// built-in Claude catalog.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    config: PricingConfig,
}

impl PricingTable {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// Resolves in order: override, alias, exact catalog entry, longest
    /// catalog prefix or family name, then the baseline model.
    pub fn price_of(&self, model_id: &str) -> PricingResolution {
        let key = normalize_model_key(model_id);
        if key.is_empty() {
            return fallback_resolution();
        }

        if let Some(pricing) = lookup_override(&key, &self.config.overrides) {
            return PricingResolution {
                pricing,
                source: PricingSource::Override,
                resolved_model: key,
            };
        }

        if let Some(alias_target) = self
            .config
            .aliases
            .get(&key)
            .map(|target| normalize_model_key(target))
        {
            if let Some(pricing) = lookup_override(&alias_target, &self.config.overrides) {
                return PricingResolution {
                    pricing,
                    source: PricingSource::Override,
                    resolved_model: alias_target,
                };
            }
            if let Some(pricing) = default_model_pricing(&alias_target) {
                return PricingResolution {
                    pricing,
                    source: PricingSource::Alias,
                    resolved_model: alias_target,
                };
            }
        }

        if let Some(pricing) = default_model_pricing(&key) {
            return PricingResolution {
                pricing,
                source: PricingSource::Exact,
                resolved_model: key,
            };
        }

        if let Some(family) = family_target(&key)
            && let Some(pricing) = default_model_pricing(family)
        {
            return PricingResolution {
                pricing,
                source: PricingSource::Family,
                resolved_model: family.to_string(),
            };
        }

        fallback_resolution()
    }
}

/// Prices one batch of tokens. Pure: identical inputs give identical output.
pub fn compute_cost(
    model_id: &str,
    input_tokens: u64,
    output_tokens: u64,
    cache_read_tokens: u64,
    cache_creation_tokens: u64,
    table: &PricingTable,
) -> CostComputation {
    let resolved = table.price_of(model_id);
    let pricing = resolved.pricing;

    let breakdown = TokenCostBreakdown {
        input_cost_usd: per_million(input_tokens, pricing.input_per_million),
        output_cost_usd: per_million(output_tokens, pricing.output_per_million),
        cache_read_cost_usd: per_million(cache_read_tokens, pricing.cache_read_per_million),
        cache_write_cost_usd: per_million(cache_creation_tokens, pricing.cache_write_per_million),
    };
    let total_cost_usd = breakdown.input_cost_usd
        + breakdown.output_cost_usd
        + breakdown.cache_read_cost_usd
        + breakdown.cache_write_cost_usd;

    CostComputation {
        pricing,
        source: resolved.source,
        resolved_model: resolved.resolved_model,
        breakdown,
        total_cost_usd,
    }
}

/// Share of the context window in use, as a percentage in `[0, 100]`.
pub fn context_percent(total_tokens: u64, context_window: u64) -> f64 {
    if context_window == 0 {
        return 0.0;
    }
    (total_tokens as f64 / context_window as f64 * 100.0).clamp(0.0, 100.0)
}

fn per_million(tokens: u64, price: f64) -> f64 {
    (tokens as f64 / 1_000_000.0) * price
}

fn lookup_override(
    model_key: &str,
    overrides: &BTreeMap<String, ModelPricingOverride>,
) -> Option<ModelPricing> {
    let entry = overrides.get(model_key)?;
    if !entry.input_per_million.is_finite() || entry.input_per_million < 0.0 {
        return None;
    }
    if !entry.output_per_million.is_finite() || entry.output_per_million < 0.0 {
        return None;
    }

    let base = default_model_pricing(model_key).unwrap_or_else(baseline_pricing);
    Some(ModelPricing {
        input_per_million: entry.input_per_million,
        output_per_million: entry.output_per_million,
        cache_read_per_million: non_negative_or(
            entry.cache_read_per_million,
            base.cache_read_per_million,
        ),
        cache_write_per_million: non_negative_or(
            entry.cache_write_per_million,
            base.cache_write_per_million,
        ),
        context_window: entry
            .context_window
            .filter(|window| *window > 0)
            .unwrap_or(base.context_window),
    })
}

fn non_negative_or(value: Option<f64>, default: f64) -> f64 {
    value
        .filter(|price| price.is_finite() && *price >= 0.0)
        .unwrap_or(default)
}

/// Lower-cases and drops a trailing `-YYYYMMDD` release date.
pub fn normalize_model_key(model: &str) -> String {
    let key = model.trim().to_ascii_lowercase();
    match key.rsplit_once('-') {
        Some((head, date)) if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) => {
            head.to_string()
        }
        _ => key,
    }
}

fn fallback_resolution() -> PricingResolution {
    PricingResolution {
        pricing: baseline_pricing(),
        source: PricingSource::Fallback,
        resolved_model: BASELINE_MODEL.to_string(),
    }
}

fn baseline_pricing() -> ModelPricing {
    ModelPricing {
        input_per_million: 3.0,
        output_per_million: 15.0,
        cache_read_per_million: 0.3,
        cache_write_per_million: 3.75,
        context_window: DEFAULT_CONTEXT_WINDOW,
    }
}

const CATALOG_KEYS: &[&str] = &[
    "claude-opus-4-5",
    "claude-opus-4-1",
    "claude-opus-4",
    "claude-sonnet-4-5",
    "claude-sonnet-4",
    "claude-3-7-sonnet",
    "claude-3-5-sonnet",
    "claude-haiku-4-5",
    "claude-3-5-haiku",
    "claude-3-opus",
    "claude-3-haiku",
];

fn family_target(model: &str) -> Option<&'static str> {
    let by_prefix = CATALOG_KEYS
        .iter()
        .filter(|candidate| model.starts_with(*candidate))
        .max_by_key(|candidate| candidate.len());
    if let Some(candidate) = by_prefix {
        return Some(candidate);
    }

    if model.contains("opus") {
        Some("claude-opus-4-1")
    } else if model.contains("haiku") {
        Some("claude-haiku-4-5")
    } else if model.contains("sonnet") {
        Some(BASELINE_MODEL)
    } else {
        None
    }
}

fn default_model_pricing(model: &str) -> Option<ModelPricing> {
    let (input, output, cache_read, cache_write) = match model {
        "claude-opus-4-5" => (5.0, 25.0, 0.5, 6.25),
        "claude-opus-4-1" | "claude-opus-4" | "claude-3-opus" => (15.0, 75.0, 1.5, 18.75),
        "claude-sonnet-4-5" | "claude-sonnet-4" | "claude-3-7-sonnet" | "claude-3-5-sonnet" => {
            (3.0, 15.0, 0.3, 3.75)
        }
        "claude-haiku-4-5" => (1.0, 5.0, 0.1, 1.25),
        "claude-3-5-haiku" => (0.8, 4.0, 0.08, 1.0),
        "claude-3-haiku" => (0.25, 1.25, 0.03, 0.3),
        _ => return None,
    };

    Some(ModelPricing {
        input_per_million: input,
        output_per_million: output,
        cache_read_per_million: cache_read,
        cache_write_per_million: cache_write,
        context_window: DEFAULT_CONTEXT_WINDOW,
    })
}
