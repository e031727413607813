//! Running cost ledger with a hard budget ceiling.
//!
//! Prices are USD per million tokens. Cache writes bill at 1.25x the input
//! rate and cache reads at 0.10x. A [`CostTracker`] check-and-commit runs
//! under one lock, so concurrent settlements can never jointly overshoot the
//! ceiling.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BudgetExceeded;

const CACHE_WRITE_MULTIPLIER: f64 = 1.25;
const CACHE_READ_MULTIPLIER: f64 = 0.10;
const PER_MILLION: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPricing {
    const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }
}

// Matched by longest prefix so dated snapshots resolve to their family entry.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    ("claude-opus-4-6", ModelPricing::new(5.0, 25.0)),
    ("claude-opus-4-5", ModelPricing::new(5.0, 25.0)),
    ("claude-opus-4-1", ModelPricing::new(15.0, 75.0)),
    ("claude-opus-4", ModelPricing::new(15.0, 75.0)),
    ("claude-sonnet-4-5", ModelPricing::new(3.0, 15.0)),
    ("claude-sonnet-4", ModelPricing::new(3.0, 15.0)),
    ("claude-3-7-sonnet", ModelPricing::new(3.0, 15.0)),
    ("claude-haiku-4-5", ModelPricing::new(1.0, 5.0)),
    ("claude-3-5-haiku", ModelPricing::new(0.8, 4.0)),
];

/// Looks up pricing for `model`, falling back on the model family name and
/// finally on Sonnet pricing for anything unrecognised.
pub fn pricing_for(model: &str) -> ModelPricing {
    if let Some((_, pricing)) = PRICING_TABLE
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
    {
        return *pricing;
    }

    let lower = model.to_ascii_lowercase();
    if lower.contains("opus") {
        ModelPricing::new(15.0, 75.0)
    } else if lower.contains("haiku") {
        ModelPricing::new(1.0, 5.0)
    } else {
        debug!(model, "no pricing entry for model, using sonnet rates");
        ModelPricing::new(3.0, 15.0)
    }
}

/// Token counts reported for one API call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, creation: u64, read: u64) -> Self {
        self.cache_creation_tokens = creation;
        self.cache_read_tokens = read;
        self
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

fn compute_cost(model: &str, usage: &TokenUsage) -> f64 {
    let p = pricing_for(model);
    let input = usage.input_tokens as f64 * p.input_per_mtok;
    let cache_write = usage.cache_creation_tokens as f64 * p.input_per_mtok * CACHE_WRITE_MULTIPLIER;
    let cache_read = usage.cache_read_tokens as f64 * p.input_per_mtok * CACHE_READ_MULTIPLIER;
    let output = usage.output_tokens as f64 * p.output_per_mtok;
    (input + cache_write + cache_read + output) / PER_MILLION
}

fn cache_savings(model: &str, usage: &TokenUsage) -> f64 {
    let p = pricing_for(model);
    usage.cache_read_tokens as f64 * p.input_per_mtok * (1.0 - CACHE_READ_MULTIPLIER) / PER_MILLION
}

/// Accumulated usage for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost: f64,
    pub requests: u64,
}

/// Point-in-time copy of the ledger, used for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub api_calls: u64,
    pub max_cost: Option<f64>,
    pub cache_savings: f64,
    pub by_model: BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Default)]
struct Ledger {
    total_cost: f64,
    total_tokens: u64,
    api_calls: u64,
    cache_savings: f64,
    by_model: BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Default)]
pub struct CostTracker {
    max_cost: Option<f64>,
    ledger: Mutex<Ledger>,
}

impl CostTracker {
    /// Tracker with an optional ceiling; `None` means unlimited.
    pub fn new(max_cost: Option<f64>) -> Self {
        Self {
            max_cost,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn max_cost(&self) -> Option<f64> {
        self.max_cost
    }

    /// Records one call's usage and returns its cost.
    ///
    /// If the call would take the total past the ceiling nothing is recorded
    /// and [`BudgetExceeded`] is returned.
    pub fn record_usage(&self, model: &str, usage: &TokenUsage) -> Result<f64, BudgetExceeded> {
        let cost = compute_cost(model, usage);
        let mut ledger = self.lock();

        if let Some(limit) = self.max_cost
            && ledger.total_cost + cost > limit
        {
            warn!(
                model,
                cost,
                total = ledger.total_cost,
                limit,
                "usage rejected, budget ceiling reached"
            );
            return Err(BudgetExceeded {
                attempted: ledger.total_cost + cost,
                limit,
            });
        }

        ledger.total_cost += cost;
        ledger.total_tokens += usage.total();
        ledger.api_calls += 1;
        ledger.cache_savings += cache_savings(model, usage);

        let entry = ledger.by_model.entry(model.to_string()).or_default();
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.cache_creation_tokens += usage.cache_creation_tokens;
        entry.cache_read_tokens += usage.cache_read_tokens;
        entry.cost += cost;
        entry.requests += 1;

        debug!(model, cost, total = ledger.total_cost, "usage recorded");
        Ok(cost)
    }

    /// Same computation as [`record_usage`](Self::record_usage), without recording.
    pub fn estimate_cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        compute_cost(model, usage)
    }

    /// Remaining budget, or `None` when unlimited.
    pub fn remaining_budget(&self) -> Option<f64> {
        let spent = self.lock().total_cost;
        self.max_cost.map(|limit| (limit - spent).max(0.0))
    }

    pub fn total_cost(&self) -> f64 {
        self.lock().total_cost
    }

    pub fn total_tokens(&self) -> u64 {
        self.lock().total_tokens
    }

    /// What cache reads would have cost at the full input rate, minus what they did cost.
    pub fn estimated_cache_savings(&self) -> f64 {
        self.lock().cache_savings
    }

    pub fn model_usage(&self, model: &str) -> Option<ModelUsage> {
        self.lock().by_model.get(model).cloned()
    }

    pub fn summary(&self) -> CostSummary {
        let ledger = self.lock();
        CostSummary {
            total_cost: ledger.total_cost,
            total_tokens: ledger.total_tokens,
            api_calls: ledger.api_calls,
            max_cost: self.max_cost,
            cache_savings: ledger.cache_savings,
            by_model: ledger.by_model.clone(),
        }
    }

    pub fn reset(&self) {
        *self.lock() = Ledger::default();
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
