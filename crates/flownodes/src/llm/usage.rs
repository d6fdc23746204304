use super::providers::TokenUsage;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// USD per 1K tokens as (input, output).
const RATES: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("gpt-4o", 0.0025, 0.01),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-4", 0.03, 0.06),
    ("gpt-3.5-turbo", 0.0005, 0.0015),
    ("claude-3-5-sonnet", 0.003, 0.015),
    ("claude-3-5-haiku", 0.0008, 0.004),
    ("claude-3-opus", 0.015, 0.075),
    ("claude-3-haiku", 0.00025, 0.00125),
];

const DEFAULT_RATE: (f64, f64) = (0.001, 0.002);

/// Rate for `model`: exact name, else the longest known prefix, else the default.
pub fn rate_for(model: &str) -> (f64, f64) {
    RATES
        .iter()
        .filter(|(name, _, _)| model == *name || model.starts_with(name))
        .max_by_key(|(name, _, _)| name.len())
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or(DEFAULT_RATE)
}

pub fn estimate_cost(model: &str, usage: &TokenUsage) -> f64 {
    let (input_rate, output_rate) = rate_for(model);
    let cost = (usage.prompt_tokens as f64 / 1000.0) * input_rate
        + (usage.completion_tokens as f64 / 1000.0) * output_rate;
    (cost * 1_000_000.0).round() / 1_000_000.0
}

/// Running totals for one (user, model) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
    pub estimated_cost: f64,
    pub rate_limit_hits: u64,
}

/// Token accounting port. The in-memory ledger suits one process; a shared
/// deployment swaps in an external store.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record_usage(&self, user_id: &str, model: &str, usage: &TokenUsage, cost: f64);

    async fn record_rate_limit(&self, user_id: &str, model: &str);

    async fn totals(&self, user_id: &str, model: &str) -> UsageTotals;
}

#[derive(Default)]
pub struct InMemoryUsageLedger {
    totals: Mutex<HashMap<(String, String), UsageTotals>>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn record_usage(&self, user_id: &str, model: &str, usage: &TokenUsage, cost: f64) {
        let mut totals = self.totals.lock().await;
        let entry = totals
            .entry((user_id.to_string(), model.to_string()))
            .or_default();
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        entry.total_tokens += usage.total_tokens;
        entry.requests += 1;
        entry.estimated_cost += cost;
    }

    async fn record_rate_limit(&self, user_id: &str, model: &str) {
        let mut totals = self.totals.lock().await;
        totals
            .entry((user_id.to_string(), model.to_string()))
            .or_default()
            .rate_limit_hits += 1;
    }

    async fn totals(&self, user_id: &str, model: &str) -> UsageTotals {
        self.totals
            .lock()
            .await
            .get(&(user_id.to_string(), model.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        assert_eq!(rate_for("gpt-4o-mini-2024-07-18"), (0.00015, 0.0006));
        assert_eq!(rate_for("gpt-4o-2024-08-06"), (0.0025, 0.01));
        assert_eq!(rate_for("llama3"), DEFAULT_RATE);
    }

    #[test]
    fn cost_is_rounded_to_six_decimals() {
        let usage = TokenUsage::new(1234, 567);
        // 1.234 * 0.03 + 0.567 * 0.06 = 0.03702 + 0.03402
        assert_eq!(estimate_cost("gpt-4", &usage), 0.07104);
        let usage = TokenUsage::new(1, 1);
        // 0.000001 + 0.000002 (default rate)
        assert_eq!(estimate_cost("unknown-model", &usage), 0.000003);
    }
}
