//! Per-model token prices and cost computation.

use std::collections::HashMap;

use crate::config::Config;
use crate::usage::TokenUsage;

const PER_MILLION: f64 = 1_000_000.0;

/// Prices for one logical model, in USD per token.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingEntry {
    pub model: String,
    pub provider: String,
    pub prompt_price: f64,
    pub completion_price: f64,
    pub context_length: Option<u32>,
}

impl PricingEntry {
    /// Prompt price in USD per million tokens, as configured.
    pub fn prompt_per_million(&self) -> f64 {
        self.prompt_price * PER_MILLION
    }

    /// Completion price in USD per million tokens, as configured.
    pub fn completion_per_million(&self) -> f64 {
        self.completion_price * PER_MILLION
    }
}

/// Cost of one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost {
    pub amount: f64,
    /// False when no pricing entry matched; `amount` is then 0.
    pub priced: bool,
}

impl Cost {
    pub const UNPRICED: Cost = Cost {
        amount: 0.0,
        priced: false,
    };
}

/// Immutable model -> price mapping.
///
/// Tables are built whole from configuration and never edited in place.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, PricingEntry>,
}

impl PricingTable {
    pub fn from_entries(entries: impl IntoIterator<Item = PricingEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.model.clone(), e))
                .collect(),
        }
    }

    /// Build the table from every model that declares both prices.
    pub fn from_config(config: &Config) -> Self {
        Self::from_entries(config.models.iter().filter_map(|m| {
            let prompt = m.prompt_price_per_million?;
            let completion = m.completion_price_per_million?;
            Some(PricingEntry {
                model: m.name.clone(),
                provider: m.provider.clone(),
                prompt_price: prompt / PER_MILLION,
                completion_price: completion / PER_MILLION,
                context_length: m.context_length,
            })
        }))
    }

    pub fn get(&self, model: &str) -> Option<&PricingEntry> {
        self.entries.get(model)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `prompt_tokens * prompt_price + completion_tokens * completion_price`.
    pub fn cost(&self, model: &str, usage: TokenUsage) -> Cost {
        match self.get(model) {
            Some(entry) => Cost {
                amount: f64::from(usage.prompt_tokens) * entry.prompt_price
                    + f64::from(usage.completion_tokens) * entry.completion_price,
                priced: true,
            },
            None => Cost::UNPRICED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        PricingTable::from_entries([PricingEntry {
            model: "gpt-4o-mini".to_string(),
            provider: "openai".to_string(),
            prompt_price: 0.15 / PER_MILLION,
            completion_price: 0.60 / PER_MILLION,
            context_length: Some(128_000),
        }])
    }

    #[test]
    fn test_cost_per_million_pricing() {
        let cost = table().cost("gpt-4o-mini", TokenUsage::new(100, 50));
        assert!(cost.priced);
        assert!(
            (cost.amount - 0.000045).abs() < 1e-12,
            "expected 0.000045, got {}",
            cost.amount
        );
    }

    #[test]
    fn test_unpriced_model_costs_zero() {
        let cost = table().cost("mystery", TokenUsage::new(1000, 1000));
        assert_eq!(cost, Cost::UNPRICED);
    }

    #[test]
    fn test_zero_tokens_zero_cost() {
        let cost = table().cost("gpt-4o-mini", TokenUsage::default());
        assert!(cost.priced);
        assert_eq!(cost.amount, 0.0);
    }

    #[test]
    fn test_per_million_round_trip() {
        let t = table();
        let entry = t.get("gpt-4o-mini").unwrap();
        assert!((entry.prompt_per_million() - 0.15).abs() < 1e-9);
        assert!((entry.completion_per_million() - 0.60).abs() < 1e-9);
    }
}
