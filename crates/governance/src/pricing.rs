//! Provider/model rate table.

use rust_decimal::Decimal;
use std::collections::HashMap;

use sandflow_core::ModelRate;

/// Rates keyed by `(provider, model)`.
///
/// Immutable once handed to the [`CostTracker`](crate::CostTracker); a new
/// table replaces the old one wholesale.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    rates: HashMap<(String, String), ModelRate>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a list; later entries override earlier ones.
    pub fn from_rates(rates: impl IntoIterator<Item = ModelRate>) -> Self {
        let mut table = Self::new();
        for rate in rates {
            table.insert(rate);
        }
        table
    }

    /// Create with default OpenAI/Anthropic pricing (USD per million tokens).
    pub fn with_defaults() -> Self {
        Self::from_rates([
            ModelRate::new("openai", "gpt-4o-mini", Decimal::new(15, 2), Decimal::new(60, 2)),
            ModelRate::new("openai", "gpt-4o", Decimal::new(250, 2), Decimal::new(1000, 2)),
            ModelRate::new("openai", "gpt-4-turbo", Decimal::new(1000, 2), Decimal::new(3000, 2)),
            ModelRate::new("anthropic", "claude-3-haiku", Decimal::new(25, 2), Decimal::new(125, 2)),
            ModelRate::new("anthropic", "claude-sonnet", Decimal::new(300, 2), Decimal::new(1500, 2)),
        ])
    }

    pub fn insert(&mut self, rate: ModelRate) {
        self.rates
            .insert((rate.provider.clone(), rate.model.clone()), rate);
    }

    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelRate> {
        self.rates.get(&(provider.to_string(), model.to_string()))
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// All rates, cheapest combined price first.
    pub fn sorted_by_cost(&self) -> Vec<&ModelRate> {
        let mut rates: Vec<_> = self.rates.values().collect();
        rates.sort_by(|a, b| {
            (a.input_per_million + a.output_per_million)
                .cmp(&(b.input_per_million + b.output_per_million))
        });
        rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_lookup_and_override() {
        let mut table = RateTable::with_defaults();
        assert!(table.get("openai", "gpt-4o").is_some());
        assert!(table.get("openai", "gpt-5").is_none());

        table.insert(ModelRate::new("openai", "gpt-4o", dec!(1), dec!(2)));
        assert_eq!(table.get("openai", "gpt-4o").unwrap().output_per_million, dec!(2));
    }

    #[test]
    fn test_sorted_by_cost() {
        let table = RateTable::with_defaults();
        let sorted = table.sorted_by_cost();
        assert_eq!(sorted.len(), table.len());
        assert_eq!(sorted[0].model, "gpt-4o-mini");
    }
}
