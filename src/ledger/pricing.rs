//! Per-(provider, model) pricing rows and the builtin pricing table.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{Provider, TokenCounts};

/// Pricing for one model: USD per 1k input and output tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub provider: Provider,
    pub model: String,
    pub input_per_1k: Decimal,
    pub output_per_1k: Decimal,
}

/// USD cost of one call, split by direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_usd: Decimal,
    pub output_usd: Decimal,
    pub total_usd: Decimal,
}

impl ModelPricing {
    pub fn new(
        provider: Provider,
        model: impl Into<String>,
        input_per_1k: Decimal,
        output_per_1k: Decimal,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, counts: &TokenCounts) -> CostBreakdown {
        let per_1k = dec!(1000);
        let input_usd = Decimal::from(counts.input_tokens) / per_1k * self.input_per_1k;
        let output_usd = Decimal::from(counts.output_tokens) / per_1k * self.output_per_1k;
        CostBreakdown {
            input_usd,
            output_usd,
            total_usd: input_usd + output_usd,
        }
    }
}

/// In-memory pricing lookup keyed by (provider, model).
///
/// There is deliberately no default row: settlement against a model with
/// no pricing must fail loudly, never charge a guess.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    rows: HashMap<(Provider, String), ModelPricing>,
}

impl PricingTable {
    pub fn builder() -> PricingTableBuilder {
        PricingTableBuilder::default()
    }

    /// Table with published rates for the commonly served models.
    pub fn builtin() -> Self {
        Self::builder().with_defaults().build()
    }

    pub fn get(&self, model: &str, provider: Provider) -> Option<&ModelPricing> {
        self.rows.get(&(provider, model.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct PricingTableBuilder {
    rows: HashMap<(Provider, String), ModelPricing>,
}

impl PricingTableBuilder {
    pub fn model(
        mut self,
        provider: Provider,
        model: &str,
        input_per_1k: Decimal,
        output_per_1k: Decimal,
    ) -> Self {
        self.rows.insert(
            (provider, model.to_string()),
            ModelPricing::new(provider, model, input_per_1k, output_per_1k),
        );
        self
    }

    pub fn with_defaults(self) -> Self {
        use Provider::*;
        self.model(OpenAi, "gpt-4o", dec!(0.0025), dec!(0.01))
            .model(OpenAi, "gpt-4o-mini", dec!(0.00015), dec!(0.0006))
            .model(OpenAi, "gpt-4-turbo", dec!(0.01), dec!(0.03))
            .model(OpenAi, "gpt-3.5-turbo", dec!(0.0005), dec!(0.0015))
            .model(Anthropic, "claude-3-5-sonnet", dec!(0.003), dec!(0.015))
            .model(Anthropic, "claude-3-5-haiku", dec!(0.0008), dec!(0.004))
            .model(Anthropic, "claude-3-opus", dec!(0.015), dec!(0.075))
            .model(Google, "gemini-1.5-pro", dec!(0.00125), dec!(0.005))
            .model(Google, "gemini-1.5-flash", dec!(0.000075), dec!(0.0003))
            .model(Google, "gemini-2.0-flash", dec!(0.0001), dec!(0.0004))
    }

    pub fn build(self) -> PricingTable {
        PricingTable { rows: self.rows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_per_1k_math() {
        let pricing = ModelPricing::new(Provider::OpenAi, "gpt-4o", dec!(0.0025), dec!(0.01));
        let cost = pricing.cost(&TokenCounts::new(1000, 500, None));
        assert_eq!(cost.input_usd, dec!(0.0025));
        assert_eq!(cost.output_usd, dec!(0.005));
        assert_eq!(cost.total_usd, dec!(0.0075));
    }

    #[test]
    fn test_fractional_cost_stays_exact() {
        let pricing =
            ModelPricing::new(Provider::Anthropic, "claude-3-5-haiku", dec!(0.0008), dec!(0.004));
        let cost = pricing.cost(&TokenCounts::new(123, 45, None));
        // 0.123 * 0.0008 + 0.045 * 0.004
        assert_eq!(cost.total_usd, dec!(0.0002784));
    }

    #[test]
    fn test_lookup_is_provider_scoped() {
        let table = PricingTable::builtin();
        assert!(table.get("gpt-4o", Provider::OpenAi).is_some());
        assert!(table.get("gpt-4o", Provider::Anthropic).is_none());
        assert!(table.get("unknown-model", Provider::OpenAi).is_none());
    }
}
