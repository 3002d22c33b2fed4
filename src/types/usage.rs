//! Token-count types and the exact-vs-estimated reading distinction.
//!
//! Everything downstream of extraction carries an explicit tag saying
//! whether token counts came off the wire or from a heuristic, so a caller
//! can never mistake an estimate for reported usage.

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::types::Provider;

/// Normalized token usage for one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenCounts {
    /// Build counts, deriving the total when the provider did not report one.
    pub fn new(input_tokens: u64, output_tokens: u64, total_tokens: Option<u64>) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: total_tokens.unwrap_or(input_tokens + output_tokens),
        }
    }
}

/// Usage fields as read off the wire, before validation.
///
/// Providers occasionally report fractional or garbage values; extraction
/// reads into `f64` and lets [`validate_usage`] decide.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawUsage {
    pub input_tokens: f64,
    pub output_tokens: f64,
    pub total_tokens: Option<f64>,
}

/// Reject negative or non-finite token counts, round fractional ones, and
/// fill a missing total.
pub fn validate_usage(raw: RawUsage, provider: Provider) -> Result<TokenCounts, Error> {
    for (field, value) in [
        ("input_tokens", raw.input_tokens),
        ("output_tokens", raw.output_tokens),
        ("total_tokens", raw.total_tokens.unwrap_or(0.0)),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(Error::Extraction {
                provider,
                reason: format!("{field} is not a non-negative number ({value})"),
            });
        }
    }

    Ok(TokenCounts::new(
        raw.input_tokens.round() as u64,
        raw.output_tokens.round() as u64,
        raw.total_tokens.map(|t| t.round() as u64),
    ))
}

/// How estimated token counts were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    /// Provider- and model-aware character heuristics.
    EnhancedEstimation,
    /// Coarse per-provider constants; model not recognized.
    ProviderDefault,
    /// Flat 4 chars/token with conservative overhead.
    SimpleEstimation,
}

impl EstimateMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimateMethod::EnhancedEstimation => "enhanced_estimation",
            EstimateMethod::ProviderDefault => "provider_default",
            EstimateMethod::SimpleEstimation => "simple_estimation",
        }
    }
}

/// Confidence tier of an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Model-aware heuristics applied.
    Medium,
    /// Provider-default or fully generic constants.
    Low,
}

/// Token counts produced by the estimation fallback rather than the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatedUsage {
    pub counts: TokenCounts,
    pub method: EstimateMethod,
    pub confidence: Confidence,
}

/// A usage reading that is either exact (reported by the provider) or an
/// estimate. The tag travels with the data; there is no silent conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum UsageReading {
    Exact { counts: TokenCounts },
    Estimated { usage: EstimatedUsage },
}

impl UsageReading {
    pub fn counts(&self) -> TokenCounts {
        match self {
            UsageReading::Exact { counts } => *counts,
            UsageReading::Estimated { usage } => usage.counts,
        }
    }

    pub fn is_estimated(&self) -> bool {
        matches!(self, UsageReading::Estimated { .. })
    }
}
