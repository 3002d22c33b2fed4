//! Character-count token estimation.
//!
//! Used whenever a provider fails to report usage, and mid-stream before
//! any usage exists. Token counts are `ceil(chars / chars_per_token)` with
//! per-provider divisors plus a fixed formatting overhead; expected output
//! is a provider-dependent fraction of the input.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::extract::{AdapterRegistry, ModelHeuristics};
use crate::types::{
    Confidence, EstimateMethod, EstimatedUsage, HistoryMessage, Provider, TokenCounts,
};

/// Flat character proxy for attachments (images, files); their true token
/// cost is provider-side and unknowable pre-flight.
const ATTACHMENT_CHAR_PROXY: u64 = 100;

/// Constants for [`EstimateMethod::SimpleEstimation`].
const SIMPLE_CHARS_PER_TOKEN: f64 = 4.0;
const SIMPLE_OVERHEAD_TOKENS: u64 = 16;
const SIMPLE_OUTPUT_RATIO: f64 = 0.75;

/// Everything that contributes to the input-size estimate for one message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimateRequest {
    /// The message being sent.
    pub content: String,
    /// System prompt, when the conversation carries one.
    pub system_prompt: Option<String>,
    /// Prior conversation history included in the provider call.
    pub history: Vec<HistoryMessage>,
    /// Number of attachments on the message.
    pub attachments: u32,
}

impl EstimateRequest {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Total characters: content + system prompt + history text + a flat
    /// proxy per attachment.
    pub fn char_count(&self) -> u64 {
        let content = self.content.chars().count() as u64;
        let system = self
            .system_prompt
            .as_ref()
            .map(|s| s.chars().count() as u64)
            .unwrap_or(0);
        let history: u64 = self.history.iter().map(|m| m.content.char_count()).sum();
        let attachments = u64::from(self.attachments) * ATTACHMENT_CHAR_PROXY;
        content + system + history + attachments
    }
}

/// Result of an estimation pass. Never exact by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Estimate {
    pub input_tokens: u64,
    pub estimated_output_tokens: u64,
    pub method: EstimateMethod,
    pub confidence: Confidence,
}

impl Estimate {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.estimated_output_tokens
    }

    pub fn into_usage(self) -> EstimatedUsage {
        EstimatedUsage {
            counts: TokenCounts::new(self.input_tokens, self.estimated_output_tokens, None),
            method: self.method,
            confidence: self.confidence,
        }
    }
}

/// Character-count estimator backed by per-provider heuristics.
#[derive(Clone)]
pub struct Estimator {
    adapters: Arc<AdapterRegistry>,
}

impl Estimator {
    pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
        Self { adapters }
    }

    /// Estimate input and output tokens for a message under the given
    /// method. Infallible: when no adapter is registered for the provider
    /// the simple constants apply.
    pub fn estimate(
        &self,
        request: &EstimateRequest,
        provider: Provider,
        model: &str,
        method: EstimateMethod,
    ) -> Estimate {
        let heuristics = self.heuristics_for(provider, model, method);
        let chars = request.char_count();

        let input_tokens =
            (chars as f64 / heuristics.chars_per_token).ceil() as u64 + heuristics.overhead_tokens;
        let estimated_output_tokens = (input_tokens as f64 * heuristics.output_ratio).round() as u64;

        // An enhanced request that fell back to provider defaults is
        // reported as provider_default so accuracy metrics stay honest.
        let method = match (method, heuristics.confidence) {
            (EstimateMethod::EnhancedEstimation, Confidence::Low) => {
                EstimateMethod::ProviderDefault
            }
            (m, _) => m,
        };

        Estimate {
            input_tokens,
            estimated_output_tokens,
            method,
            confidence: heuristics.confidence,
        }
    }

    /// Live output-token estimate for streamed text. No formatting
    /// overhead: that was paid on the input side.
    pub fn output_tokens_for_chars(&self, chars: u64, provider: Provider, model: &str) -> u64 {
        let heuristics =
            self.heuristics_for(provider, model, EstimateMethod::EnhancedEstimation);
        (chars as f64 / heuristics.chars_per_token).ceil() as u64
    }

    fn heuristics_for(
        &self,
        provider: Provider,
        model: &str,
        method: EstimateMethod,
    ) -> ModelHeuristics {
        let adapter = match self.adapters.get(provider) {
            Ok(adapter) => adapter,
            Err(_) => return simple_heuristics(),
        };
        match method {
            EstimateMethod::EnhancedEstimation => adapter.heuristics(model),
            EstimateMethod::ProviderDefault => adapter.default_heuristics(),
            EstimateMethod::SimpleEstimation => simple_heuristics(),
        }
    }
}

fn simple_heuristics() -> ModelHeuristics {
    ModelHeuristics {
        chars_per_token: SIMPLE_CHARS_PER_TOKEN,
        overhead_tokens: SIMPLE_OVERHEAD_TOKENS,
        output_ratio: SIMPLE_OUTPUT_RATIO,
        confidence: Confidence::Low,
    }
}
