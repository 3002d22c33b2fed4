//! Google Gemini extraction (`usageMetadata` shapes).

use serde_json::Value;

use super::{ModelHeuristics, ProviderAdapter, first_object, optional_number, require_number};
use crate::types::{Confidence, Provider, RawUsage, TokenCounts, validate_usage};
use crate::Error;

pub struct GoogleAdapter;

const SEARCH_PATHS: &[&str] = &[
    "/usageMetadata",
    "/response/usageMetadata",
    "/candidates/0/usageMetadata",
];

impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn extract(&self, response: &Value) -> Result<TokenCounts, Error> {
        let usage = first_object(response, SEARCH_PATHS).ok_or(Error::Extraction {
            provider: Provider::Google,
            reason: "no usageMetadata in response".into(),
        })?;

        let raw = RawUsage {
            input_tokens: require_number(usage, "promptTokenCount", Provider::Google)?,
            output_tokens: require_number(usage, "candidatesTokenCount", Provider::Google)?,
            total_tokens: optional_number(usage, "totalTokenCount"),
        };
        validate_usage(raw, Provider::Google)
    }

    fn streaming_usage_chunk<'a>(&self, chunks: &'a [Value]) -> Option<&'a Value> {
        chunks
            .iter()
            .rev()
            .find(|chunk| chunk.get("usageMetadata").is_some_and(Value::is_object))
    }

    fn heuristics(&self, model: &str) -> ModelHeuristics {
        let lower = model.to_lowercase();
        let chars_per_token = if lower.contains("flash") {
            4.2
        } else if lower.contains("pro") {
            3.8
        } else {
            return self.default_heuristics();
        };

        ModelHeuristics {
            chars_per_token,
            overhead_tokens: 8,
            output_ratio: 0.6,
            confidence: Confidence::Medium,
        }
    }

    fn default_heuristics(&self) -> ModelHeuristics {
        ModelHeuristics {
            chars_per_token: 4.0,
            overhead_tokens: 8,
            output_ratio: 0.7,
            confidence: Confidence::Low,
        }
    }
}
