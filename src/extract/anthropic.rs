//! Anthropic Messages-API extraction.

use serde_json::Value;

use super::{ModelHeuristics, ProviderAdapter, first_object, require_number};
use crate::types::{Confidence, Provider, RawUsage, TokenCounts, validate_usage};
use crate::Error;

/// Anthropic reports `input_tokens`/`output_tokens` and never a combined
/// total; the total is always derived.
pub struct AnthropicAdapter;

const SEARCH_PATHS: &[&str] = &["/usage", "/message/usage", "/content/0/usage"];

impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn extract(&self, response: &Value) -> Result<TokenCounts, Error> {
        let usage = first_object(response, SEARCH_PATHS).ok_or(Error::Extraction {
            provider: Provider::Anthropic,
            reason: "no usage object in response".into(),
        })?;

        let raw = RawUsage {
            input_tokens: require_number(usage, "input_tokens", Provider::Anthropic)?,
            output_tokens: require_number(usage, "output_tokens", Provider::Anthropic)?,
            total_tokens: None,
        };
        validate_usage(raw, Provider::Anthropic)
    }

    fn streaming_usage_chunk<'a>(&self, chunks: &'a [Value]) -> Option<&'a Value> {
        // Final usage rides on the message_stop event.
        chunks.iter().rev().find(|chunk| {
            chunk.get("type").and_then(Value::as_str) == Some("message_stop")
                && chunk.get("usage").is_some_and(Value::is_object)
        })
    }

    fn heuristics(&self, model: &str) -> ModelHeuristics {
        let lower = model.to_lowercase();
        let chars_per_token = if lower.contains("haiku") {
            3.6
        } else if lower.contains("opus") {
            3.2
        } else if lower.contains("sonnet") {
            3.4
        } else {
            return self.default_heuristics();
        };

        ModelHeuristics {
            chars_per_token,
            overhead_tokens: 14,
            output_ratio: 0.65,
            confidence: Confidence::Medium,
        }
    }

    fn default_heuristics(&self) -> ModelHeuristics {
        ModelHeuristics {
            chars_per_token: 3.4,
            overhead_tokens: 14,
            output_ratio: 0.7,
            confidence: Confidence::Low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_total_is_computed_not_read() {
        let response = json!({
            // A total_tokens field here would be a vendor extension; it is
            // ignored on purpose.
            "usage": {"input_tokens": 120, "output_tokens": 80, "total_tokens": 9999}
        });
        let counts = AnthropicAdapter.extract(&response).unwrap();
        assert_eq!(
            counts,
            TokenCounts {
                input_tokens: 120,
                output_tokens: 80,
                total_tokens: 200
            }
        );
    }

    #[test]
    fn test_nested_message_usage() {
        let response = json!({"message": {"usage": {"input_tokens": 5, "output_tokens": 2}}});
        let counts = AnthropicAdapter.extract(&response).unwrap();
        assert_eq!(counts.total_tokens, 7);
    }

    #[test]
    fn test_content_block_usage() {
        let response = json!({"content": [{"usage": {"input_tokens": 3, "output_tokens": 1}}]});
        assert_eq!(AnthropicAdapter.extract(&response).unwrap().total_tokens, 4);
    }

    #[test]
    fn test_streaming_requires_message_stop() {
        let chunks = vec![
            json!({"type": "content_block_delta", "usage": {"input_tokens": 1, "output_tokens": 1}}),
            json!({"type": "message_stop", "usage": {"input_tokens": 120, "output_tokens": 80}}),
        ];
        let chunk = AnthropicAdapter.streaming_usage_chunk(&chunks).unwrap();
        assert_eq!(
            AnthropicAdapter.extract(chunk).unwrap().input_tokens,
            120
        );

        // A usage-less message_stop does not qualify.
        let chunks = vec![json!({"type": "message_stop"})];
        assert!(AnthropicAdapter.streaming_usage_chunk(&chunks).is_none());
    }

    #[test]
    fn test_model_family_divisors() {
        let haiku = AnthropicAdapter.heuristics("claude-3-5-haiku");
        let opus = AnthropicAdapter.heuristics("claude-3-opus");
        assert!(haiku.chars_per_token > opus.chars_per_token);
    }
}
