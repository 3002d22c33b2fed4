//! OpenAI-schema extraction, shared by every OpenAI-compatible vendor.

use serde_json::Value;

use super::{ModelHeuristics, ProviderAdapter, first_object, optional_number, require_number};
use crate::types::{Confidence, Provider, RawUsage, TokenCounts, validate_usage};
use crate::Error;

/// Usage lives at `usage`, `choices[0].usage`, or `x_groq.usage` depending
/// on the vendor; field names are stable across all of them.
pub struct OpenAiAdapter;

const SEARCH_PATHS: &[&str] = &["/usage", "/choices/0/usage", "/x_groq/usage"];

impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn extract(&self, response: &Value) -> Result<TokenCounts, Error> {
        let usage = first_object(response, SEARCH_PATHS).ok_or(Error::Extraction {
            provider: Provider::OpenAi,
            reason: "no usage object in response".into(),
        })?;

        let raw = RawUsage {
            input_tokens: require_number(usage, "prompt_tokens", Provider::OpenAi)?,
            output_tokens: require_number(usage, "completion_tokens", Provider::OpenAi)?,
            total_tokens: optional_number(usage, "total_tokens"),
        };
        validate_usage(raw, Provider::OpenAi)
    }

    fn streaming_usage_chunk<'a>(&self, chunks: &'a [Value]) -> Option<&'a Value> {
        // OpenAI sends usage on the final chunk when stream_options ask for
        // it; some vendors attach it to an earlier chunk, hence the scan.
        chunks
            .iter()
            .rev()
            .find(|chunk| chunk.get("usage").is_some_and(Value::is_object))
    }

    fn heuristics(&self, model: &str) -> ModelHeuristics {
        let lower = model.to_lowercase();
        let chars_per_token = if lower.contains("mini") || lower.contains("3.5") {
            // Smaller variants tokenize less efficiently.
            4.2
        } else if lower.contains("gpt-4") {
            3.8
        } else {
            return self.default_heuristics();
        };

        ModelHeuristics {
            chars_per_token,
            overhead_tokens: 11,
            output_ratio: 0.6,
            confidence: Confidence::Medium,
        }
    }

    fn default_heuristics(&self) -> ModelHeuristics {
        ModelHeuristics {
            chars_per_token: 4.0,
            overhead_tokens: 11,
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
    fn test_extract_top_level_usage() {
        let response = json!({
            "usage": {"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}
        });
        let counts = OpenAiAdapter.extract(&response).unwrap();
        assert_eq!(
            counts,
            TokenCounts {
                input_tokens: 100,
                output_tokens: 50,
                total_tokens: 150
            }
        );
    }

    #[test]
    fn test_extract_choice_usage() {
        let response = json!({
            "choices": [{"usage": {"prompt_tokens": 20, "completion_tokens": 10}}]
        });
        let counts = OpenAiAdapter.extract(&response).unwrap();
        assert_eq!(counts.total_tokens, 30);
    }

    #[test]
    fn test_extract_groq_vendor_usage() {
        let response = json!({
            "x_groq": {"usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}}
        });
        let counts = OpenAiAdapter.extract(&response).unwrap();
        assert_eq!(counts.input_tokens, 7);
    }

    #[test]
    fn test_search_order_prefers_top_level() {
        let response = json!({
            "usage": {"prompt_tokens": 1, "completion_tokens": 1},
            "choices": [{"usage": {"prompt_tokens": 99, "completion_tokens": 99}}]
        });
        let counts = OpenAiAdapter.extract(&response).unwrap();
        assert_eq!(counts.input_tokens, 1);
    }

    #[test]
    fn test_missing_usage_fails() {
        assert!(OpenAiAdapter.extract(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_negative_tokens_fail() {
        let response = json!({"usage": {"prompt_tokens": -1, "completion_tokens": 5}});
        assert!(OpenAiAdapter.extract(&response).is_err());
    }

    #[test]
    fn test_streaming_scans_from_end() {
        let chunks = vec![
            json!({"usage": {"prompt_tokens": 1, "completion_tokens": 1}}),
            json!({"choices": [{"delta": {"content": "hi"}}]}),
            json!({"usage": {"prompt_tokens": 40, "completion_tokens": 20}}),
        ];
        let chunk = OpenAiAdapter.streaming_usage_chunk(&chunks).unwrap();
        let counts = OpenAiAdapter.extract(chunk).unwrap();
        assert_eq!(counts.input_tokens, 40);
    }

    #[test]
    fn test_mini_models_get_larger_divisor() {
        let mini = OpenAiAdapter.heuristics("gpt-4o-mini");
        let full = OpenAiAdapter.heuristics("gpt-4o");
        assert!(mini.chars_per_token > full.chars_per_token);
        assert_eq!(mini.confidence, Confidence::Medium);
    }

    #[test]
    fn test_unknown_model_uses_defaults() {
        let heuristics = OpenAiAdapter.heuristics("some-finetune");
        assert_eq!(heuristics.confidence, Confidence::Low);
        assert_eq!(heuristics.chars_per_token, 4.0);
    }
}
