//! Token-usage extraction from raw provider responses.
//!
//! Each provider family implements [`ProviderAdapter`]; a registry keyed on
//! [`Provider`] selects the implementation, so adding a provider means
//! adding one adapter, not editing dispatch sites.
//!
//! The strict entry points ([`UsageExtractor::extract`],
//! [`UsageExtractor::extract_streaming`]) fail with [`Error::Extraction`]
//! when no usage object can be located. The lenient entry points
//! ([`UsageExtractor::read`], [`UsageExtractor::read_streaming`]) never
//! fail: they fall back to estimation and return a tagged
//! [`UsageReading`], so estimates stay visible in the type.

mod anthropic;
mod google;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::estimate::{EstimateRequest, Estimator};
use crate::recovery::{ErrorMetrics, ProviderFailure, classify};
use crate::types::{Confidence, Provider, TokenCounts, UsageReading};
use crate::Error;

/// Character-count heuristics for one provider/model pairing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelHeuristics {
    /// Average characters per token for the model family.
    pub chars_per_token: f64,
    /// Fixed per-message formatting cost in tokens.
    pub overhead_tokens: u64,
    /// Expected output size as a fraction of input tokens.
    pub output_ratio: f64,
    pub confidence: Confidence,
}

/// One provider family's extraction and estimation knowledge.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Locate and validate a usage object in a non-streaming response.
    fn extract(&self, response: &Value) -> Result<TokenCounts, Error>;

    /// Find the chunk carrying usage data, scanning from the end backward.
    fn streaming_usage_chunk<'a>(&self, chunks: &'a [Value]) -> Option<&'a Value>;

    /// Model-aware heuristics; falls back to provider defaults (with
    /// [`Confidence::Low`]) when the model name is not recognized.
    fn heuristics(&self, model: &str) -> ModelHeuristics;

    /// Coarse per-provider constants, model ignored.
    fn default_heuristics(&self) -> ModelHeuristics;
}

/// Registry of provider adapters, keyed by provider.
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Registry with the three built-in provider families.
    pub fn builtin() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.register(Arc::new(OpenAiAdapter));
        registry.register(Arc::new(AnthropicAdapter));
        registry.register(Arc::new(GoogleAdapter));
        registry
    }

    /// Register or replace the adapter for its provider.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<&Arc<dyn ProviderAdapter>, Error> {
        self.adapters.get(&provider).ok_or(Error::Extraction {
            provider,
            reason: "no adapter registered".into(),
        })
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Front door for turning raw provider responses into usage readings.
#[derive(Clone)]
pub struct UsageExtractor {
    adapters: Arc<AdapterRegistry>,
    estimator: Estimator,
    metrics: Arc<ErrorMetrics>,
}

impl UsageExtractor {
    pub fn new(adapters: Arc<AdapterRegistry>, metrics: Arc<ErrorMetrics>) -> Self {
        let estimator = Estimator::new(Arc::clone(&adapters));
        Self {
            adapters,
            estimator,
            metrics,
        }
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    /// Exact usage from a completed response, or an extraction error.
    pub fn extract(
        &self,
        response: &Value,
        provider: Provider,
        _model: &str,
    ) -> Result<TokenCounts, Error> {
        self.adapters.get(provider)?.extract(response)
    }

    /// Exact usage from a chunk sequence, scanning from the end backward
    /// for the chunk that carries usage data.
    pub fn extract_streaming(
        &self,
        chunks: &[Value],
        provider: Provider,
        _model: &str,
    ) -> Result<TokenCounts, Error> {
        let adapter = self.adapters.get(provider)?;
        let chunk = adapter
            .streaming_usage_chunk(chunks)
            .ok_or(Error::Extraction {
                provider,
                reason: format!("no usage-bearing chunk among {}", chunks.len()),
            })?;
        adapter.extract(chunk)
    }

    /// Usage reading that never fails: extraction errors are recorded in
    /// the error metrics and converted into a tagged estimate built from
    /// `fallback`.
    pub fn read(
        &self,
        response: &Value,
        provider: Provider,
        model: &str,
        fallback: &EstimateRequest,
    ) -> UsageReading {
        match self.extract(response, provider, model) {
            Ok(counts) => UsageReading::Exact { counts },
            Err(err) => self.estimate_after(err, provider, model, fallback),
        }
    }

    /// Streaming counterpart of [`UsageExtractor::read`].
    pub fn read_streaming(
        &self,
        chunks: &[Value],
        provider: Provider,
        model: &str,
        fallback: &EstimateRequest,
    ) -> UsageReading {
        match self.extract_streaming(chunks, provider, model) {
            Ok(counts) => UsageReading::Exact { counts },
            Err(err) => self.estimate_after(err, provider, model, fallback),
        }
    }

    fn estimate_after(
        &self,
        err: Error,
        provider: Provider,
        model: &str,
        fallback: &EstimateRequest,
    ) -> UsageReading {
        let failure = ProviderFailure::message(err.to_string());
        let kind = classify(&failure);
        self.metrics.record(provider, model, kind);
        debug!(
            provider = %provider,
            model,
            kind = kind.as_str(),
            "usage extraction failed, estimating"
        );

        let method = kind.policy().fallback;
        let estimate = self.estimator.estimate(fallback, provider, model, method);
        UsageReading::Estimated {
            usage: estimate.into_usage(),
        }
    }
}

impl Default for UsageExtractor {
    fn default() -> Self {
        Self::new(Arc::new(AdapterRegistry::builtin()), Arc::default())
    }
}

/// Read a usage field that must be a number when present.
pub(crate) fn require_number(
    usage: &Value,
    field: &'static str,
    provider: Provider,
) -> Result<f64, Error> {
    usage
        .get(field)
        .and_then(Value::as_f64)
        .ok_or(Error::Extraction {
            provider,
            reason: format!("usage field '{field}' missing or not a number"),
        })
}

/// Read an optional numeric usage field.
pub(crate) fn optional_number(usage: &Value, field: &str) -> Option<f64> {
    usage.get(field).and_then(Value::as_f64)
}

/// First non-null object among the given JSON-pointer paths.
pub(crate) fn first_object<'a>(response: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| response.pointer(path))
        .find(|v| v.is_object())
}
