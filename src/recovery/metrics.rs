//! Process-lifetime error aggregates, keyed by (provider, model, kind).

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::ErrorKind;
use crate::types::Provider;

/// Entries untouched for this long are dropped by [`ErrorMetrics::prune`].
pub const METRIC_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy)]
struct MetricEntry {
    count: u64,
    last_seen: DateTime<Utc>,
}

/// One row of the error-metric snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorMetricRow {
    pub provider: Provider,
    pub model: String,
    pub kind: ErrorKind,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Shared error-metric registry. An injected instance, not process-global
/// state: separate engines (e.g. per test) do not share data.
#[derive(Debug, Default)]
pub struct ErrorMetrics {
    entries: DashMap<(Provider, String, ErrorKind), MetricEntry>,
}

impl ErrorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter for this failure, stamping last-seen.
    pub fn record(&self, provider: Provider, model: &str, kind: ErrorKind) {
        let now = Utc::now();
        self.entries
            .entry((provider, model.to_string(), kind))
            .and_modify(|entry| {
                entry.count += 1;
                entry.last_seen = now;
            })
            .or_insert(MetricEntry {
                count: 1,
                last_seen: now,
            });
    }

    pub fn snapshot(&self) -> Vec<ErrorMetricRow> {
        self.entries
            .iter()
            .map(|entry| {
                let (provider, model, kind) = entry.key().clone();
                ErrorMetricRow {
                    provider,
                    model,
                    kind,
                    count: entry.value().count,
                    last_seen: entry.value().last_seen,
                }
            })
            .collect()
    }

    /// Drop entries last seen more than the retention window ago.
    /// Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(METRIC_RETENTION_DAYS);
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_seen >= cutoff);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_aggregates_by_key() {
        let metrics = ErrorMetrics::new();
        metrics.record(Provider::OpenAi, "gpt-4o", ErrorKind::RateLimit);
        metrics.record(Provider::OpenAi, "gpt-4o", ErrorKind::RateLimit);
        metrics.record(Provider::OpenAi, "gpt-4o", ErrorKind::Network);

        let mut rows = metrics.snapshot();
        rows.sort_by_key(|r| r.kind.as_str());
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows.iter().find(|r| r.kind == ErrorKind::RateLimit).unwrap().count,
            2
        );
    }

    #[test]
    fn test_prune_drops_stale_entries() {
        let metrics = ErrorMetrics::new();
        metrics.record(Provider::Google, "gemini-1.5-pro", ErrorKind::Quota);

        assert_eq!(metrics.prune(Utc::now()), 0);
        let removed = metrics.prune(Utc::now() + Duration::days(METRIC_RETENTION_DAYS + 1));
        assert_eq!(removed, 1);
        assert!(metrics.snapshot().is_empty());
    }
}
