//! Lightweight counters for stream tracking, global and per provider.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::Provider;

#[derive(Debug, Default)]
struct ProviderCounters {
    started: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

/// Atomic counters updated on every tracker transition.
#[derive(Debug, Default)]
pub struct StatsCollector {
    started: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    stale_cancelled: AtomicU64,
    failed: AtomicU64,
    exact_readings: AtomicU64,
    estimated_readings: AtomicU64,
    // Accumulated over completed streams only.
    total_stream_chars: AtomicU64,
    total_stream_ms: AtomicU64,
    per_provider: DashMap<Provider, ProviderCounters>,
}

impl StatsCollector {
    pub fn record_started(&self, provider: Provider) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.per_provider
            .entry(provider)
            .or_default()
            .started
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(
        &self,
        provider: Provider,
        estimated: bool,
        streamed_chars: u64,
        duration_ms: u64,
    ) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if estimated {
            self.estimated_readings.fetch_add(1, Ordering::Relaxed);
        } else {
            self.exact_readings.fetch_add(1, Ordering::Relaxed);
        }
        self.total_stream_chars
            .fetch_add(streamed_chars, Ordering::Relaxed);
        self.total_stream_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.per_provider
            .entry(provider)
            .or_default()
            .completed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self, provider: Provider, stale: bool) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stale_cancelled.fetch_add(1, Ordering::Relaxed);
        }
        self.per_provider
            .entry(provider)
            .or_default()
            .cancelled
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, provider: Provider) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.per_provider
            .entry(provider)
            .or_default()
            .failed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active: usize) -> StreamingStats {
        let mut providers: Vec<ProviderStats> = self
            .per_provider
            .iter()
            .map(|entry| ProviderStats {
                provider: *entry.key(),
                started: entry.started.load(Ordering::Relaxed),
                completed: entry.completed.load(Ordering::Relaxed),
                cancelled: entry.cancelled.load(Ordering::Relaxed),
                failed: entry.failed.load(Ordering::Relaxed),
            })
            .collect();
        providers.sort_by_key(|p| p.provider.as_str());

        let completed = self.completed.load(Ordering::Relaxed);
        let total_chars = self.total_stream_chars.load(Ordering::Relaxed);
        let total_ms = self.total_stream_ms.load(Ordering::Relaxed);
        let avg_stream_duration_ms = if completed > 0 {
            total_ms as f64 / completed as f64
        } else {
            0.0
        };
        let avg_chars_per_second = if total_ms > 0 {
            total_chars as f64 * 1000.0 / total_ms as f64
        } else {
            0.0
        };

        StreamingStats {
            active,
            started: self.started.load(Ordering::Relaxed),
            completed,
            cancelled: self.cancelled.load(Ordering::Relaxed),
            stale_cancelled: self.stale_cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            exact_readings: self.exact_readings.load(Ordering::Relaxed),
            estimated_readings: self.estimated_readings.load(Ordering::Relaxed),
            avg_stream_duration_ms,
            avg_chars_per_second,
            providers,
        }
    }
}

/// Per-provider slice of the stats snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub provider: Provider,
    pub started: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

/// Point-in-time view of tracking activity, serializable for ops
/// endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingStats {
    pub active: usize,
    pub started: u64,
    pub completed: u64,
    pub cancelled: u64,
    /// Cancellations initiated by the stale sweep, included in `cancelled`.
    pub stale_cancelled: u64,
    /// Streams whose settlement or hold release threw.
    pub failed: u64,
    pub exact_readings: u64,
    pub estimated_readings: u64,
    /// Mean wall-clock duration of completed streams.
    pub avg_stream_duration_ms: f64,
    /// Mean streaming throughput across completed streams.
    pub avg_chars_per_second: f64,
    pub providers: Vec<ProviderStats>,
}
