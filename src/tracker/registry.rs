//! Tracker registry: bounded live-tracker map plus the delayed-eviction
//! queue drained by the sweep.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::estimate::EstimateRequest;
use crate::ledger::{CreditEstimate, ModelPricing};
use crate::types::Provider;
use crate::Error;

/// Safety cap on concurrently tracked streams.
pub const MAX_ACTIVE_TRACKERS: usize = 1000;

/// Fraction of the cap at which inserts start logging warnings.
const CAPACITY_WARN_RATIO: f64 = 0.8;

/// Lifecycle of one tracked stream. Terminal trackers linger briefly for
/// late-arriving lookups, then the eviction queue removes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerState {
    Active,
    Completed,
    Cancelled,
    /// Settlement (or hold release) threw after the stream ended; the
    /// hold has been compensated where possible.
    Failed,
}

impl TrackerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerState::Active => "active",
            TrackerState::Completed => "completed",
            TrackerState::Cancelled => "cancelled",
            TrackerState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the tracker remembers about one in-flight stream. Keyed by
/// the reservation id, so tracker and hold share one identity.
#[derive(Debug, Clone)]
pub struct TrackerEntry {
    pub id: Uuid,
    pub user_id: String,
    pub provider: Provider,
    pub model: String,
    /// Pricing resolved once at start; chunk math never goes back to the
    /// store.
    pub pricing: ModelPricing,
    pub estimate: CreditEstimate,
    pub credits_reserved: u64,
    /// Original request, kept for estimation fallback at completion.
    pub request: EstimateRequest,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub streamed_chars: u64,
    pub chunk_count: u64,
    pub state: TrackerState,
    pub budget_warned: bool,
    pub extension_flagged: bool,
}

impl TrackerEntry {
    pub fn is_idle_since(&self, now: DateTime<Utc>, idle_after: Duration) -> bool {
        self.state == TrackerState::Active && now - self.last_activity > idle_after
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingEviction {
    id: Uuid,
    evict_at: DateTime<Utc>,
}

/// Concurrent registry of live trackers with a capacity cap and a
/// grace-delayed eviction queue.
#[derive(Debug)]
pub struct TrackerRegistry {
    cap: usize,
    trackers: DashMap<Uuid, TrackerEntry>,
    evictions: Mutex<Vec<PendingEviction>>,
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::new(MAX_ACTIVE_TRACKERS)
    }
}

impl TrackerRegistry {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            trackers: DashMap::new(),
            evictions: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.trackers
            .iter()
            .filter(|t| t.state == TrackerState::Active)
            .count()
    }

    /// Fails when another active tracker would exceed the cap.
    pub fn ensure_capacity(&self) -> Result<(), Error> {
        let active = self.active_count();
        if active >= self.cap {
            return Err(Error::TrackerLimit {
                active,
                cap: self.cap,
            });
        }
        if (active + 1) as f64 >= self.cap as f64 * CAPACITY_WARN_RATIO {
            warn!(active = active + 1, cap = self.cap, "tracker registry nearing capacity");
        }
        Ok(())
    }

    pub fn insert(&self, entry: TrackerEntry) -> Result<(), Error> {
        self.ensure_capacity()?;
        self.trackers.insert(entry.id, entry);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<TrackerEntry, Error> {
        self.trackers
            .get(&id)
            .map(|t| t.clone())
            .ok_or(Error::TrackerNotFound(id))
    }

    /// Mutate a tracker under its shard lock. `f` must not block or await.
    pub fn update<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut TrackerEntry) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut entry = self.trackers.get_mut(&id).ok_or(Error::TrackerNotFound(id))?;
        f(&mut entry)
    }

    /// Queue a terminal tracker for removal once `grace` has elapsed. The
    /// delay keeps the entry queryable through the tail of the request.
    pub fn schedule_eviction(&self, id: Uuid, grace: Duration, now: DateTime<Utc>) {
        if let Ok(mut queue) = self.evictions.lock() {
            queue.push(PendingEviction {
                id,
                evict_at: now + grace,
            });
        }
    }

    /// Remove every tracker whose grace period has passed. Returns how
    /// many were evicted.
    pub fn evict_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<Uuid> = match self.evictions.lock() {
            Ok(mut queue) => {
                let (ready, pending): (Vec<_>, Vec<_>) =
                    queue.drain(..).partition(|e| e.evict_at <= now);
                *queue = pending;
                ready.into_iter().map(|e| e.id).collect()
            }
            Err(_) => return 0,
        };

        let mut evicted = 0;
        for id in due {
            if self.trackers.remove(&id).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Active trackers with no chunk activity for longer than `idle_after`.
    pub fn stale_active(&self, now: DateTime<Utc>, idle_after: Duration) -> Vec<Uuid> {
        self.trackers
            .iter()
            .filter(|t| t.is_idle_since(now, idle_after))
            .map(|t| t.id)
            .collect()
    }
}
