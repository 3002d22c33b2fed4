//! Live tracking of streaming AI calls from reservation to settlement.
//!
//! One tracker per in-flight stream, keyed by its reservation id. The
//! lifecycle is a strict state machine: `Active` takes chunks and moves to
//! exactly one of `Completed` (settle against usage), `Cancelled` (release
//! the hold), or `Failed` (settlement threw; the hold is compensated and
//! the error surfaces). Terminal trackers linger for a short grace period
//! so late lookups still resolve, then the sweep evicts them. The sweep
//! also cancels trackers whose stream went quiet without a terminal call.

mod registry;
mod stats;

pub use registry::{MAX_ACTIVE_TRACKERS, TrackerEntry, TrackerRegistry, TrackerState};
pub use stats::{ProviderStats, StatsCollector, StreamingStats};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::estimate::EstimateRequest;
use crate::extract::UsageExtractor;
use crate::ledger::{
    CreditEstimate, CreditLedger, ReservationContext, SettlementUsage, credits_from_usage,
};
use crate::ledger::AccuracyReport;
use crate::types::{EstimatedUsage, HistoryMessage, Provider, TokenCounts, UsageReading};
use crate::Error;

/// Budget fraction at which a stream gets its one overrun warning.
const BUDGET_WARN_PCT: f64 = 80.0;

/// Budget fraction at which the reservation-extension hook fires. The
/// hook currently only logs; mid-stream top-ups are an integration point
/// for the chat layer.
const BUDGET_EXTENSION_PCT: f64 = 90.0;

/// Everything needed to start tracking one streaming call.
#[derive(Debug, Clone, Default)]
pub struct StartConfig {
    pub user_id: String,
    pub content: String,
    pub model: String,
    pub provider: Provider,
    pub conversation_id: String,
    pub message_id: String,
    pub system_prompt: Option<String>,
    pub history: Vec<HistoryMessage>,
    pub attachments: u32,
    /// Operation label for the audit trail; defaults to `chat_message`.
    pub operation_type: String,
}

/// Returned by [`StreamingTracker::start_tracking`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReceipt {
    pub reservation_id: Uuid,
    pub credits_reserved: u64,
    pub estimate: CreditEstimate,
}

/// Live position of a stream after one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub reservation_id: Uuid,
    pub streamed_chars: u64,
    pub chunk_count: u64,
    pub live_output_tokens: u64,
    /// Fractional credits the stream has consumed so far.
    pub projected_credits: Decimal,
    /// Projected credits as a percentage of the hold.
    pub budget_used_pct: f64,
    /// Hold minus projected consumption, floored at zero.
    pub credits_remaining: Decimal,
    /// True once the stream has crossed the budget warning threshold.
    pub is_approaching_limit: bool,
    /// Streaming throughput since the tracker started.
    pub chars_per_second: f64,
}

/// External view of one tracker, without registry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerStatus {
    pub reservation_id: Uuid,
    pub user_id: String,
    pub provider: Provider,
    pub model: String,
    pub state: TrackerState,
    pub elapsed_ms: u64,
    pub streamed_chars: u64,
    pub chunk_count: u64,
    pub live_output_tokens: u64,
    pub credits_reserved: u64,
    pub projected_credits: Decimal,
}

/// Credit movement at settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditOutcome {
    pub reserved: u64,
    pub charged: u64,
    pub refunded: u64,
    pub balance: Decimal,
}

/// Returned by [`StreamingTracker::complete_streaming`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReceipt {
    pub reservation_id: Uuid,
    /// Tagged exact-or-estimated usage the settlement was based on.
    pub usage: UsageReading,
    pub credits: CreditOutcome,
    pub accuracy: Option<AccuracyReport>,
}

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Active trackers cancelled for inactivity.
    pub stale_cancelled: usize,
    /// Terminal trackers removed after their grace period.
    pub evicted: usize,
    /// Ledger holds expired past their TTL.
    pub holds_expired: usize,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub max_active: usize,
    /// An active tracker with no chunks for this long is presumed
    /// abandoned and cancelled by the sweep.
    pub stale_after: Duration,
    /// How long completed trackers stay queryable before eviction.
    pub completed_grace: Duration,
    /// How long cancelled trackers stay queryable before eviction.
    pub cancelled_grace: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_active: MAX_ACTIVE_TRACKERS,
            stale_after: Duration::minutes(10),
            completed_grace: Duration::seconds(30),
            cancelled_grace: Duration::seconds(5),
        }
    }
}

/// Orchestrates reservation, chunk accounting, and settlement for
/// streaming calls.
pub struct StreamingTracker {
    ledger: Arc<CreditLedger>,
    extractor: UsageExtractor,
    registry: TrackerRegistry,
    stats: StatsCollector,
    config: TrackerConfig,
}

impl StreamingTracker {
    pub fn new(ledger: Arc<CreditLedger>) -> Self {
        Self::with_config(ledger, TrackerConfig::default())
    }

    pub fn with_config(ledger: Arc<CreditLedger>, config: TrackerConfig) -> Self {
        Self {
            ledger,
            extractor: UsageExtractor::default(),
            registry: TrackerRegistry::new(config.max_active),
            stats: StatsCollector::default(),
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn stats(&self) -> StreamingStats {
        self.stats.snapshot(self.registry.active_count())
    }

    /// Snapshot of a live or recently finished tracker, or
    /// [`Error::TrackerNotFound`] once it has been evicted.
    pub fn status(&self, id: Uuid) -> Result<TrackerStatus, Error> {
        let entry = self.registry.get(id)?;
        let live_output_tokens = self.ledger.estimator().output_tokens_for_chars(
            entry.streamed_chars,
            entry.provider,
            &entry.model,
        );
        let counts = TokenCounts::new(entry.estimate.input_tokens, live_output_tokens, None);
        let projected_credits = credits_from_usage(&counts, &entry.pricing).actual_credits;
        Ok(TrackerStatus {
            reservation_id: entry.id,
            user_id: entry.user_id,
            provider: entry.provider,
            model: entry.model,
            state: entry.state,
            elapsed_ms: (Utc::now() - entry.started_at).num_milliseconds().max(0) as u64,
            streamed_chars: entry.streamed_chars,
            chunk_count: entry.chunk_count,
            live_output_tokens,
            credits_reserved: entry.credits_reserved,
            projected_credits,
        })
    }

    /// Estimate, reserve, and register a tracker for a new stream.
    ///
    /// Fails without side effects when the estimate cannot be priced, the
    /// user cannot cover the hold, or the tracker cap is reached.
    pub async fn start_tracking(&self, config: StartConfig) -> Result<StartReceipt, Error> {
        if config.user_id.is_empty() {
            return Err(Error::validation("user_id", "must not be empty"));
        }
        if config.model.is_empty() {
            return Err(Error::validation("model", "must not be empty"));
        }
        self.registry.ensure_capacity()?;

        let request = EstimateRequest {
            content: config.content,
            system_prompt: config.system_prompt,
            history: config.history,
            attachments: config.attachments,
        };
        let estimate = self
            .ledger
            .estimate_message_credits(&request, &config.model, config.provider)
            .await?;
        let pricing = self
            .ledger
            .get_model_pricing(&config.model, config.provider)
            .await?;

        let operation_type = if config.operation_type.is_empty() {
            "chat_message".to_string()
        } else {
            config.operation_type
        };
        let reservation = self
            .ledger
            .reserve_credits(
                &config.user_id,
                estimate.credits_to_charge,
                ReservationContext {
                    conversation_id: config.conversation_id,
                    message_id: config.message_id,
                    model: config.model.clone(),
                    provider: config.provider,
                    operation_type,
                },
            )
            .await?;

        let now = Utc::now();
        let entry = TrackerEntry {
            id: reservation.id,
            user_id: config.user_id,
            provider: config.provider,
            model: config.model,
            pricing,
            estimate,
            credits_reserved: reservation.credits_reserved,
            request,
            started_at: now,
            last_activity: now,
            streamed_chars: 0,
            chunk_count: 0,
            state: TrackerState::Active,
            budget_warned: false,
            extension_flagged: false,
        };
        if let Err(err) = self.registry.insert(entry) {
            // Raced past the capacity pre-check; release the hold before
            // surfacing the limit.
            if let Err(cancel_err) = self
                .ledger
                .cancel_reservation(reservation.id, "tracker limit reached")
                .await
            {
                warn!(reservation = %reservation.id, error = %cancel_err, "failed to release hold after tracker limit");
            }
            return Err(err);
        }

        self.stats.record_started(config.provider);
        debug!(
            reservation = %reservation.id,
            reserved = reservation.credits_reserved,
            "stream tracking started"
        );
        Ok(StartReceipt {
            reservation_id: reservation.id,
            credits_reserved: reservation.credits_reserved,
            estimate,
        })
    }

    /// Account one streamed chunk of assistant text.
    pub async fn update_with_chunk(&self, id: Uuid, chunk: &str) -> Result<ChunkReceipt, Error> {
        let chars = chunk.chars().count() as u64;
        let estimator = self.ledger.estimator().clone();

        self.registry.update(id, |entry| {
            if entry.state != TrackerState::Active {
                return Err(Error::InvalidTrackerState {
                    id,
                    state: entry.state,
                    expected: "active",
                });
            }
            let now = Utc::now();
            entry.streamed_chars += chars;
            entry.chunk_count += 1;
            entry.last_activity = now;

            let elapsed_ms = (now - entry.started_at).num_milliseconds().max(1) as f64;
            let chars_per_second = entry.streamed_chars as f64 * 1000.0 / elapsed_ms;

            let live_output_tokens =
                estimator.output_tokens_for_chars(entry.streamed_chars, entry.provider, &entry.model);
            let counts = TokenCounts::new(entry.estimate.input_tokens, live_output_tokens, None);
            let projected_credits = credits_from_usage(&counts, &entry.pricing).actual_credits;
            let budget_used_pct = (projected_credits
                / Decimal::from(entry.credits_reserved)
                * Decimal::from(100))
            .to_f64()
            .unwrap_or(0.0);

            let is_approaching_limit = budget_used_pct >= BUDGET_WARN_PCT;
            let credits_remaining =
                (Decimal::from(entry.credits_reserved) - projected_credits).max(Decimal::ZERO);

            if is_approaching_limit && !entry.budget_warned {
                entry.budget_warned = true;
                warn!(
                    reservation = %id,
                    user = %entry.user_id,
                    pct = budget_used_pct,
                    "stream nearing its credit hold"
                );
            }
            if budget_used_pct >= BUDGET_EXTENSION_PCT && !entry.extension_flagged {
                entry.extension_flagged = true;
                info!(
                    reservation = %id,
                    user = %entry.user_id,
                    pct = budget_used_pct,
                    "stream exceeded extension threshold"
                );
            }

            Ok(ChunkReceipt {
                reservation_id: id,
                streamed_chars: entry.streamed_chars,
                chunk_count: entry.chunk_count,
                live_output_tokens,
                projected_credits,
                budget_used_pct,
                credits_remaining,
                is_approaching_limit,
                chars_per_second,
            })
        })
    }

    /// Finish a stream and settle its reservation.
    ///
    /// With a final response, usage is extracted from it; extraction
    /// failure or a missing response falls back to an estimate built from
    /// the start-time input estimate plus the actually streamed output.
    /// Either way the settlement debits the user and the reading's
    /// exact/estimated tag is preserved in the receipt.
    pub async fn complete_streaming(
        &self,
        id: Uuid,
        final_response: Option<&Value>,
    ) -> Result<CompletionReceipt, Error> {
        let entry = self.claim(id, TrackerState::Completed)?;

        let usage = match final_response {
            Some(response) => {
                match self.extractor.extract(response, entry.provider, &entry.model) {
                    Ok(counts) => UsageReading::Exact { counts },
                    Err(err) => {
                        debug!(
                            reservation = %id,
                            error = %err,
                            "no usage in final response, estimating from stream"
                        );
                        self.stream_estimate(&entry)
                    }
                }
            }
            None => self.stream_estimate(&entry),
        };

        let counts = usage.counts();
        let credits = credits_from_usage(&counts, &entry.pricing);
        let settlement = self
            .ledger
            .settle_reservation(
                id,
                credits.chargeable_credits,
                SettlementUsage {
                    counts,
                    cost: credits.cost,
                    credits_used: credits.actual_credits,
                    estimated_total_tokens: Some(entry.estimate.estimated_total_tokens()),
                },
            )
            .await;
        let settlement = match settlement {
            Ok(settlement) => settlement,
            Err(err) => {
                self.fail(id, &entry, "settlement failed").await;
                return Err(err);
            }
        };

        self.registry
            .schedule_eviction(id, self.config.completed_grace, Utc::now());
        let duration_ms = (Utc::now() - entry.started_at).num_milliseconds().max(0) as u64;
        self.stats.record_completed(
            entry.provider,
            usage.is_estimated(),
            entry.streamed_chars,
            duration_ms,
        );

        Ok(CompletionReceipt {
            reservation_id: id,
            usage,
            credits: CreditOutcome {
                reserved: settlement.credits_reserved,
                charged: settlement.credits_charged,
                refunded: settlement.credits_refunded,
                balance: settlement.new_balance,
            },
            accuracy: settlement.accuracy,
        })
    }

    /// Abandon a stream: release the hold, charge nothing.
    pub async fn cancel_streaming(&self, id: Uuid, reason: &str) -> Result<u64, Error> {
        self.cancel_inner(id, reason, false).await
    }

    /// One maintenance pass: cancel stale trackers, evict terminal ones
    /// past their grace, and expire overdue ledger holds.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for id in self.registry.stale_active(now, self.config.stale_after) {
            match self.cancel_inner(id, "stream went quiet", true).await {
                Ok(_) => report.stale_cancelled += 1,
                Err(err) => warn!(reservation = %id, error = %err, "stale cancel failed"),
            }
        }

        report.evicted = self.registry.evict_due(now);
        report.holds_expired = self.ledger.release_expired(now).await;

        if report != SweepReport::default() {
            debug!(
                stale = report.stale_cancelled,
                evicted = report.evicted,
                expired = report.holds_expired,
                "tracker sweep"
            );
        }
        report
    }

    /// Run [`StreamingTracker::sweep`] on an interval until the handle is
    /// aborted.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.sweep(Utc::now()).await;
            }
        })
    }

    async fn cancel_inner(&self, id: Uuid, reason: &str, stale: bool) -> Result<u64, Error> {
        let entry = self.claim(id, TrackerState::Cancelled)?;
        let released = match self.ledger.cancel_reservation(id, reason).await {
            Ok(released) => released,
            Err(err) => {
                self.mark_failed(id);
                self.registry
                    .schedule_eviction(id, self.config.cancelled_grace, Utc::now());
                self.stats.record_failed(entry.provider);
                return Err(err);
            }
        };
        self.registry
            .schedule_eviction(id, self.config.cancelled_grace, Utc::now());
        self.stats.record_cancelled(entry.provider, stale);
        Ok(released)
    }

    /// Terminal error path: the tracker goes `Failed` and the hold is
    /// compensated with a cancel, so the user's available balance is not
    /// left narrowed until the stale sweep. A compensation failure is
    /// logged and the original error still surfaces.
    async fn fail(&self, id: Uuid, entry: &TrackerEntry, reason: &str) {
        self.mark_failed(id);
        if let Err(cancel_err) = self.ledger.cancel_reservation(id, reason).await {
            warn!(
                reservation = %id,
                error = %cancel_err,
                "failed to release hold while failing tracker"
            );
        }
        self.registry
            .schedule_eviction(id, self.config.cancelled_grace, Utc::now());
        self.stats.record_failed(entry.provider);
    }

    fn mark_failed(&self, id: Uuid) {
        let _ = self.registry.update(id, |entry| {
            entry.state = TrackerState::Failed;
            Ok(())
        });
    }

    /// Move an active tracker into a terminal state and return its
    /// snapshot. The single-transition gate for complete and cancel.
    fn claim(&self, id: Uuid, target: TrackerState) -> Result<TrackerEntry, Error> {
        self.registry.update(id, |entry| {
            if entry.state != TrackerState::Active {
                return Err(Error::InvalidTrackerState {
                    id,
                    state: entry.state,
                    expected: "active",
                });
            }
            entry.state = target;
            Ok(entry.clone())
        })
    }

    /// Estimated reading from the start-time input estimate plus output
    /// tokens derived from what actually streamed.
    fn stream_estimate(&self, entry: &TrackerEntry) -> UsageReading {
        let output_tokens = self.ledger.estimator().output_tokens_for_chars(
            entry.streamed_chars,
            entry.provider,
            &entry.model,
        );
        UsageReading::Estimated {
            usage: EstimatedUsage {
                counts: TokenCounts::new(entry.estimate.input_tokens, output_tokens, None),
                method: entry.estimate.method,
                confidence: entry.estimate.confidence,
            },
        }
    }
}

impl std::fmt::Debug for StreamingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingTracker")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerConfig, LedgerStore, MemoryStore};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn tracker_with_balance(balance: Decimal) -> (Arc<MemoryStore>, StreamingTracker) {
        let store = Arc::new(MemoryStore::new().with_balance("u1", balance));
        let ledger = Arc::new(CreditLedger::new(store.clone(), LedgerConfig::default()));
        (store, StreamingTracker::new(ledger))
    }

    fn start_config() -> StartConfig {
        StartConfig {
            user_id: "u1".into(),
            content: "Tell me everything about lighthouses".into(),
            model: "gpt-4o".into(),
            provider: Provider::OpenAi,
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_stream_with_exact_usage() {
        let (store, tracker) = tracker_with_balance(dec!(500));
        let receipt = tracker.start_tracking(start_config()).await.unwrap();
        assert!(receipt.credits_reserved >= 1);

        let chunk = tracker
            .update_with_chunk(receipt.reservation_id, "Once upon a time")
            .await
            .unwrap();
        assert_eq!(chunk.chunk_count, 1);
        assert_eq!(chunk.streamed_chars, 16);
        assert!(chunk.chars_per_second > 0.0);
        assert!(!chunk.is_approaching_limit);
        assert!(chunk.credits_remaining > Decimal::ZERO);

        let response = json!({"usage": {"prompt_tokens": 20, "completion_tokens": 30}});
        let done = tracker
            .complete_streaming(receipt.reservation_id, Some(&response))
            .await
            .unwrap();

        assert!(!done.usage.is_estimated());
        assert_eq!(done.usage.counts().total_tokens, 50);
        assert_eq!(done.credits.charged, 1);
        assert_eq!(
            done.credits.reserved,
            done.credits.charged + done.credits.refunded
        );
        assert_eq!(store.get_balance("u1").await.unwrap(), dec!(499));
        assert_eq!(store.usage_rows().len(), 1);
        assert!(done.accuracy.is_some());

        let stats = tracker.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.exact_readings, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_completion_without_response_estimates_from_stream() {
        let (_store, tracker) = tracker_with_balance(dec!(500));
        let receipt = tracker.start_tracking(start_config()).await.unwrap();

        tracker
            .update_with_chunk(receipt.reservation_id, &"y".repeat(380))
            .await
            .unwrap();
        let done = tracker
            .complete_streaming(receipt.reservation_id, None)
            .await
            .unwrap();

        assert!(done.usage.is_estimated());
        // 380 chars / 3.8 chars-per-token for the gpt-4 family
        assert_eq!(done.usage.counts().output_tokens, 100);
        assert_eq!(tracker.stats().estimated_readings, 1);
    }

    #[tokio::test]
    async fn test_unusable_final_response_estimates_from_stream() {
        let (_store, tracker) = tracker_with_balance(dec!(500));
        let receipt = tracker.start_tracking(start_config()).await.unwrap();

        let done = tracker
            .complete_streaming(receipt.reservation_id, Some(&json!({"choices": []})))
            .await
            .unwrap();
        assert!(done.usage.is_estimated());
    }

    #[tokio::test]
    async fn test_double_completion_fails() {
        let (_store, tracker) = tracker_with_balance(dec!(500));
        let receipt = tracker.start_tracking(start_config()).await.unwrap();

        tracker
            .complete_streaming(receipt.reservation_id, None)
            .await
            .unwrap();
        let err = tracker
            .complete_streaming(receipt.reservation_id, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTrackerState {
                state: TrackerState::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_releases_hold_without_charge() {
        let (store, tracker) = tracker_with_balance(dec!(100));
        let receipt = tracker.start_tracking(start_config()).await.unwrap();
        let ledger = tracker.ledger().clone();
        assert!(ledger.available_balance("u1").await.unwrap() < dec!(100));

        let released = tracker
            .cancel_streaming(receipt.reservation_id, "user hit stop")
            .await
            .unwrap();
        assert_eq!(released, receipt.credits_reserved);
        assert_eq!(store.get_balance("u1").await.unwrap(), dec!(100));
        assert_eq!(ledger.available_balance("u1").await.unwrap(), dec!(100));

        // No further chunks accepted after cancel.
        assert!(
            tracker
                .update_with_chunk(receipt.reservation_id, "late")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unknown_tracker() {
        let (_store, tracker) = tracker_with_balance(dec!(100));
        let err = tracker
            .update_with_chunk(Uuid::new_v4(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TrackerNotFound(_)));
    }

    #[tokio::test]
    async fn test_tracker_cap_enforced_and_hold_released() {
        let store = Arc::new(MemoryStore::new().with_balance("u1", dec!(1000)));
        let ledger = Arc::new(CreditLedger::new(store, LedgerConfig::default()));
        let tracker = StreamingTracker::with_config(
            ledger.clone(),
            TrackerConfig {
                max_active: 1,
                ..Default::default()
            },
        );

        tracker.start_tracking(start_config()).await.unwrap();
        let err = tracker.start_tracking(start_config()).await.unwrap_err();
        assert!(matches!(err, Error::TrackerLimit { .. }));
        // The denied start left no hold behind.
        let after_first = ledger.available_balance("u1").await.unwrap();
        let _ = tracker.sweep(Utc::now()).await;
        assert_eq!(ledger.available_balance("u1").await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_sweep_cancels_stale_and_evicts_after_grace() {
        let store = Arc::new(MemoryStore::new().with_balance("u1", dec!(100)));
        let ledger = Arc::new(CreditLedger::new(store, LedgerConfig::default()));
        let tracker = StreamingTracker::with_config(
            ledger.clone(),
            TrackerConfig {
                stale_after: Duration::minutes(10),
                cancelled_grace: Duration::seconds(5),
                ..Default::default()
            },
        );
        let receipt = tracker.start_tracking(start_config()).await.unwrap();

        // Nothing is stale yet.
        let report = tracker.sweep(Utc::now()).await;
        assert_eq!(report.stale_cancelled, 0);

        let later = Utc::now() + Duration::minutes(11);
        let report = tracker.sweep(later).await;
        assert_eq!(report.stale_cancelled, 1);
        assert_eq!(ledger.available_balance("u1").await.unwrap(), dec!(100));
        assert_eq!(tracker.stats().stale_cancelled, 1);

        // Still queryable during the grace window, gone after it.
        assert_eq!(
            tracker.status(receipt.reservation_id).unwrap().state,
            TrackerState::Cancelled
        );
        let report = tracker.sweep(later + Duration::seconds(6)).await;
        assert_eq!(report.evicted, 1);
        assert!(tracker.status(receipt.reservation_id).is_err());
    }

    #[tokio::test]
    async fn test_budget_warning_fires_once() {
        let (_store, tracker) = tracker_with_balance(dec!(500));
        let receipt = tracker.start_tracking(start_config()).await.unwrap();

        // Stream far more than the estimate assumed.
        let mut last = None;
        for _ in 0..40 {
            last = Some(
                tracker
                    .update_with_chunk(receipt.reservation_id, &"z".repeat(400))
                    .await
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert!(last.budget_used_pct > BUDGET_WARN_PCT);
        assert!(last.is_approaching_limit);
        assert_eq!(last.credits_remaining, Decimal::ZERO);
        assert!(
            tracker
                .registry
                .get(receipt.reservation_id)
                .unwrap()
                .budget_warned
        );
    }

    #[tokio::test]
    async fn test_insufficient_balance_blocks_start() {
        let (_store, tracker) = tracker_with_balance(dec!(0));
        let err = tracker.start_tracking(start_config()).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientCredits { .. }));
    }

    #[tokio::test]
    async fn test_settlement_failure_fails_tracker_and_releases_hold() {
        // Balance covers the hold but nowhere near the overrun charge, so
        // the settlement debit overdraws and throws.
        let (store, tracker) = tracker_with_balance(dec!(2));
        let ledger = tracker.ledger().clone();
        let receipt = tracker.start_tracking(start_config()).await.unwrap();

        for _ in 0..4 {
            tracker
                .update_with_chunk(receipt.reservation_id, &"z".repeat(50_000))
                .await
                .unwrap();
        }
        let err = tracker
            .complete_streaming(receipt.reservation_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        // The tracker is terminally failed and the hold was compensated
        // immediately, not left for the stale sweep.
        assert_eq!(
            tracker.status(receipt.reservation_id).unwrap().state,
            TrackerState::Failed
        );
        assert_eq!(ledger.available_balance("u1").await.unwrap(), dec!(2));
        assert_eq!(store.get_balance("u1").await.unwrap(), dec!(2));
        assert!(store.usage_rows().is_empty());
        assert_eq!(
            store.reservation(receipt.reservation_id).unwrap().status,
            crate::ledger::ReservationStatus::Cancelled
        );
        assert_eq!(tracker.stats().failed, 1);

        // No further transitions are accepted.
        let err = tracker
            .complete_streaming(receipt.reservation_id, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTrackerState {
                state: TrackerState::Failed,
                ..
            }
        ));
        assert!(
            tracker
                .cancel_streaming(receipt.reservation_id, "late")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (_store, tracker) = tracker_with_balance(dec!(500));
        let receipt = tracker.start_tracking(start_config()).await.unwrap();
        tracker
            .update_with_chunk(receipt.reservation_id, &"a".repeat(38))
            .await
            .unwrap();

        let status = tracker.status(receipt.reservation_id).unwrap();
        assert_eq!(status.reservation_id, receipt.reservation_id);
        assert_eq!(status.state, TrackerState::Active);
        assert_eq!(status.streamed_chars, 38);
        assert_eq!(status.chunk_count, 1);
        // 38 chars / 3.8 chars-per-token for the gpt-4 family
        assert_eq!(status.live_output_tokens, 10);
        assert_eq!(status.credits_reserved, receipt.credits_reserved);
        assert!(status.projected_credits > Decimal::ZERO);

        assert!(matches!(
            tracker.status(Uuid::new_v4()),
            Err(Error::TrackerNotFound(_))
        ));
    }
}
