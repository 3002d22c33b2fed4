//! The credit ledger: balance, holds, settlement, and the rounding rules.
//!
//! Accounting model is debit-on-settle-only. A reservation narrows
//! *available* balance (`balance - Σ active holds`) without touching the
//! stored balance; settlement is the single balance mutation, debiting the
//! integer chargeable amount and writing one immutable usage row. The
//! "refund" reported at settlement is the released remainder of the hold,
//! never a credit back to the stored balance.

mod pricing;
mod reservation;
mod store;

pub use pricing::{CostBreakdown, ModelPricing, PricingTable, PricingTableBuilder};
pub use reservation::{Reservation, ReservationContext, ReservationStatus};
pub use store::{LedgerStore, MemoryStore, TokenUsageRow};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::estimate::{EstimateRequest, Estimator};
use crate::extract::AdapterRegistry;
use crate::types::{Confidence, EstimateMethod, Provider, TokenCounts};
use crate::Error;

/// One credit is worth a tenth of a cent.
pub const CREDIT_UNIT_USD: Decimal = dec!(0.001);

/// Ceiling-with-floor-of-one rounding from fractional usage to the integer
/// credits actually debited.
///
/// Any positive usage charges at least 1 credit; exact integers charge
/// exactly themselves; anything fractional rounds up to the next integer.
/// Zero usage charges zero.
pub fn chargeable_credits(actual: Decimal) -> u64 {
    if actual <= Decimal::ZERO {
        return 0;
    }
    actual.ceil().to_u64().unwrap_or(u64::MAX).max(1)
}

/// Fractional and chargeable credits for one call's real usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCredits {
    pub cost: CostBreakdown,
    /// Exact fractional credits consumed.
    pub actual_credits: Decimal,
    /// Integer credits to debit.
    pub chargeable_credits: u64,
}

/// Convert real token usage into credits under the given pricing.
pub fn credits_from_usage(counts: &TokenCounts, pricing: &ModelPricing) -> UsageCredits {
    let cost = pricing.cost(counts);
    let actual_credits = cost.total_usd / CREDIT_UNIT_USD;
    UsageCredits {
        cost,
        actual_credits,
        chargeable_credits: chargeable_credits(actual_credits),
    }
}

/// Pre-flight estimate of what a message will cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditEstimate {
    pub input_tokens: u64,
    pub estimated_output_tokens: u64,
    /// Fractional credits the estimate works out to.
    pub credits_needed: Decimal,
    /// Integer credits to reserve: covers `credits_needed * buffer`,
    /// rounded up, never below 1.
    pub credits_to_charge: u64,
    pub buffer_multiplier: Decimal,
    pub method: EstimateMethod,
    pub confidence: Confidence,
}

impl CreditEstimate {
    pub fn estimated_total_tokens(&self) -> u64 {
        self.input_tokens + self.estimated_output_tokens
    }
}

/// How close the pre-flight estimate came to real usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyBucket {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl AccuracyBucket {
    fn for_error_pct(pct: f64) -> Self {
        if pct < 10.0 {
            AccuracyBucket::Excellent
        } else if pct < 25.0 {
            AccuracyBucket::Good
        } else if pct < 50.0 {
            AccuracyBucket::Fair
        } else {
            AccuracyBucket::Poor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub estimated_tokens: u64,
    pub actual_tokens: u64,
    pub error_pct: f64,
    pub bucket: AccuracyBucket,
}

impl AccuracyReport {
    pub fn compare(estimated_tokens: u64, actual_tokens: u64) -> Self {
        let error_pct = if actual_tokens == 0 {
            if estimated_tokens == 0 { 0.0 } else { 100.0 }
        } else {
            (estimated_tokens as f64 - actual_tokens as f64).abs() / actual_tokens as f64 * 100.0
        };
        Self {
            estimated_tokens,
            actual_tokens,
            error_pct,
            bucket: AccuracyBucket::for_error_pct(error_pct),
        }
    }
}

/// What settlement needs to know about real usage.
#[derive(Debug, Clone)]
pub struct SettlementUsage {
    pub counts: TokenCounts,
    pub cost: CostBreakdown,
    pub credits_used: Decimal,
    /// Pre-flight total-token estimate, for accuracy reporting.
    pub estimated_total_tokens: Option<u64>,
}

/// Result of settling a reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub reservation_id: Uuid,
    pub credits_reserved: u64,
    pub credits_charged: u64,
    /// Released portion of the hold (`reserved - charged`, floored at 0).
    pub credits_refunded: u64,
    pub new_balance: Decimal,
    pub accuracy: Option<AccuracyReport>,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Safety factor applied to pre-flight estimates when sizing holds.
    pub buffer_multiplier: Decimal,
    /// How long a hold may stay active before the expiry sweep releases it.
    pub reservation_ttl: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            buffer_multiplier: dec!(1.2),
            reservation_ttl: Duration::minutes(15),
        }
    }
}

/// The credit ledger. Reserve/settle/cancel are serialized per user; users
/// never contend with each other.
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    estimator: Estimator,
    config: LedgerConfig,
    /// All known reservations, active and recently terminal. Terminal
    /// entries stay long enough to answer double-settlement attempts with
    /// a state error, then get pruned by the expiry sweep.
    reservations: DashMap<Uuid, Reservation>,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self::with_adapters(store, config, Arc::new(AdapterRegistry::builtin()))
    }

    pub fn with_adapters(
        store: Arc<dyn LedgerStore>,
        config: LedgerConfig,
        adapters: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            store,
            estimator: Estimator::new(adapters),
            config,
            reservations: DashMap::new(),
            user_locks: DashMap::new(),
        }
    }

    pub fn estimator(&self) -> &Estimator {
        &self.estimator
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Pricing row for a model, or [`Error::UnknownModel`].
    pub async fn get_model_pricing(
        &self,
        model: &str,
        provider: Provider,
    ) -> Result<ModelPricing, Error> {
        self.store
            .get_pricing(model, provider)
            .await?
            .ok_or_else(|| Error::UnknownModel {
                model: model.to_string(),
                provider,
            })
    }

    /// Pre-flight estimate: token counts, fractional credits, and the
    /// buffered integer amount a reservation should hold.
    pub async fn estimate_message_credits(
        &self,
        request: &EstimateRequest,
        model: &str,
        provider: Provider,
    ) -> Result<CreditEstimate, Error> {
        let estimate =
            self.estimator
                .estimate(request, provider, model, EstimateMethod::EnhancedEstimation);
        let pricing = self.get_model_pricing(model, provider).await?;

        let counts = TokenCounts::new(
            estimate.input_tokens,
            estimate.estimated_output_tokens,
            None,
        );
        let credits_needed = pricing.cost(&counts).total_usd / CREDIT_UNIT_USD;
        let buffered = credits_needed * self.config.buffer_multiplier;
        // Holds are never zero-sized: even a near-free call settles for at
        // least 1 credit.
        let credits_to_charge = chargeable_credits(buffered).max(1);

        Ok(CreditEstimate {
            input_tokens: estimate.input_tokens,
            estimated_output_tokens: estimate.estimated_output_tokens,
            credits_needed,
            credits_to_charge,
            buffer_multiplier: self.config.buffer_multiplier,
            method: estimate.method,
            confidence: estimate.confidence,
        })
    }

    /// Balance minus the sum of this user's active holds.
    pub async fn available_balance(&self, user_id: &str) -> Result<Decimal, Error> {
        let balance = self.store.get_balance(user_id).await?;
        Ok(balance - self.active_hold_total(user_id))
    }

    /// Place a hold against available balance. This is a hard boundary:
    /// a denied reservation is never waived, because proceeding without a
    /// hold would allow unbounded spend.
    pub async fn reserve_credits(
        &self,
        user_id: &str,
        amount: u64,
        context: ReservationContext,
    ) -> Result<Reservation, Error> {
        if user_id.is_empty() {
            return Err(Error::validation("user_id", "must not be empty"));
        }
        if amount == 0 {
            return Err(Error::validation(
                "amount",
                "reservations are never created for zero credits",
            ));
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let balance = self.store.get_balance(user_id).await?;
        let available = balance - self.active_hold_total(user_id);
        if Decimal::from(amount) > available {
            return Err(Error::InsufficientCredits {
                required: amount,
                available,
            });
        }

        let now = Utc::now();
        let reservation = Reservation {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            credits_reserved: amount,
            context,
            created_at: now,
            expires_at: now + self.config.reservation_ttl,
            status: ReservationStatus::Active,
        };
        self.store.create_reservation(&reservation).await?;
        self.reservations.insert(reservation.id, reservation.clone());

        info!(
            reservation = %reservation.id,
            user = user_id,
            credits = amount,
            "credits reserved"
        );
        Ok(reservation)
    }

    /// Settle a reservation against real usage: the terminal success path.
    ///
    /// Exactly-once: a second settle (or a settle after cancel) fails with
    /// [`Error::InvalidReservationState`]. The stored balance is debited by
    /// `chargeable` only; the hold is released in full.
    pub async fn settle_reservation(
        &self,
        id: Uuid,
        chargeable: u64,
        usage: SettlementUsage,
    ) -> Result<Settlement, Error> {
        if chargeable != chargeable_credits(usage.credits_used) {
            return Err(Error::validation(
                "chargeable_credits",
                format!(
                    "{} does not match the rounding of {} credits used",
                    chargeable, usage.credits_used
                ),
            ));
        }

        let reservation = self.snapshot(id)?;
        let lock = self.user_lock(&reservation.user_id);
        let _guard = lock.lock().await;

        self.claim(id, ReservationStatus::Settled, "settle")?;

        let outcome = self
            .persist_settlement(&reservation, chargeable, &usage)
            .await;
        let new_balance = match outcome {
            Ok(balance) => balance,
            Err(err) => {
                // Store failure: the in-process claim is rolled back so the
                // caller can compensate with a cancel.
                self.revert_claim(id);
                return Err(err);
            }
        };

        let credits_refunded = reservation.credits_reserved.saturating_sub(chargeable);
        let accuracy = usage
            .estimated_total_tokens
            .map(|estimated| AccuracyReport::compare(estimated, usage.counts.total_tokens));

        info!(
            reservation = %id,
            user = %reservation.user_id,
            charged = chargeable,
            refunded = credits_refunded,
            balance = %new_balance,
            "reservation settled"
        );
        Ok(Settlement {
            reservation_id: id,
            credits_reserved: reservation.credits_reserved,
            credits_charged: chargeable,
            credits_refunded,
            new_balance,
            accuracy,
        })
    }

    /// Release a hold with no debit: the terminal abandon path.
    pub async fn cancel_reservation(&self, id: Uuid, reason: &str) -> Result<u64, Error> {
        let released = self
            .terminate(id, ReservationStatus::Cancelled, "cancel")
            .await?;
        info!(reservation = %id, reason, credits_refunded = released, "reservation cancelled");
        Ok(released)
    }

    /// Expire overdue active holds and prune long-terminal entries.
    /// Returns how many holds were expired.
    pub async fn release_expired(&self, now: DateTime<Utc>) -> usize {
        let overdue: Vec<Uuid> = self
            .reservations
            .iter()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.id)
            .collect();

        let mut released = 0;
        for id in overdue {
            match self.terminate(id, ReservationStatus::Expired, "expire").await {
                Ok(credits) => {
                    warn!(reservation = %id, credits, "expired stale reservation");
                    released += 1;
                }
                // Raced a settle/cancel; the hold is gone either way.
                Err(Error::InvalidReservationState { .. }) => {}
                Err(err) => warn!(reservation = %id, error = %err, "expiry sweep failed"),
            }
        }

        let prune_before = now - self.config.reservation_ttl;
        self.reservations
            .retain(|_, r| !(r.status.is_terminal() && r.expires_at < prune_before));

        released
    }

    pub fn reservation(&self, id: Uuid) -> Option<Reservation> {
        self.reservations.get(&id).map(|r| r.clone())
    }

    fn active_hold_total(&self, user_id: &str) -> Decimal {
        let held: u64 = self
            .reservations
            .iter()
            .filter(|r| r.user_id == user_id && r.status == ReservationStatus::Active)
            .map(|r| r.credits_reserved)
            .sum();
        Decimal::from(held)
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    fn snapshot(&self, id: Uuid) -> Result<Reservation, Error> {
        self.reservations
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| Error::validation("reservation_id", format!("unknown reservation {id}")))
    }

    /// Compare-and-set the in-process status under the caller-held user
    /// lock. This is the exactly-once gate for terminal transitions.
    fn claim(&self, id: Uuid, target: ReservationStatus, operation: &'static str) -> Result<(), Error> {
        let mut entry = self
            .reservations
            .get_mut(&id)
            .ok_or_else(|| Error::validation("reservation_id", format!("unknown reservation {id}")))?;
        if entry.status != ReservationStatus::Active {
            return Err(Error::InvalidReservationState {
                id,
                status: entry.status,
                operation,
            });
        }
        entry.status = target;
        Ok(())
    }

    fn revert_claim(&self, id: Uuid) {
        if let Some(mut entry) = self.reservations.get_mut(&id) {
            entry.status = ReservationStatus::Active;
        }
    }

    /// Store writes in settlement order: debit, usage row, then the
    /// terminal status last. A failure part-way leaves the store row
    /// `Active`, so the caller's rollback (or a later cancel) still works;
    /// the status is never `Settled` without its debit.
    async fn persist_settlement(
        &self,
        reservation: &Reservation,
        chargeable: u64,
        usage: &SettlementUsage,
    ) -> Result<Decimal, Error> {
        let new_balance = self
            .store
            .debit(&reservation.user_id, Decimal::from(chargeable))
            .await?;

        let row = TokenUsageRow {
            user_id: reservation.user_id.clone(),
            conversation_id: reservation.context.conversation_id.clone(),
            message_id: reservation.context.message_id.clone(),
            provider: reservation.context.provider,
            model: reservation.context.model.clone(),
            input_tokens: usage.counts.input_tokens,
            output_tokens: usage.counts.output_tokens,
            total_tokens: usage.counts.total_tokens,
            input_cost_usd: usage.cost.input_usd,
            output_cost_usd: usage.cost.output_usd,
            total_cost_usd: usage.cost.total_usd,
            credits_used: usage.credits_used,
            credits_charged: chargeable,
            recorded_at: Utc::now(),
        };
        self.store.append_usage_row(&row).await?;
        self.store
            .update_reservation_status(reservation.id, ReservationStatus::Settled)
            .await?;
        Ok(new_balance)
    }

    /// Shared non-debiting terminal path for cancel and expire.
    async fn terminate(
        &self,
        id: Uuid,
        target: ReservationStatus,
        operation: &'static str,
    ) -> Result<u64, Error> {
        let reservation = self.snapshot(id)?;
        let lock = self.user_lock(&reservation.user_id);
        let _guard = lock.lock().await;

        self.claim(id, target, operation)?;
        if let Err(err) = self.store.update_reservation_status(id, target).await {
            self.revert_claim(id);
            return Err(err);
        }
        debug!(reservation = %id, status = target.as_str(), "hold released");
        Ok(reservation.credits_reserved)
    }
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger")
            .field("reservations", &self.reservations.len())
            .field("config", &self.config)
            .finish()
    }
}
