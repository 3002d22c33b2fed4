//! Persistence collaborator boundary.
//!
//! The engine does not own a storage engine; it talks to whatever backs
//! balances, reservations, usage rows, and pricing through [`LedgerStore`].
//! Each method is assumed transactional per call. [`MemoryStore`] is the
//! in-crate implementation used by tests and lightweight embeddings.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pricing::{ModelPricing, PricingTable};
use super::reservation::{Reservation, ReservationStatus};
use crate::types::{Provider, TokenCounts};
use crate::Error;

/// Immutable audit row written at settlement. Never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRow {
    pub user_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub provider: Provider,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub input_cost_usd: Decimal,
    pub output_cost_usd: Decimal,
    pub total_cost_usd: Decimal,
    /// Actual fractional credits consumed.
    pub credits_used: Decimal,
    /// Integer credits debited; must equal `chargeable_credits(credits_used)`.
    pub credits_charged: u64,
    pub recorded_at: DateTime<Utc>,
}

impl TokenUsageRow {
    pub fn counts(&self) -> TokenCounts {
        TokenCounts {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

/// The persistent store for balances, reservations, usage rows, and
/// pricing. All amounts are credits unless suffixed `_usd`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Current stored balance; zero for users with no balance row yet.
    async fn get_balance(&self, user_id: &str) -> Result<Decimal, Error>;

    /// Debit the stored balance, returning the new balance. Must reject a
    /// debit that would take the balance negative.
    async fn debit(&self, user_id: &str, amount: Decimal) -> Result<Decimal, Error>;

    async fn create_reservation(&self, reservation: &Reservation) -> Result<(), Error>;

    async fn update_reservation_status(
        &self,
        id: Uuid,
        status: ReservationStatus,
    ) -> Result<(), Error>;

    /// Append one immutable usage row. Must reject rows whose
    /// `credits_charged` does not match the rounding rule for
    /// `credits_used`.
    async fn append_usage_row(&self, row: &TokenUsageRow) -> Result<(), Error>;

    async fn get_pricing(
        &self,
        model: &str,
        provider: Provider,
    ) -> Result<Option<ModelPricing>, Error>;
}

/// In-memory [`LedgerStore`]. Mirrors the relational contract: balances
/// never go negative and usage rows are append-only and invariant-checked.
#[derive(Debug, Default)]
pub struct MemoryStore {
    balances: DashMap<String, Decimal>,
    reservations: DashMap<Uuid, Reservation>,
    usage_rows: Mutex<Vec<TokenUsageRow>>,
    pricing: PricingTable,
}

impl MemoryStore {
    /// Empty store with the builtin pricing table.
    pub fn new() -> Self {
        Self {
            pricing: PricingTable::builtin(),
            ..Default::default()
        }
    }

    pub fn with_balance(self, user_id: impl Into<String>, balance: Decimal) -> Self {
        self.balances.insert(user_id.into(), balance);
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Usage rows written so far, oldest first.
    pub fn usage_rows(&self) -> Vec<TokenUsageRow> {
        self.usage_rows
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn reservation(&self, id: Uuid) -> Option<Reservation> {
        self.reservations.get(&id).map(|r| r.clone())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_balance(&self, user_id: &str) -> Result<Decimal, Error> {
        Ok(self
            .balances
            .get(user_id)
            .map(|b| *b)
            .unwrap_or(Decimal::ZERO))
    }

    async fn debit(&self, user_id: &str, amount: Decimal) -> Result<Decimal, Error> {
        let mut balance = self
            .balances
            .entry(user_id.to_string())
            .or_insert(Decimal::ZERO);
        if *balance < amount {
            return Err(Error::Store(format!(
                "debit of {amount} would overdraw balance {} for user {user_id}",
                *balance
            )));
        }
        *balance -= amount;
        Ok(*balance)
    }

    async fn create_reservation(&self, reservation: &Reservation) -> Result<(), Error> {
        if self.reservations.contains_key(&reservation.id) {
            return Err(Error::Store(format!(
                "reservation {} already exists",
                reservation.id
            )));
        }
        self.reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn update_reservation_status(
        &self,
        id: Uuid,
        status: ReservationStatus,
    ) -> Result<(), Error> {
        let mut reservation = self
            .reservations
            .get_mut(&id)
            .ok_or_else(|| Error::Store(format!("reservation {id} not found")))?;
        reservation.status = status;
        Ok(())
    }

    async fn append_usage_row(&self, row: &TokenUsageRow) -> Result<(), Error> {
        let expected = super::chargeable_credits(row.credits_used);
        if row.credits_charged != expected {
            return Err(Error::Store(format!(
                "usage row charge invariant violated: charged {} for {} credits used (expected {})",
                row.credits_charged, row.credits_used, expected
            )));
        }
        self.usage_rows
            .lock()
            .map_err(|_| Error::Store("usage row lock poisoned".into()))?
            .push(row.clone());
        Ok(())
    }

    async fn get_pricing(
        &self,
        model: &str,
        provider: Provider,
    ) -> Result<Option<ModelPricing>, Error> {
        Ok(self.pricing.get(model, provider).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_debit_rejects_overdraw() {
        let store = MemoryStore::new().with_balance("u1", dec!(5));
        assert_eq!(store.debit("u1", dec!(3)).await.unwrap(), dec!(2));
        assert!(store.debit("u1", dec!(3)).await.is_err());
        assert_eq!(store.get_balance("u1").await.unwrap(), dec!(2));
    }

    #[tokio::test]
    async fn test_unknown_user_has_zero_balance() {
        let store = MemoryStore::new();
        assert_eq!(store.get_balance("nobody").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_usage_row_invariant_enforced() {
        let store = MemoryStore::new();
        let mut row = TokenUsageRow {
            user_id: "u1".into(),
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            provider: Provider::OpenAi,
            model: "gpt-4o".into(),
            input_tokens: 100,
            output_tokens: 50,
            total_tokens: 150,
            input_cost_usd: dec!(0.00025),
            output_cost_usd: dec!(0.0005),
            total_cost_usd: dec!(0.00075),
            credits_used: dec!(0.75),
            credits_charged: 2, // wrong: 0.75 rounds up to 1
            recorded_at: Utc::now(),
        };
        assert!(store.append_usage_row(&row).await.is_err());

        row.credits_charged = 1;
        store.append_usage_row(&row).await.unwrap();
        assert_eq!(store.usage_rows().len(), 1);
    }
}
