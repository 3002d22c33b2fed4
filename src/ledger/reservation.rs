//! Reservations: ephemeral holds against available balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Provider;

/// What the reserved credits are for; written into the audit trail at
/// settlement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservationContext {
    pub conversation_id: String,
    pub message_id: String,
    pub model: String,
    pub provider: Provider,
    /// Free-form operation label from the chat layer ("chat_message",
    /// "regenerate", ...).
    pub operation_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Settled,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Settled => "settled",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hold on available balance for one in-flight provider call.
///
/// Holds never mutate stored balance; they narrow
/// `available = balance - Σ active holds` until exactly one terminal
/// transition (settle, cancel, or expire) releases them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: String,
    /// Always at least 1; zero-credit reservations are never created.
    pub credits_reserved: u64,
    pub context: ReservationContext,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ReservationStatus,
}

impl Reservation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at < now
    }
}
