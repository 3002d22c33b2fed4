//! # credit-engine
//!
//! Credit accounting and reservation engine for a metered, multi-tenant
//! AI-provider product.
//!
//! The engine normalizes token-usage reports from three incompatible
//! provider response shapes (OpenAI-compatible, Anthropic, Google), falls
//! back to character-count estimation when a provider fails to report
//! usage, reserves credits *before* an AI call begins, and settles the
//! reservation against true usage with deterministic, auditable rounding.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use credit_engine::{
//!     CreditLedger, LedgerConfig, MemoryStore, StartConfig, StreamingTracker,
//! };
//! use rust_decimal_macros::dec;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), credit_engine::Error> {
//!     let store = Arc::new(MemoryStore::new().with_balance("user-1", dec!(500)));
//!     let ledger = Arc::new(CreditLedger::new(store, LedgerConfig::default()));
//!     let tracker = StreamingTracker::new(ledger);
//!
//!     let receipt = tracker
//!         .start_tracking(StartConfig {
//!             user_id: "user-1".into(),
//!             content: "Tell me a story".into(),
//!             model: "gpt-4o".into(),
//!             provider: credit_engine::Provider::OpenAi,
//!             conversation_id: "conv-1".into(),
//!             message_id: "msg-1".into(),
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     tracker.update_with_chunk(receipt.reservation_id, "Once upon").await?;
//!     let done = tracker.complete_streaming(receipt.reservation_id, None).await?;
//!     println!("charged {} credits", done.credits.charged);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod estimate;
pub mod extract;
pub mod ledger;
pub mod recovery;
pub mod tracker;
pub mod types;

// Re-exports for convenience
pub use estimate::{Estimate, EstimateRequest, Estimator};
pub use extract::{AdapterRegistry, ProviderAdapter, UsageExtractor};
pub use ledger::{
    CREDIT_UNIT_USD, CreditEstimate, CreditLedger, LedgerConfig, LedgerStore, MemoryStore,
    ModelPricing, PricingTable, PricingTableBuilder, Reservation, ReservationContext,
    ReservationStatus, Settlement, TokenUsageRow, UsageCredits, chargeable_credits,
};
pub use recovery::{ErrorKind, ErrorMetrics, ProviderFailure, Recovery, RetryPolicy, classify};
pub use tracker::{
    ChunkReceipt, CompletionReceipt, StartConfig, StartReceipt, StreamingStats, StreamingTracker,
    TrackerRegistry, TrackerState, TrackerStatus,
};
pub use types::{
    Confidence, EstimateMethod, EstimatedUsage, HistoryMessage, Provider, TokenCounts,
    UsageReading,
};

use rust_decimal::Decimal;
use uuid::Uuid;

/// All errors raised by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input to a public operation had a missing or malformed field.
    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Reservation denied: the user cannot cover the requested hold.
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: u64, available: Decimal },

    /// No tracker is registered under this id.
    #[error("Tracker not found: {0}")]
    TrackerNotFound(Uuid),

    /// The tracker exists but is not in a state that allows the operation.
    #[error("Tracker {id} is {state}, expected {expected}")]
    InvalidTrackerState {
        id: Uuid,
        state: tracker::TrackerState,
        expected: &'static str,
    },

    /// The concurrent-tracker safety cap was hit.
    #[error("Active tracker limit reached ({active}/{cap})")]
    TrackerLimit { active: usize, cap: usize },

    /// No usage object could be located in a provider response.
    #[error("No usage data in {provider} response: {reason}")]
    Extraction { provider: Provider, reason: String },

    /// No pricing row exists for the model.
    #[error("No pricing for model '{model}' ({provider})")]
    UnknownModel { model: String, provider: Provider },

    /// A second terminal transition was attempted on a reservation.
    #[error("Reservation {id} is {status}, cannot {operation}")]
    InvalidReservationState {
        id: Uuid,
        status: ReservationStatus,
        operation: &'static str,
    },

    /// The persistence collaborator rejected or failed an operation.
    #[error("Store error: {0}")]
    Store(String),
}

/// Coarse classification used by callers that branch on failure class
/// rather than on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed input to a public operation.
    InvalidInput,
    /// The user's balance cannot cover the operation.
    Funds,
    /// The referenced tracker or pricing row does not exist.
    NotFound,
    /// An operation was attempted against a terminal tracker/reservation.
    IllegalState,
    /// Provider response could not be interpreted.
    Provider,
    /// Persistence collaborator failure.
    Internal,
}

impl Error {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation { .. } | Error::TrackerLimit { .. } => ErrorCategory::InvalidInput,
            Error::InsufficientCredits { .. } => ErrorCategory::Funds,
            Error::TrackerNotFound(_) | Error::UnknownModel { .. } => ErrorCategory::NotFound,
            Error::InvalidTrackerState { .. } | Error::InvalidReservationState { .. } => {
                ErrorCategory::IllegalState
            }
            Error::Extraction { .. } => ErrorCategory::Provider,
            Error::Store(_) => ErrorCategory::Internal,
        }
    }

    /// Whether surfacing this error to the end user is actionable
    /// (top up credits, fix the request) rather than a bug report.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Funds | ErrorCategory::InvalidInput
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_categories() {
        let err = Error::InsufficientCredits {
            required: 10,
            available: dec!(3.5),
        };
        assert_eq!(err.category(), ErrorCategory::Funds);
        assert!(err.is_user_actionable());

        let err = Error::Store("connection reset".into());
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert!(!err.is_user_actionable());
    }

    #[test]
    fn test_insufficient_credits_reports_amounts() {
        let err = Error::InsufficientCredits {
            required: 12,
            available: dec!(4),
        };
        let text = err.to_string();
        assert!(text.contains("12"));
        assert!(text.contains('4'));
    }
}
