//! Shared domain types: providers, token counts, and tagged usage readings.

mod content;
mod provider;
mod usage;

pub use content::{ContentPart, HistoryMessage, MessageBody};
pub use provider::Provider;
pub use usage::{
    Confidence, EstimateMethod, EstimatedUsage, RawUsage, TokenCounts, UsageReading,
    validate_usage,
};
