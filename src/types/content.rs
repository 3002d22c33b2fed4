//! Conversation content shapes fed into character-count estimation.

use serde::{Deserialize, Serialize};

/// One part of a structured message body. Only `text` parts contribute to
/// character counts; images and tool results are covered by the flat
/// per-attachment proxy instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// A message body as stored by the chat layer: either a plain string or a
/// list of structured parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageBody {
    /// Characters of text content in this body.
    pub fn char_count(&self) -> u64 {
        match self {
            MessageBody::Text(text) => text.chars().count() as u64,
            MessageBody::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.chars().count() as u64,
                    ContentPart::Other => 0,
                })
                .sum(),
        }
    }
}

/// A prior conversation message counted into the input-size estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub content: MessageBody,
}

impl HistoryMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: MessageBody::Text(content.into()),
        }
    }
}
