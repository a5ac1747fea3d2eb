//! The message envelope stored in queue lists.
//!
//! Published messages are stored as a small JSON document carrying the body
//! plus delivery metadata. The id and attempt counter make a redelivery
//! distinguishable from a genuine duplicate publish.
//!
//! Values pushed onto the list by other producers (plain strings, or JSON that
//! is not an envelope) are still delivered: they decode as a *raw* message
//! whose body is the stored value itself. A value only counts as an envelope
//! if it carries an id and no fields beyond the envelope's own, so rewriting a
//! foreign value never drops any of its data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::MessageId;

/// A queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    /// Publish-time id. `None` for raw values that were never rewritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,

    /// The opaque payload handed to the handler.
    pub body: String,

    /// When the message was first enqueued, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,

    /// Number of failed delivery attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

impl Message {
    /// Creates a fresh message with a new id, stamped with the current time.
    pub fn new(body: impl Into<String>) -> Self {
        Self::with_id(MessageId::generate(), body)
    }

    /// Creates a fresh message with the given id.
    pub fn with_id(id: MessageId, body: impl Into<String>) -> Self {
        Message {
            id: Some(id),
            body: body.into(),
            enqueued_at: Some(Utc::now()),
            attempts: 0,
        }
    }

    /// Wraps a stored value that is not an envelope.
    pub fn raw(value: impl Into<String>) -> Self {
        Message {
            id: None,
            body: value.into(),
            enqueued_at: None,
            attempts: 0,
        }
    }

    /// Decodes a stored list value.
    ///
    /// Anything that does not parse as an envelope with an id is treated as a
    /// raw body, so decoding never fails.
    pub fn decode(stored: &str) -> Self {
        serde_json::from_str::<Message>(stored)
            .ok()
            .filter(|message| message.id.is_some())
            .unwrap_or_else(|| Message::raw(stored))
    }

    /// Encodes the message as the JSON value written to the store.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns true if this message came from a value that was not an envelope.
    pub fn is_raw(&self) -> bool {
        self.id.is_none()
    }

    /// Returns the message as it should be stored after one more failed attempt.
    ///
    /// Raw messages get an id here, so later redeliveries are traceable.
    pub fn with_incremented_attempts(&self) -> Self {
        Message {
            id: Some(self.id.unwrap_or_else(MessageId::generate)),
            body: self.body.clone(),
            enqueued_at: self.enqueued_at,
            attempts: self.attempts.saturating_add(1),
        }
    }
}
