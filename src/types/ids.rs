//! Newtype wrappers for queue and message identifiers.
//!
//! These keep store keys and message ids from being mixed up with arbitrary
//! strings (e.g., passing a payload where a queue key is expected).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The key of a list in the queue store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(pub String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Self {
        QueueName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the conventional dead-letter queue for this queue (`<name>:dead`).
    pub fn dead_letter(&self) -> Self {
        QueueName(format!("{}:dead", self.0))
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        QueueName(s.to_string())
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        QueueName(s)
    }
}

/// Unique id assigned to a message when it is published.
///
/// UUIDv7, so ids sort by publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generates a fresh time-ordered id.
    pub fn generate() -> Self {
        MessageId(Uuid::now_v7())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
