//! The publish gateway.
//!
//! Accepting a message is two independent writes:
//!
//! 1. A durable enqueue of the message envelope. This is what makes the
//!    message deliverable, and its failure fails the publish.
//! 2. A best-effort broadcast of the body to live subscribers. Nothing is
//!    retained for subscribers that are not listening, and a failure here is
//!    logged but does not fail the publish.
//!
//! The writes are not transactional. Enqueue is at-least-once (through the
//! dispatcher), notify is at-most-once.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::store::{Notifier, QueueStore, StoreError};
use crate::types::{Message, MessageId, QueueName};

/// Default broadcast channel for publish notifications.
pub const DEFAULT_NOTIFY_CHANNEL: &str = "messages";

/// Errors that can occur when publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The message was rejected before anything was written.
    #[error("invalid message: {0}")]
    Validation(String),

    /// The durable enqueue failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for publish operations.
pub type Result<T> = std::result::Result<T, PublishError>;

/// A message that was durably enqueued.
#[derive(Debug, Clone)]
pub struct Accepted {
    /// Id assigned to the message.
    pub id: MessageId,

    /// Queue length right after the enqueue.
    pub position: usize,

    /// The message as stored.
    pub message: Message,
}

/// Validates and enqueues new messages.
pub struct PublishGateway<S> {
    store: Arc<S>,
    queue: QueueName,
    channel: String,
}

impl<S> Clone for PublishGateway<S> {
    fn clone(&self) -> Self {
        PublishGateway {
            store: Arc::clone(&self.store),
            queue: self.queue.clone(),
            channel: self.channel.clone(),
        }
    }
}

impl<S: QueueStore + Notifier> PublishGateway<S> {
    /// Creates a gateway that enqueues onto `queue` and notifies on `channel`.
    pub fn new(store: Arc<S>, queue: QueueName, channel: impl Into<String>) -> Self {
        PublishGateway {
            store,
            queue,
            channel: channel.into(),
        }
    }

    /// Returns the target queue.
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Returns the notification channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Publishes `body`.
    ///
    /// The body is stored exactly as given; it only has to contain something
    /// other than whitespace.
    #[instrument(skip_all, fields(queue = %self.queue))]
    pub async fn publish(&self, body: &str) -> Result<Accepted> {
        if body.trim().is_empty() {
            return Err(PublishError::Validation(
                "message must not be empty".to_string(),
            ));
        }

        let id = MessageId::generate();
        let message = Message::with_id(id, body);
        let stored = message.encode().map_err(StoreError::from)?;

        let position = self.store.enqueue(&self.queue, &stored).await?;
        debug!(id = %id, position, "Message enqueued");

        match self.store.notify(&self.channel, body).await {
            Ok(receivers) => debug!(id = %id, receivers, "Subscribers notified"),
            Err(e) => warn!(
                id = %id,
                channel = %self.channel,
                error = %e,
                "Notification failed, message is still queued"
            ),
        }

        Ok(Accepted {
            id,
            position,
            message,
        })
    }
}
