//! Durable queue storage.
//!
//! A queue is a plain list in the backing key-value engine. The store exposes
//! the handful of list primitives the dispatcher is built on:
//!
//! - `enqueue`: push a value onto the tail
//! - `rotate_pop`: atomically move the head to the tail and return it
//! - `remove`: delete matching values (the acknowledgment primitive)
//! - `transfer`: atomically replace one value, possibly into another list
//!
//! # Orientation
//!
//! The store follows the Redis list layout: the tail is the left end (`LPUSH`)
//! and the head is the right end. Rotating with `BRPOPLPUSH q q` therefore
//! yields values in FIFO order and re-queues each one behind everything else.
//!
//! Rotation never loses or duplicates a value. It *does* redeliver every value
//! on every pass until the value is removed.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::types::QueueName;

pub mod memory;
pub mod redis;

pub use self::redis::RedisStore;
pub use memory::MemoryStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing engine could not be reached (connection refused, dropped,
    /// timed out). Callers are expected to back off and retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The engine rejected the command.
    #[error("store command failed: {0}")]
    Command(String),

    /// A value could not be encoded for storage.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for transport-level failures.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// List operations backing a durable queue.
///
/// Implementations are shared between the consumer, the workers and the
/// publish path, so every method takes `&self` and must be safe to call
/// concurrently.
pub trait QueueStore: Send + Sync + 'static {
    /// Appends `payload` at the tail. Returns the queue length after the push.
    fn enqueue(
        &self,
        queue: &QueueName,
        payload: &str,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Moves the head value to the tail of the same queue and returns it.
    ///
    /// Waits up to `timeout` for a value to exist; a zero timeout waits
    /// indefinitely. Returns `Ok(None)` only when the timeout expires.
    fn rotate_pop(
        &self,
        queue: &QueueName,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Removes up to `count` occurrences of `payload`, scanning from the tail.
    /// Returns the number removed. A `count` of zero removes nothing.
    fn remove(
        &self,
        queue: &QueueName,
        payload: &str,
        count: usize,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Atomically removes one occurrence of `payload` from `from` and, only if
    /// one was removed, appends `replacement` at the tail of `to`.
    ///
    /// Returns whether the replacement was written.
    fn transfer(
        &self,
        from: &QueueName,
        payload: &str,
        to: &QueueName,
        replacement: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Returns the number of values in the queue.
    fn len(&self, queue: &QueueName) -> impl Future<Output = Result<usize>> + Send;
}

/// Fire-and-forget broadcast to live subscribers.
///
/// Nothing is retained: a subscriber that is not listening at the time of the
/// call never sees the payload.
pub trait Notifier: Send + Sync + 'static {
    /// Broadcasts `payload` on `channel`. Returns how many subscribers got it.
    fn notify(&self, channel: &str, payload: &str)
    -> impl Future<Output = Result<usize>> + Send;
}
