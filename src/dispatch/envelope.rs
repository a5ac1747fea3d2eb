//! Dispatch envelopes and the in-flight set.
//!
//! Rotation redelivers every queued value on every pass, so without extra
//! bookkeeping a slow handler would see its own message handed to a second
//! worker as soon as the rotation wraps around. The consumer therefore claims
//! each stored value in an [`InFlight`] set before dispatching it. The claim is
//! an RAII guard carried inside the [`DispatchEnvelope`]: however the envelope
//! ends (acknowledged, requeued, dropped by an aborted worker), the value is
//! released and the consumer is woken.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::{Message, QueueName};

/// Set of stored values currently owned by the pipeline.
#[derive(Debug, Default)]
pub struct InFlight {
    values: Mutex<HashSet<String>>,
    released: Notify,
}

impl InFlight {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `value`. Returns `None` if it is already in flight.
    pub fn try_claim(self: &Arc<Self>, value: &str) -> Option<InFlightGuard> {
        if !self.lock().insert(value.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(self),
            value: value.to_string(),
        })
    }

    /// Returns true if `value` is currently claimed.
    pub fn contains(&self, value: &str) -> bool {
        self.lock().contains(value)
    }

    /// Number of values in flight.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Waits until a claim is released.
    ///
    /// A release that happened since the last wait completes this immediately,
    /// so a release racing the caller is never missed.
    pub async fn released(&self) {
        self.released.notified().await;
    }

    fn release(&self, value: &str) {
        self.lock().remove(value);
        self.released.notify_one();
    }
}

/// Claim on a stored value. Releases it on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    set: Arc<InFlight>,
    value: String,
}

impl InFlightGuard {
    /// The claimed stored value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.release(&self.value);
    }
}

/// A retrieved value on its way from the consumer to a worker.
#[derive(Debug)]
pub struct DispatchEnvelope {
    /// Queue the value was rotated in.
    pub queue: QueueName,

    /// Decoded message handed to the handler.
    pub message: Message,

    /// Sequence number of the rotate-pop that produced this envelope.
    pub pass: u64,

    /// When the value was retrieved.
    pub retrieved_at: Instant,

    guard: InFlightGuard,
}

impl DispatchEnvelope {
    /// Wraps a claimed value.
    pub fn new(queue: QueueName, pass: u64, guard: InFlightGuard) -> Self {
        let message = Message::decode(guard.value());
        DispatchEnvelope {
            queue,
            message,
            pass,
            retrieved_at: Instant::now(),
            guard,
        }
    }

    /// The exact value as stored. This is the acknowledgment key.
    pub fn stored(&self) -> &str {
        self.guard.value()
    }
}
