//! The rotation consumer.
//!
//! A single long-lived loop per queue. Each iteration:
//!
//! 1. Reserve a slot in the dispatch channel. While the channel is full the
//!    consumer waits here, so it never holds a retrieved value it cannot hand
//!    off.
//! 2. Rotate-pop the queue (head moves to tail, value is returned).
//! 3. Claim the value in the in-flight set and send it through the reserved
//!    slot. A value that is already in flight is skipped: the slot is released
//!    and the consumer waits for a release (or the revisit delay) before
//!    polling again.
//!
//! Store errors never end the loop; they are retried with exponential backoff.
//! Only the shutdown token stops the consumer, and it is observed at every
//! blocking point.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::backoff::{Backoff, BackoffConfig};
use super::envelope::{DispatchEnvelope, InFlight};
use crate::store::QueueStore;
use crate::types::QueueName;

/// Default wait before re-polling when the popped value is already in flight.
pub const DEFAULT_REVISIT_DELAY: Duration = Duration::from_millis(100);

/// Observable state of the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Between iterations, or waiting for channel capacity.
    Idle,
    /// Waiting inside `rotate_pop`.
    Blocked,
    /// Handing a retrieved value to the channel.
    Delivering,
    /// Shut down. Terminal.
    Stopped,
}

/// Drains one queue into the dispatch channel.
pub struct RotationConsumer<S> {
    store: Arc<S>,
    queue: QueueName,
    tx: mpsc::Sender<DispatchEnvelope>,
    in_flight: Arc<InFlight>,
    rotate_timeout: Duration,
    revisit_delay: Duration,
    backoff: Backoff,
    state: watch::Sender<ConsumerState>,
}

impl<S: QueueStore> RotationConsumer<S> {
    /// Creates a consumer for `queue` that sends into `tx`.
    pub fn new(
        store: Arc<S>,
        queue: QueueName,
        tx: mpsc::Sender<DispatchEnvelope>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        RotationConsumer {
            store,
            queue,
            tx,
            in_flight,
            rotate_timeout: Duration::ZERO,
            revisit_delay: DEFAULT_REVISIT_DELAY,
            backoff: Backoff::new(BackoffConfig::DEFAULT),
            state,
        }
    }

    /// Sets the `rotate_pop` timeout. Zero blocks indefinitely.
    pub fn with_rotate_timeout(mut self, timeout: Duration) -> Self {
        self.rotate_timeout = timeout;
        self
    }

    /// Sets the wait used when the popped value is already in flight.
    pub fn with_revisit_delay(mut self, delay: Duration) -> Self {
        self.revisit_delay = delay;
        self
    }

    /// Sets the backoff used after store errors.
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Backoff::new(config);
        self
    }

    /// Returns a receiver that tracks the consumer state.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Runs the loop until `shutdown` is cancelled.
    ///
    /// Consumes the consumer; dropping its sender when the loop ends is what
    /// closes the dispatch channel and lets the workers drain.
    #[instrument(skip_all, fields(queue = %self.queue))]
    pub async fn run(self, shutdown: CancellationToken) {
        let RotationConsumer {
            store,
            queue,
            tx,
            in_flight,
            rotate_timeout,
            revisit_delay,
            mut backoff,
            state,
        } = self;

        info!("Rotation consumer started");
        let mut pass: u64 = 0;

        loop {
            state.send_replace(ConsumerState::Idle);

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        info!("Dispatch channel closed");
                        break;
                    }
                },
            };

            state.send_replace(ConsumerState::Blocked);

            let popped = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                popped = store.rotate_pop(&queue, rotate_timeout) => popped,
            };

            match popped {
                Ok(Some(value)) => {
                    backoff.reset();
                    pass += 1;

                    let Some(guard) = in_flight.try_claim(&value) else {
                        drop(permit);
                        trace!(pass, "Value already in flight, waiting before revisiting");
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            _ = in_flight.released() => {}
                            _ = tokio::time::sleep(revisit_delay) => {}
                        }
                        continue;
                    };

                    state.send_replace(ConsumerState::Delivering);
                    let envelope = DispatchEnvelope::new(queue.clone(), pass, guard);
                    debug!(
                        pass,
                        id = ?envelope.message.id,
                        attempts = envelope.message.attempts,
                        "Dispatching message"
                    );
                    permit.send(envelope);
                }
                Ok(None) => {
                    backoff.reset();
                    trace!("Rotate timed out on empty queue");
                }
                Err(e) => {
                    drop(permit);
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        failures = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Rotate failed, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        state.send_replace(ConsumerState::Stopped);
        info!("Rotation consumer stopped");
    }
}
