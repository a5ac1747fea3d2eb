//! The dispatch pipeline: rotation consumer, bounded channel, worker pool.
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────────┐  rotate_pop  ┌──────────┐  bounded (C)  ┌───────────┐
//!  │ queue store │ ───────────► │ consumer │ ────────────► │ W workers │
//!  │ (circular)  │              └──────────┘               │ (handler) │
//!  │             │ ◄──────────────────────────────────────── └───────────┘
//!  └─────────────┘     remove / transfer (ack, retry, dead-letter)
//! ```
//!
//! Delivery is at-least-once. A value stays in the queue, and keeps being
//! rotated, until a worker acknowledges it. A value that is already owned by
//! the pipeline is never handed to a second worker at the same time.
//!
//! # Module Structure
//!
//! - [`backoff`]: exponential backoff for store errors
//! - [`envelope`]: dispatch envelopes and the in-flight set
//! - [`handler`]: the processing function contract
//! - [`consumer`]: the rotation loop
//! - [`pool`]: workers and acknowledgment
//! - [`shutdown`]: ordered, bounded shutdown

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod backoff;
pub mod consumer;
pub mod envelope;
pub mod handler;
pub mod pool;
pub mod shutdown;


pub use backoff::{Backoff, BackoffConfig};
pub use consumer::{ConsumerState, DEFAULT_REVISIT_DELAY, RotationConsumer};
pub use envelope::{DispatchEnvelope, InFlight, InFlightGuard};
pub use handler::{Handler, HandlerError, LogHandler};
pub use pool::{Outcome, WorkerPool, WorkerSettings};
pub use shutdown::{DEFAULT_SHUTDOWN_GRACE, ShutdownCoordinator, ShutdownReport, ShutdownTimeout};

use crate::store::QueueStore;
use crate::types::QueueName;

/// Default dispatch channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default number of failed attempts before dead-lettering.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Queue to drain.
    pub queue: QueueName,

    /// Destination for messages that exhausted their attempts.
    pub dead_letter_queue: QueueName,

    /// Dispatch channel capacity (`C`).
    pub channel_capacity: usize,

    /// Number of concurrent workers (`W`).
    pub workers: usize,

    /// `rotate_pop` timeout. Zero blocks indefinitely.
    pub rotate_timeout: Duration,

    /// Backoff after store errors.
    pub backoff: BackoffConfig,

    /// Wait before re-polling when the popped value is already in flight.
    pub revisit_delay: Duration,

    /// Failed attempts before dead-lettering. `None` retries forever.
    pub max_attempts: Option<u32>,

    /// Upper bound on one handler call. `None` disables the limit.
    pub handler_timeout: Option<Duration>,

    /// Time allowed for draining on shutdown.
    pub shutdown_grace: Duration,
}

impl DispatcherConfig {
    /// Creates a configuration with defaults for `queue`.
    pub fn new(queue: impl Into<QueueName>) -> Self {
        let queue = queue.into();
        DispatcherConfig {
            dead_letter_queue: queue.dead_letter(),
            queue,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            workers: DEFAULT_WORKERS,
            rotate_timeout: Duration::ZERO,
            backoff: BackoffConfig::DEFAULT,
            revisit_delay: DEFAULT_REVISIT_DELAY,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            handler_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Sets the dispatch channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Sets the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the `rotate_pop` timeout.
    pub fn with_rotate_timeout(mut self, timeout: Duration) -> Self {
        self.rotate_timeout = timeout;
        self
    }

    /// Sets the store error backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the revisit delay for values already in flight.
    pub fn with_revisit_delay(mut self, delay: Duration) -> Self {
        self.revisit_delay = delay;
        self
    }

    /// Sets the dead-letter threshold.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the dead-letter queue.
    pub fn with_dead_letter_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.dead_letter_queue = queue.into();
        self
    }

    /// Sets the handler timeout.
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// A running dispatch pipeline for one queue.
pub struct Dispatcher {
    config: DispatcherConfig,
    shutdown: CancellationToken,
    state: watch::Receiver<ConsumerState>,
    in_flight: Arc<InFlight>,
    coordinator: ShutdownCoordinator,
}

impl Dispatcher {
    /// Starts the consumer and the worker pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S, H>(store: Arc<S>, handler: H, config: DispatcherConfig) -> Self
    where
        S: QueueStore,
        H: Handler,
    {
        Self::start_with_shutdown(store, handler, config, CancellationToken::new())
    }

    /// Starts the pipeline with a caller-provided shutdown token.
    ///
    /// Cancelling the token stops the consumer; [`Dispatcher::shutdown`] must
    /// still be awaited to drain the workers.
    pub fn start_with_shutdown<S, H>(
        store: Arc<S>,
        handler: H,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self
    where
        S: QueueStore,
        H: Handler,
    {
        info!(
            queue = %config.queue,
            dead_letter_queue = %config.dead_letter_queue,
            channel_capacity = config.channel_capacity,
            workers = config.workers,
            "Starting dispatcher"
        );

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let in_flight = Arc::new(InFlight::new());

        let consumer = RotationConsumer::new(
            Arc::clone(&store),
            config.queue.clone(),
            tx,
            Arc::clone(&in_flight),
        )
        .with_rotate_timeout(config.rotate_timeout)
        .with_revisit_delay(config.revisit_delay)
        .with_backoff(config.backoff);
        let state = consumer.subscribe();
        let consumer_task = tokio::spawn(consumer.run(shutdown.clone()));

        let pool = WorkerPool::spawn(
            config.workers,
            rx,
            store,
            Arc::new(handler),
            WorkerSettings {
                handler_timeout: config.handler_timeout,
                max_attempts: config.max_attempts,
                dead_letter: config.dead_letter_queue.clone(),
            },
        );

        let coordinator =
            ShutdownCoordinator::new(shutdown.clone(), consumer_task, pool, config.shutdown_grace);

        Dispatcher {
            config,
            shutdown,
            state,
            in_flight,
            coordinator,
        }
    }

    /// Returns the dispatcher configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Returns the shutdown token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current consumer state.
    pub fn consumer_state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Returns a receiver that tracks the consumer state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Number of values currently owned by the pipeline.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stops the pipeline, draining buffered work within the grace period.
    pub async fn shutdown(self) -> Result<ShutdownReport, ShutdownTimeout> {
        self.coordinator.shutdown().await
    }
}
