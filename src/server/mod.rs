//! HTTP ingress for the dispatcher.
//!
//! This module is a thin marshaling layer over the publish gateway and the
//! queue store:
//! - Accepts new messages and enqueues them durably
//! - Reports queue depths for observability
//! - Provides health checks for liveness probes
//!
//! # Endpoints
//!
//! - `POST /publish` - Publishes a message (returns 200 with the assigned id)
//! - `GET /stats` - Returns queue and dead-letter depths as JSON
//! - `GET /health` - Returns 200 if server is running

use std::sync::Arc;

use crate::gateway::PublishGateway;
use crate::store::{Notifier, QueueStore};
use crate::types::QueueName;

pub mod health;
pub mod publish;
pub mod stats;

pub use health::health_handler;
pub use publish::publish_handler;
pub use stats::stats_handler;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
pub struct AppState<S> {
    inner: Arc<AppStateInner<S>>,
}

struct AppStateInner<S> {
    /// Validates and enqueues published messages.
    gateway: PublishGateway<S>,

    /// Queue that exhausted messages are moved to.
    dead_letter_queue: QueueName,
}

// Manual impl: `S` itself does not need to be `Clone`.
impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: QueueStore + Notifier> AppState<S> {
    /// Creates a new `AppState`.
    pub fn new(gateway: PublishGateway<S>, dead_letter_queue: QueueName) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                gateway,
                dead_letter_queue,
            }),
        }
    }

    /// Returns the publish gateway.
    pub fn gateway(&self) -> &PublishGateway<S> {
        &self.inner.gateway
    }

    /// Returns the main queue.
    pub fn queue(&self) -> &QueueName {
        self.inner.gateway.queue()
    }

    /// Returns the dead-letter queue.
    pub fn dead_letter_queue(&self) -> &QueueName {
        &self.inner.dead_letter_queue
    }

    /// Returns the queue store.
    pub fn store(&self) -> &Arc<S> {
        self.inner.gateway.store()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<S: QueueStore + Notifier>(app_state: AppState<S>) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/publish", post(publish_handler::<S>))
        .route("/stats", get(stats_handler::<S>))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
