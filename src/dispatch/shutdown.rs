//! Graceful shutdown of the pipeline.
//!
//! Shutdown order:
//!
//! 1. Cancel the consumer. It stops at its next blocking point, releasing any
//!    reserved channel slot, and drops its sender.
//! 2. With the sender gone the channel closes; workers finish the envelopes
//!    already buffered and exit.
//! 3. All of this is bounded by the grace period. Workers still running when
//!    it expires are aborted. Their values were never acknowledged, so they
//!    are redelivered after a restart.

use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::pool::WorkerPool;

/// Default time allowed for draining in-flight work.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Summary of a completed shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Time from the start of shutdown until every task had exited.
    pub elapsed: Duration,
}

/// The grace period expired before every worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("shutdown grace period of {grace:?} expired with {abandoned} worker(s) still running")]
pub struct ShutdownTimeout {
    /// The grace period that was exceeded.
    pub grace: Duration,

    /// Workers that were aborted.
    pub abandoned: usize,
}

/// Owns the running tasks and stops them in order.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    consumer: JoinHandle<()>,
    pool: WorkerPool,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Creates a coordinator for a running consumer and pool.
    ///
    /// `token` must be the token the consumer observes.
    pub fn new(
        token: CancellationToken,
        consumer: JoinHandle<()>,
        pool: WorkerPool,
        grace: Duration,
    ) -> Self {
        ShutdownCoordinator {
            token,
            consumer,
            pool,
            grace,
        }
    }

    /// Stops the consumer, drains the workers and waits for them.
    pub async fn shutdown(mut self) -> Result<ShutdownReport, ShutdownTimeout> {
        let started = Instant::now();
        info!(grace = ?self.grace, "Shutting down dispatcher");
        self.token.cancel();

        let consumer = &mut self.consumer;
        let pool = &mut self.pool;
        let drained = tokio::time::timeout(self.grace, async {
            if let Err(e) = consumer.await {
                error!(error = %e, "Rotation consumer failed");
            }
            pool.join().await;
        })
        .await;

        match drained {
            Ok(()) => {
                let report = ShutdownReport {
                    elapsed: started.elapsed(),
                };
                info!(elapsed = ?report.elapsed, "Dispatcher drained");
                Ok(report)
            }
            Err(_) => {
                self.consumer.abort();
                let abandoned = self.pool.abort();
                let timeout = ShutdownTimeout {
                    grace: self.grace,
                    abandoned,
                };
                warn!(error = %timeout, "Abandoning in-flight work, it will be redelivered");
                // Reap the aborted tasks so nothing outlives the dispatcher.
                self.pool.join().await;
                Err(timeout)
            }
        }
    }
}
