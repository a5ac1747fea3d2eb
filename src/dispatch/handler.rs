//! Message handlers.
//!
//! A handler is the processing function the worker pool runs for each
//! delivered message. Returning `Ok(())` acknowledges the message; any error
//! leaves it in the rotation for another attempt.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::types::Message;

/// Errors a handler can report.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Processing failed.
    #[error("processing failed: {0}")]
    Failed(String),

    /// The handler did not finish within the configured limit.
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Creates a processing failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}

/// Processes delivered messages.
///
/// Implemented for any `Fn(Message) -> impl Future<Output = Result<(), HandlerError>>`,
/// so closures work directly:
///
/// ```ignore
/// let handler = |message: Message| async move {
///     println!("{}", message.body);
///     Ok(())
/// };
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Processes one message.
    fn handle(&self, message: Message) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

impl<F, Fut> Handler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn handle(&self, message: Message) -> impl Future<Output = Result<(), HandlerError>> + Send {
        self(message)
    }
}

/// Handler that logs each message and acknowledges it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

impl Handler for LogHandler {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        match message.id {
            Some(id) => info!(
                id = %id,
                attempts = message.attempts,
                body = %message.body,
                "Processing message"
            ),
            None => info!(body = %message.body, "Processing raw message"),
        }
        Ok(())
    }
}
