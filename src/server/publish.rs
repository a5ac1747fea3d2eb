//! Publish endpoint handler.
//!
//! Accepts a JSON document with a single `message` field and hands the body to
//! the publish gateway. The response is sent only after the message has been
//! durably enqueued.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::AppState;
use crate::gateway::PublishError;
use crate::store::{Notifier, QueueStore};
use crate::types::MessageId;

/// Request body for `POST /publish`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub message: String,
}

/// Response body for `POST /publish`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Human-readable confirmation.
    pub message: String,

    /// Id assigned to the message.
    pub id: MessageId,

    /// Queue length right after the enqueue.
    pub position: usize,
}

/// Errors that can occur when publishing over HTTP.
#[derive(Debug, Error)]
pub enum PublishRequestError {
    /// Body is not a valid publish request.
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The gateway rejected or failed the publish.
    #[error("{0}")]
    Publish(#[from] PublishError),
}

impl IntoResponse for PublishRequestError {
    fn into_response(self) -> Response {
        let status = match &self {
            PublishRequestError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            PublishRequestError::Publish(PublishError::Validation(_)) => StatusCode::BAD_REQUEST,
            PublishRequestError::Publish(PublishError::Store(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, self.to_string()).into_response()
    }
}

/// Publish handler.
///
/// # Response
///
/// - 200 OK: Message enqueued
/// - 400 Bad Request: Malformed JSON, missing `message`, or blank message
/// - 500 Internal Server Error: Queue store failure
///
/// # Example
///
/// ```ignore
/// POST /publish HTTP/1.1
/// Content-Type: application/json
///
/// {"message": "Hello"}
///
/// HTTP/1.1 200 OK
///
/// {"message": "Message queued: Hello", "id": "0190...", "position": 1}
/// ```
pub async fn publish_handler<S: QueueStore + Notifier>(
    State(app_state): State<AppState<S>>,
    body: Bytes,
) -> Result<Json<PublishResponse>, PublishRequestError> {
    let request: PublishRequest = serde_json::from_slice(&body)?;

    match app_state.gateway().publish(&request.message).await {
        Ok(accepted) => {
            info!(
                id = %accepted.id,
                position = accepted.position,
                queue = %app_state.queue(),
                "Message published"
            );
            Ok(Json(PublishResponse {
                message: format!("Message queued: {}", request.message),
                id: accepted.id,
                position: accepted.position,
            }))
        }
        Err(e) => {
            warn!(error = %e, "Failed to publish message");
            Err(e.into())
        }
    }
}
