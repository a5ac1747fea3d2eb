//! Queue statistics endpoint.
//!
//! Reports how many values sit in the main queue and in the dead-letter queue.
//! The main queue depth includes values currently being processed, since
//! those stay in the list until acknowledged.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AppState;
use crate::store::{Notifier, QueueStore, StoreError};
use crate::types::QueueName;

/// Response body for `GET /stats`.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: QueueName,
    pub depth: usize,
    pub dead_letter_queue: QueueName,
    pub dead_letter_depth: usize,
}

/// Errors that can occur when reading statistics.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for StatsError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Statistics handler.
///
/// # Example
///
/// ```ignore
/// GET /stats HTTP/1.1
///
/// HTTP/1.1 200 OK
///
/// {"queue": "message_queue", "depth": 3,
///  "dead_letter_queue": "message_queue:dead", "dead_letter_depth": 0}
/// ```
pub async fn stats_handler<S: QueueStore + Notifier>(
    State(app_state): State<AppState<S>>,
) -> Result<Json<QueueStats>, StatsError> {
    let store = app_state.store();
    let depth = store.len(app_state.queue()).await?;
    let dead_letter_depth = store.len(app_state.dead_letter_queue()).await?;

    Ok(Json(QueueStats {
        queue: app_state.queue().clone(),
        depth,
        dead_letter_queue: app_state.dead_letter_queue().clone(),
        dead_letter_depth,
    }))
}
