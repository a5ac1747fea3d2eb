//! Health check endpoint for liveness probes.
//!
//! Returns 200 OK while the process is serving requests. It does not touch the
//! queue store, so a store outage does not make the process look dead; use
//! `/stats` to check the store.

use axum::http::StatusCode;

/// Health check handler.
///
/// # Example
///
/// ```ignore
/// GET /health HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: text/plain
///
/// OK
/// ```
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
