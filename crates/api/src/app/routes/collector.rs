//! Collector status and operator actions.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use redline_backoff::Collector;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/collect", post(collect))
        .route("/reset-failures", post(reset_failures))
        .route("/clear-tracking", post(clear_tracking))
        .route("/streams/:stream/reset", post(reset_stream))
}

/// GET /collector/status
pub async fn status(Extension(collector): Extension<Arc<Collector>>) -> impl IntoResponse {
    Json(collector.status())
}

/// POST /collector/collect
///
/// Runs one cycle now, waiting for a background cycle in progress.
pub async fn collect(Extension(collector): Extension<Arc<Collector>>) -> axum::response::Response {
    match tokio::task::spawn_blocking(move || collector.collect_once()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::join_error(e),
    }
}

/// POST /collector/reset-failures
pub async fn reset_failures(Extension(collector): Extension<Arc<Collector>>) -> impl IntoResponse {
    collector.reset_failures();
    tracing::info!("all stream failure counters reset");
    Json(dto::ActionResponse::success("Failure counters reset for all streams"))
}

/// POST /collector/clear-tracking
///
/// Forgets every remembered item id, so the next cycle emits all items again.
pub async fn clear_tracking(Extension(collector): Extension<Arc<Collector>>) -> impl IntoResponse {
    let forgotten = collector.clear_tracking();
    Json(dto::ActionResponse::success(format!(
        "Duplicate tracking cleared ({forgotten} ids forgotten)"
    )))
}

/// POST /collector/streams/:stream/reset
pub async fn reset_stream(
    Extension(collector): Extension<Arc<Collector>>,
    Path(stream): Path<String>,
) -> axum::response::Response {
    if !collector.reset_stream(&stream) {
        return errors::not_found("unknown_stream", format!("No stream named {stream}"));
    }
    Json(dto::ActionResponse::success(format!("Failure counter reset for {stream}"))).into_response()
}
