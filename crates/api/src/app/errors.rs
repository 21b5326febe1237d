use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use redline_jobs::JobError;

pub fn job_error_to_response(err: JobError) -> axum::response::Response {
    match err {
        JobError::AlreadyRunning(_) => json_error(StatusCode::BAD_REQUEST, "already_running", err.to_string()),
        JobError::Preflight(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "preflight_failed", err.to_string())
        }
        JobError::UnknownPhase { .. } => json_error(StatusCode::NOT_FOUND, "unknown_phase", err.to_string()),
        JobError::PhaseFailed { .. } => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "phase_failed", err.to_string())
        }
        JobError::Spawn(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn not_found(code: &'static str, message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, code, message)
}

/// A blocking handler section panicked or was cancelled.
pub fn join_error(err: tokio::task::JoinError) -> axum::response::Response {
    tracing::error!(error = %err, "blocking task failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
}
