//! HTTP API application wiring (Axum router + shared state).
//!
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use redline_backoff::Collector;
use redline_jobs::JobRegistry;

pub mod dto;
pub mod errors;
pub mod routes;

/// Everything the handlers share, built once at startup.
#[derive(Debug, Clone)]
pub struct AppState {
    pub jobs: Arc<JobRegistry>,
    pub collector: Arc<Collector>,
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(Extension(state.jobs))
        .layer(Extension(state.collector))
        .layer(ServiceBuilder::new())
}
