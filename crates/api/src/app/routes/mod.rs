use axum::Router;

pub mod collector;
pub mod jobs;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/collector", collector::router())
}
