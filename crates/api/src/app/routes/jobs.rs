//! Job control: start, stop, status, clear, preflight and single-phase runs.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use redline_jobs::{JobRegistry, JobRunner};

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/:job/start", get(start_job).post(start_job))
        .route("/:job/stop", get(stop_job).post(stop_job))
        .route("/:job/status", get(job_status))
        .route("/:job/clear", get(clear_log).post(clear_log))
        .route("/:job/preflight", get(preflight))
        .route("/:job/phases", get(list_phases))
        .route("/:job/phases/:phase", get(run_phase).post(run_phase))
}

fn lookup(jobs: &JobRegistry, job: &str) -> Result<Arc<JobRunner>, axum::response::Response> {
    jobs.get(job)
        .cloned()
        .ok_or_else(|| errors::not_found("unknown_job", format!("No job named {job}")))
}

/// Runner calls that may block (preflight and stop hooks do network I/O).
async fn blocking<T, F>(f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(errors::join_error)
}

/// GET /jobs
pub async fn list_jobs(Extension(jobs): Extension<Arc<JobRegistry>>) -> impl IntoResponse {
    let summaries: Vec<dto::JobSummary> = jobs
        .iter()
        .map(|runner| dto::JobSummary::new(&runner.status(), runner.phases().len()))
        .collect();
    Json(summaries)
}

/// GET|POST /jobs/:job/start
///
/// Admits a run and returns immediately; progress is read from `/status`.
pub async fn start_job(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job): Path<String>,
) -> axum::response::Response {
    let runner = match lookup(&jobs, &job) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let worker = runner.clone();
    let result = match blocking(move || worker.start()).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match result {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(
                dto::ActionResponse::success(format!("{} started in background", runner.name()))
                    .with_run_id(run_id),
            ),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(job = %runner.name(), error = %e, "start rejected");
            errors::job_error_to_response(e)
        }
    }
}

/// GET|POST /jobs/:job/stop
///
/// Always succeeds; the run ends at its next phase boundary.
pub async fn stop_job(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job): Path<String>,
) -> axum::response::Response {
    let runner = match lookup(&jobs, &job) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let worker = runner.clone();
    if let Err(resp) = blocking(move || worker.request_stop()).await {
        return resp;
    }

    Json(dto::ActionResponse::success(format!("{} stop requested", runner.name()))).into_response()
}

/// GET /jobs/:job/status
pub async fn job_status(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job): Path<String>,
) -> axum::response::Response {
    match lookup(&jobs, &job) {
        Ok(runner) => Json(runner.status()).into_response(),
        Err(resp) => resp,
    }
}

/// GET|POST /jobs/:job/clear
pub async fn clear_log(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job): Path<String>,
) -> axum::response::Response {
    let runner = match lookup(&jobs, &job) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    runner.clear_log();
    Json(dto::ActionResponse::success(format!("{} output buffer cleared", runner.name()))).into_response()
}

/// GET /jobs/:job/preflight
///
/// Runs the job's health check alone; jobs without one always pass.
pub async fn preflight(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job): Path<String>,
) -> axum::response::Response {
    let runner = match lookup(&jobs, &job) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let worker = runner.clone();
    match blocking(move || worker.preflight()).await {
        Ok(Ok(())) => Json(dto::PreflightResponse::alive(&runner)).into_response(),
        Ok(Err(e)) => {
            tracing::warn!(job = %runner.name(), error = %e, "preflight check failed");
            errors::job_error_to_response(e)
        }
        Err(resp) => resp,
    }
}

/// GET /jobs/:job/phases
pub async fn list_phases(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job): Path<String>,
) -> axum::response::Response {
    match lookup(&jobs, &job) {
        Ok(runner) => Json(dto::PhaseList {
            job: runner.name().clone(),
            phases: runner.phases(),
        })
        .into_response(),
        Err(resp) => resp,
    }
}

/// GET|POST /jobs/:job/phases/:phase
///
/// Runs one phase to completion before responding.
pub async fn run_phase(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path((job, phase)): Path<(String, String)>,
) -> axum::response::Response {
    let runner = match lookup(&jobs, &job) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let worker = runner.clone();
    let name = phase.clone();
    let result = match blocking(move || worker.run_phase(&name)).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match result {
        Ok(()) => Json(dto::ActionResponse::success(format!("{phase} phase completed"))).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
