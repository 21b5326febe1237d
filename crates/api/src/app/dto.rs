use serde::Serialize;
use uuid::Uuid;

use redline_core::Slug;
use redline_jobs::{JobRunner, JobSnapshot, JobState, PhaseInfo};

/// `{status, message}` body of every successful control action.
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl ActionResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: message.into(),
            run_id: None,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job: Slug,
    pub running: bool,
    pub state: JobState,
    pub phases: usize,
}

impl JobSummary {
    pub fn new(snapshot: &JobSnapshot, phases: usize) -> Self {
        Self {
            job: snapshot.job.clone(),
            running: snapshot.running,
            state: snapshot.state.clone(),
            phases,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PhaseList {
    pub job: Slug,
    pub phases: Vec<PhaseInfo>,
}

#[derive(Debug, Serialize)]
pub struct PreflightResponse {
    pub job: Slug,
    pub status: &'static str,
    pub message: String,
}

impl PreflightResponse {
    pub fn alive(runner: &JobRunner) -> Self {
        Self {
            job: runner.name().clone(),
            status: "alive",
            message: format!("{} preflight check passed", runner.name()),
        }
    }
}
