//! The unit of work a job runner executes.

use std::any::Any;

use serde::Serialize;
use thiserror::Error;

use crate::context::JobContext;

/// How a run ended when the task returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase completed.
    Finished,
    /// The task honoured a stop request and returned early.
    Stopped,
}

/// Description of one phase, as listed to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseInfo {
    pub name: String,
    pub description: String,
    /// Phase executes only on the first run that reaches it.
    pub run_once: bool,
    /// Earlier phases replayed on the same session before this phase runs on its own
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

/// Failure raised from inside a task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(msg)
    }
}

/// Work executed by a [`JobRunner`](crate::JobRunner) on its worker thread.
///
/// `run` must call [`JobContext::check_stop`] (or [`JobContext::enter_phase`])
/// before each phase and return [`RunOutcome::Stopped`] as soon as it reports a
/// stop. Errors and panics are caught by the runner and reported as the
/// `error` state.
pub trait Task: Send + Sync + 'static {
    fn run(&self, ctx: &JobContext) -> Result<RunOutcome, TaskError>;

    fn phases(&self) -> Vec<PhaseInfo> {
        Vec::new()
    }

    /// Run a single phase outside of a full run.
    fn run_phase(&self, phase: &str, _ctx: &JobContext) -> Result<(), TaskError> {
        Err(TaskError::failed(format!(
            "phase {phase} cannot be run on its own"
        )))
    }

    /// Health check executed on the caller's thread before a run is admitted.
    fn preflight(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Called on the requesting thread when a stop is requested for an active run.
    fn on_stop(&self, _ctx: &JobContext) {}
}
