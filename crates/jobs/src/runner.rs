//! Job runner: single-flight start, cooperative stop, status and log access.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span};
use uuid::Uuid;

use redline_core::{LogLevel, Slug};

use crate::context::JobContext;
use crate::log_buffer::{LogBuffer, DEFAULT_LOG_CAPACITY};
use crate::shared::{JobShared, RunCell, RunningGuard};
use crate::state::JobState;
use crate::task::{PhaseInfo, RunOutcome, Task, TaskError};

/// Job runner configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Maximum number of buffered log lines
    pub log_capacity: usize,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl JobRunnerConfig {
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0} is already running")]
    AlreadyRunning(Slug),

    #[error("preflight check failed: {0}")]
    Preflight(#[source] TaskError),

    #[error("{job} has no phase named {phase}")]
    UnknownPhase { job: Slug, phase: String },

    #[error("phase {phase} failed: {source}")]
    PhaseFailed {
        phase: String,
        #[source]
        source: TaskError,
    },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Point-in-time view of a job, safe to hand to any thread.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job: Slug,
    pub running: bool,
    pub state: JobState,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log: Vec<String>,
    /// Oldest lines discarded from `log` since it was last cleared
    pub dropped_lines: u64,
    pub message: String,
}

impl JobSnapshot {
    fn new(job: Slug, cell: RunCell, log: &LogBuffer) -> Self {
        let message = if cell.running {
            format!("{} is currently {}", job, cell.state)
        } else {
            format!("No {} is currently running", job)
        };
        Self {
            job,
            running: cell.running,
            state: cell.state,
            run_id: cell.run_id,
            started_at: cell.started_at,
            finished_at: cell.finished_at,
            log: log.lines(),
            dropped_lines: log.dropped(),
            message,
        }
    }
}

/// Owns the lifecycle of one named background job.
///
/// At most one run is active at a time. Runs execute on a dedicated worker
/// thread; every other method returns without waiting for it.
pub struct JobRunner {
    shared: Arc<JobShared>,
    task: Arc<dyn Task>,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    pub fn new(name: Slug, task: impl Task) -> Self {
        Self::with_config(name, Arc::new(task), JobRunnerConfig::default())
    }

    pub fn with_config(name: Slug, task: Arc<dyn Task>, config: JobRunnerConfig) -> Self {
        Self {
            shared: Arc::new(JobShared::new(name, config.log_capacity)),
            task,
        }
    }

    pub fn name(&self) -> &Slug {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn phases(&self) -> Vec<PhaseInfo> {
        self.task.phases()
    }

    /// Run the task's health check on the calling thread without starting a run.
    pub fn preflight(&self) -> Result<(), JobError> {
        self.task.preflight().map_err(JobError::Preflight)
    }

    /// Start a new run in the background.
    ///
    /// The task's preflight check runs first, on the calling thread. On success
    /// the log is cleared, the state becomes `starting` and the worker thread is
    /// spawned; progress is observed through [`status`](Self::status).
    pub fn start(&self) -> Result<Uuid, JobError> {
        if self.is_running() {
            return Err(JobError::AlreadyRunning(self.name().clone()));
        }

        self.preflight()?;

        let run_id = self
            .shared
            .begin(JobState::Starting, true)
            .ok_or_else(|| JobError::AlreadyRunning(self.name().clone()))?;

        let shared = self.shared.clone();
        let task = self.task.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", self.name()))
            .spawn(move || run_worker(shared, task, run_id));

        if let Err(e) = spawned {
            self.shared
                .log_line(LogLevel::Error, &format!("failed to spawn worker thread: {e}"));
            self.shared.finish(JobState::Error);
            return Err(JobError::Spawn(e));
        }

        info!(job = %self.name(), %run_id, "job started");
        Ok(run_id)
    }

    /// Ask the active run to stop at its next phase boundary.
    ///
    /// Always succeeds; without an active run this only sets the flag, which the
    /// next `start()` clears. In-flight work inside a phase is never interrupted.
    pub fn request_stop(&self) {
        if self.shared.request_stop() {
            info!(job = %self.name(), "stop requested");
            self.task.on_stop(&JobContext::new(self.shared.clone()));
        } else {
            debug!(job = %self.name(), "stop requested while idle");
        }
    }

    pub fn status(&self) -> JobSnapshot {
        let cell = self.shared.cell().clone();
        let log = self.shared.log();
        JobSnapshot::new(self.name().clone(), cell, &log)
    }

    /// Empty the log buffer, including lines of a run still in progress.
    pub fn clear_log(&self) {
        self.shared.log().clear();
        debug!(job = %self.name(), "log cleared");
    }

    /// Run one phase synchronously on the calling thread.
    ///
    /// Shares the single-flight gate with [`start`](Self::start) but keeps the
    /// existing log.
    pub fn run_phase(&self, phase: &str) -> Result<(), JobError> {
        if !self.task.phases().iter().any(|p| p.name == phase) {
            return Err(JobError::UnknownPhase {
                job: self.name().clone(),
                phase: phase.to_string(),
            });
        }

        let run_id = self
            .shared
            .begin(JobState::Phase(phase.to_string()), false)
            .ok_or_else(|| JobError::AlreadyRunning(self.name().clone()))?;

        let span = info_span!("job", job = %self.name(), %run_id, phase);
        let _entered = span.enter();
        let _guard = RunningGuard(&self.shared);
        let ctx = JobContext::new(self.shared.clone());

        ctx.info(format!("Running {phase} phase on its own"));
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.task.run_phase(phase, &ctx)))
            .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));

        match result {
            Ok(()) => {
                if !ctx.check_stop(phase) {
                    ctx.info(format!("{phase} phase completed"));
                    self.shared.finish(JobState::Finished);
                }
                Ok(())
            }
            Err(err) => {
                ctx.error(format!("{phase} phase failed: {err}"));
                self.shared.finish(JobState::Error);
                Err(JobError::PhaseFailed {
                    phase: phase.to_string(),
                    source: err,
                })
            }
        }
    }
}

fn run_worker(shared: Arc<JobShared>, task: Arc<dyn Task>, run_id: Uuid) {
    let span = info_span!("job", job = %shared.name, %run_id);
    let _entered = span.enter();
    let _guard = RunningGuard(&shared);
    let ctx = JobContext::new(shared.clone());
    let name = &shared.name;

    if ctx.check_stop("startup") {
        return;
    }
    ctx.info(format!("Starting {name} execution"));

    let result = panic::catch_unwind(AssertUnwindSafe(|| task.run(&ctx)))
        .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));

    match result {
        Ok(RunOutcome::Finished) => {
            ctx.info(format!("{name} execution completed successfully"));
            shared.finish(JobState::Finished);
        }
        Ok(RunOutcome::Stopped) => {
            // check_stop has normally ended the run already.
            if shared.is_running() {
                ctx.warn(format!("{name} stopped"));
                shared.finish(JobState::Stopped);
            }
        }
        Err(err) => {
            ctx.error(format!("{name} execution failed: {err}"));
            shared.finish(JobState::Error);
        }
    }
}
