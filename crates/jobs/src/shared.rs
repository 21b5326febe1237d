//! State shared between a runner, its worker thread and status readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use redline_core::{LogLevel, Slug};

use crate::log_buffer::LogBuffer;
use crate::state::JobState;

/// `running` and `state` change together under one lock so that
/// `running == true` never coexists with a terminal state.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunCell {
    pub(crate) running: bool,
    pub(crate) state: JobState,
    pub(crate) run_id: Option<Uuid>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub(crate) struct JobShared {
    pub(crate) name: Slug,
    stop_requested: AtomicBool,
    cell: Mutex<RunCell>,
    log: Mutex<LogBuffer>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobShared {
    pub(crate) fn new(name: Slug, log_capacity: usize) -> Self {
        Self {
            name,
            stop_requested: AtomicBool::new(false),
            cell: Mutex::new(RunCell::default()),
            log: Mutex::new(LogBuffer::new(log_capacity)),
        }
    }

    pub(crate) fn cell(&self) -> MutexGuard<'_, RunCell> {
        lock(&self.cell)
    }

    pub(crate) fn log(&self) -> MutexGuard<'_, LogBuffer> {
        lock(&self.log)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Take the single-flight gate and reset per-run state.
    ///
    /// Returns `None` if a run is already active.
    pub(crate) fn begin(&self, initial: JobState, clear_log: bool) -> Option<Uuid> {
        let mut cell = self.cell();
        if cell.running {
            return None;
        }

        let run_id = Uuid::now_v7();
        self.stop_requested.store(false, Ordering::SeqCst);
        if clear_log {
            self.log().clear();
        }

        *cell = RunCell {
            running: true,
            state: initial,
            run_id: Some(run_id),
            started_at: Some(Utc::now()),
            finished_at: None,
        };
        Some(run_id)
    }

    /// Enter a phase, unless a stop has already flipped the state to `stopping`.
    pub(crate) fn set_phase(&self, phase: &str) {
        let mut cell = self.cell();
        if cell.running && !self.stop_requested() {
            cell.state = JobState::Phase(phase.to_string());
        }
    }

    /// Raise the stop flag and mark an active run as stopping.
    ///
    /// The flag is set under the cell lock, so a concurrent `begin` either
    /// clears it before this call or sees it raised for its own run. Returns
    /// `false` when nothing is running.
    pub(crate) fn request_stop(&self) -> bool {
        let mut cell = self.cell();
        self.stop_requested.store(true, Ordering::SeqCst);
        if cell.running {
            cell.state = JobState::Stopping;
        }
        cell.running
    }

    /// Release the gate with a terminal state.
    ///
    /// Returns `false` if the run had already ended.
    pub(crate) fn finish(&self, terminal: JobState) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut cell = self.cell();
        if !cell.running {
            return false;
        }
        cell.running = false;
        cell.state = terminal;
        cell.finished_at = Some(Utc::now());
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        self.cell().running
    }

    /// Append to the job log and mirror the line to tracing.
    pub(crate) fn log_line(&self, level: LogLevel, message: &str) {
        self.log().record(level, message);
        match level {
            LogLevel::Info => tracing::info!(job = %self.name, "{message}"),
            LogLevel::Warning => tracing::warn!(job = %self.name, "{message}"),
            LogLevel::Error => tracing::error!(job = %self.name, "{message}"),
        }
    }
}

/// Clears `running` when the worker leaves, whatever the exit path.
pub(crate) struct RunningGuard<'a>(pub(crate) &'a JobShared);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.0.finish(JobState::Error) {
            tracing::error!(job = %self.0.name, "worker exited without reaching a terminal state");
        }
    }
}
