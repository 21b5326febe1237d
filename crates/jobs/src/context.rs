//! Handle given to a running task.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use redline_core::{LogLevel, Slug};

use crate::shared::JobShared;
use crate::state::JobState;

/// Granularity at which [`JobContext::sleep`] notices a stop request.
const STOP_POLL_SLICE: Duration = Duration::from_millis(100);

/// Logging and cancellation surface for a [`Task`](crate::Task).
///
/// Cheap to clone; all clones refer to the same job.
#[derive(Debug, Clone)]
pub struct JobContext {
    shared: Arc<JobShared>,
}

impl JobContext {
    pub(crate) fn new(shared: Arc<JobShared>) -> Self {
        Self { shared }
    }

    pub fn job(&self) -> &Slug {
        &self.shared.name
    }

    /// Append a timestamped line to the job log (mirrored to tracing).
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        self.shared.log_line(level, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    /// Raw stop flag, for loops inside a phase that want to give up early.
    ///
    /// Reading it does not end the run; only [`check_stop`](Self::check_stop) does.
    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    /// Phase boundary check.
    ///
    /// If a stop was requested, logs a warning, ends the run as `stopped` and
    /// returns `true`; the task must return immediately.
    pub fn check_stop(&self, phase: &str) -> bool {
        if !self.stop_requested() {
            return false;
        }
        self.warn(format!("{} stopped during {} phase", self.job(), phase));
        self.shared.finish(JobState::Stopped);
        true
    }

    /// Boundary check followed by a state change to `phase`.
    ///
    /// `Break` means the run was stopped and `phase` was never entered.
    pub fn enter_phase(&self, phase: &str) -> ControlFlow<()> {
        if self.check_stop(phase) {
            return ControlFlow::Break(());
        }
        self.shared.set_phase(phase);
        tracing::debug!(job = %self.job(), phase, "entered phase");
        ControlFlow::Continue(())
    }

    /// Sleep up to `duration`, waking early on a stop request.
    ///
    /// Returns `true` if the sleep was cut short by a stop request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(STOP_POLL_SLICE));
        }
    }
}
