//! Single-flight background jobs with cooperative cancellation.
//!
//! ## Design
//!
//! - One [`JobRunner`] per named job type, created at startup and kept for the
//!   process lifetime (usually inside a [`JobRegistry`])
//! - A run executes a [`Task`] on its own worker thread; callers never block on it
//! - Stop requests are advisory: the task polls them at phase boundaries through
//!   [`JobContext::check_stop`] / [`JobContext::enter_phase`]
//! - Every run writes timestamped lines into a bounded [`LogBuffer`] that can be
//!   read or cleared at any time
//!
//! ## Components
//!
//! - `JobRunner`: start / stop / status / clear / single-phase runs
//! - `JobContext`: the handle a task uses to log and check for stop
//! - `Task`: the externally supplied work
//! - `PhasedTask`: a `Task` built from an ordered list of named phases

pub mod context;
pub mod log_buffer;
pub mod phased;
pub mod registry;
pub mod runner;
pub mod state;
pub mod task;

mod shared;

pub use context::JobContext;
pub use log_buffer::{LogBuffer, DEFAULT_LOG_CAPACITY};
pub use phased::PhasedTask;
pub use registry::JobRegistry;
pub use runner::{JobError, JobRunner, JobRunnerConfig, JobSnapshot};
pub use state::JobState;
pub use task::{PhaseInfo, RunOutcome, Task, TaskError};
