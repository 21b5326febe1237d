//! Observable job state.

use core::fmt;

use serde::{Serialize, Serializer};

/// State of a job runner as reported by `status()`.
///
/// ```text
/// idle -> starting -> phase_1 -> ... -> phase_n -> finished
///            |           |                 |
///            +-----------+--> stopping --> stopped
///                        +--> error
/// ```
///
/// `Idle`, `Stopped`, `Finished` and `Error` end a run; the next `start()`
/// moves back to `Starting`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Idle,
    Starting,
    /// A task-defined phase is executing.
    Phase(String),
    /// A stop was requested; the worker has not reached a boundary yet.
    Stopping,
    Stopped,
    Finished,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Idle => "idle",
            JobState::Starting => "starting",
            JobState::Phase(name) => name,
            JobState::Stopping => "stopping",
            JobState::Stopped => "stopped",
            JobState::Finished => "finished",
            JobState::Error => "error",
        }
    }

    /// Whether this state can only be observed while no run is active.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Idle | JobState::Stopped | JobState::Finished | JobState::Error
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
