//! Job lifecycle state machine
//!
//! ```text
//! Idle --(dispatch)--> Starting --(spawned)--> Running
//! Starting|Running --(stop requested)--> Stopping --(closed)--> Stopped
//! Stopping --(spawned)--> Stopping
//! Starting|Running --(closed)--> Stopped
//! Starting|Running|Stopping --(failed)--> Errored
//! ```
//!
//! `Stopped` and `Errored` are terminal: no transition leaves them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

/// Something that happened to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A worker was allocated and sent the start command
    Dispatch,
    /// The worker confirmed the tool process is running
    Spawned,
    /// The caller asked the job to stop
    StopRequested,
    /// The worker reported graceful completion
    Closed,
    /// The worker reported an error
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {transition:?} from state {from}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub transition: Transition,
}

impl JobState {
    /// `Stopped` or `Errored`
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Stopped | JobState::Errored)
    }

    /// States in which a worker is attached to the job
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Starting | JobState::Running | JobState::Stopping
        )
    }

    /// Compute the state reached by applying `transition`
    pub fn next(self, transition: Transition) -> Result<JobState, InvalidTransition> {
        use JobState::*;
        use Transition::*;

        let next = match (self, transition) {
            (Idle, Dispatch) => Starting,
            (Starting, Spawned) => Running,
            (Starting | Running, StopRequested) => Stopping,
            // Spawn confirmation for a job stopped before it was confirmed
            (Stopping, Spawned) => Stopping,
            (Starting | Running | Stopping, Closed) => Stopped,
            (Starting | Running | Stopping, Failed) => Errored,
            (from, transition) => return Err(InvalidTransition { from, transition }),
        };

        Ok(next)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Stopping => "stopping",
            JobState::Stopped => "stopped",
            JobState::Errored => "errored",
        };
        f.write_str(name)
    }
}
