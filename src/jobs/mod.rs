//! Job model - entries, snapshots and the registry that holds them

mod registry;
mod state;

pub use registry::JobRegistry;
pub use state::{InvalidTransition, JobState, Transition};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::worker::WorkerHandle;

/// Opaque, unique job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the external tool is asked to do
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobKind {
    /// Download a live stream to a file (stream copy, fixed frame rate)
    #[default]
    Capture,
    /// Clip a source file between two timestamps (ffmpeg time syntax)
    Cut { start: String, end: String },
}

/// A caller's request to start a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Stream address or source file path
    pub target: String,
    /// Destination file
    pub output_path: PathBuf,
    /// Tool binary override; `None` uses the default resolution
    pub tool_path: Option<PathBuf>,
    pub kind: JobKind,
}

impl JobRequest {
    pub fn capture(target: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            output_path: output_path.into(),
            tool_path: None,
            kind: JobKind::Capture,
        }
    }

    pub fn cut(
        source: impl Into<String>,
        output_path: impl Into<PathBuf>,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        Self {
            target: source.into(),
            output_path: output_path.into(),
            tool_path: None,
            kind: JobKind::Cut {
                start: start.into(),
                end: end.into(),
            },
        }
    }

    /// Override the tool binary. An empty path keeps the default.
    pub fn with_tool_path(mut self, tool_path: impl Into<PathBuf>) -> Self {
        let tool_path = tool_path.into();
        self.tool_path = if tool_path.as_os_str().is_empty() {
            None
        } else {
            Some(tool_path)
        };
        self
    }
}

impl std::fmt::Display for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.target, self.output_path.display())
    }
}

/// One requested capture/transcode operation, as tracked by the registry
///
/// The worker handle is present exactly while the job is active; every
/// state change goes through the `mark_*`/`finish` methods, which keep that
/// invariant.
#[derive(Debug)]
pub struct JobEntry {
    pub id: JobId,
    pub target: String,
    pub output_path: PathBuf,
    pub tool_path: Option<PathBuf>,
    pub kind: JobKind,
    state: JobState,
    worker: Option<WorkerHandle>,
    last_error: Option<String>,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobEntry {
    /// Create an `Idle` entry for a request
    pub fn new(id: JobId, request: &JobRequest) -> Self {
        Self {
            id,
            target: request.target.clone(),
            output_path: request.output_path.clone(),
            tool_path: request.tool_path.clone(),
            kind: request.kind.clone(),
            state: JobState::Idle,
            worker: None,
            last_error: None,
            pid: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Attach the worker that will run this job (`Idle -> Starting`)
    pub fn mark_starting(&mut self, worker: WorkerHandle) -> Result<(), InvalidTransition> {
        self.state = self.state.next(Transition::Dispatch)?;
        self.worker = Some(worker);
        Ok(())
    }

    /// The tool process is up (`Starting -> Running`; a job already
    /// `Stopping` stays there and only records the pid)
    pub fn mark_running(&mut self, pid: Option<u32>) -> Result<(), InvalidTransition> {
        self.state = self.state.next(Transition::Spawned)?;
        self.pid = pid;
        Ok(())
    }

    /// A stop was requested (`Starting|Running -> Stopping`)
    pub fn mark_stopping(&mut self) -> Result<(), InvalidTransition> {
        self.state = self.state.next(Transition::StopRequested)?;
        Ok(())
    }

    /// Move to a terminal state and detach the worker
    ///
    /// `None` means graceful close (`Stopped`), `Some(detail)` means failure
    /// (`Errored`). The detached worker is returned so the caller can release it.
    pub fn finish(
        &mut self,
        error: Option<String>,
    ) -> Result<Option<WorkerHandle>, InvalidTransition> {
        let transition = if error.is_some() {
            Transition::Failed
        } else {
            Transition::Closed
        };
        self.state = self.state.next(transition)?;
        self.last_error = error;
        self.finished_at = Some(Utc::now());
        Ok(self.worker.take())
    }

    /// Read-only copy for observers
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            target: self.target.clone(),
            output_path: self.output_path.clone(),
            tool_path: self.tool_path.clone(),
            kind: self.kind.clone(),
            state: self.state,
            has_worker: self.worker.is_some(),
            pid: self.pid,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Immutable view of a job entry, handed out to everyone but the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub target: String,
    pub output_path: PathBuf,
    pub tool_path: Option<PathBuf>,
    pub kind: JobKind,
    pub state: JobState,
    pub has_worker: bool,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
