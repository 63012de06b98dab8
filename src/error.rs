//! Error types for job supervision
//!
//! `JobError` is returned synchronously to callers of the supervisor API.
//! `ToolError` describes why an external tool invocation failed; it travels
//! asynchronously inside a worker `Error` event and ends up as the
//! `last_error` of the job entry.

use thiserror::Error;

use crate::jobs::{JobId, JobState};

/// Errors returned by supervisor operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The target already has a job in a non-terminal state
    #[error("target {target} already has an active job ({existing})")]
    DuplicateJob { target: String, existing: JobId },

    /// No job with this ID exists in the registry
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The operation is not valid for the job's current state
    #[error("cannot {operation} job {id} while it is {state}")]
    InvalidState {
        id: JobId,
        state: JobState,
        operation: &'static str,
    },

    /// The supervisor task has shut down
    #[error("job supervisor is not running")]
    SupervisorUnavailable,
}

/// Failure of a single external tool invocation
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool binary could not be launched (missing binary, permission)
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The output file's directory could not be created
    #[error("failed to create output directory {path:?}: {source}")]
    OutputDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The tool started but exited abnormally
    #[error("{tool} exited abnormally ({status}){}", format_tail(.stderr_tail))]
    Runtime {
        tool: String,
        status: String,
        stderr_tail: Vec<String>,
    },

    /// Waiting on the child process failed
    #[error("failed to wait for {tool}: {source}")]
    Wait {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

fn format_tail(lines: &[String]) -> String {
    match lines.last() {
        Some(last) => format!(": {}", last),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_includes_last_stderr_line() {
        let err = ToolError::Runtime {
            tool: "ffmpeg".to_string(),
            status: "exit code 1".to_string(),
            stderr_tail: vec![
                "Input #0, flv".to_string(),
                "Connection refused".to_string(),
            ],
        };

        assert_eq!(
            err.to_string(),
            "ffmpeg exited abnormally (exit code 1): Connection refused"
        );
    }

    #[test]
    fn test_invalid_state_message() {
        let err = JobError::InvalidState {
            id: JobId::from("abc"),
            state: JobState::Starting,
            operation: "stop",
        };
        assert_eq!(err.to_string(), "cannot stop job abc while it is starting");
    }
}
