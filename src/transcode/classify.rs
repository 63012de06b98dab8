//! Exit classification for external tool processes
//!
//! The tool is opaque: when it dies we only have its exit status and the
//! last few lines it wrote to stderr. A stop is delivered as a signal, so
//! "I asked it to stop" and "it crashed" can only be told apart by looking
//! at how it exited and what it said on the way out.

use std::process::ExitStatus;

use super::process::STOP_KILLS;
use crate::error::ToolError;

/// ffmpeg exits with 255 when interrupted by SIGINT/SIGTERM
pub const FFMPEG_INTERRUPTED_EXIT_CODE: i32 = 255;

/// Messages ffmpeg prints when it shuts down on request
pub const DEFAULT_GRACEFUL_PATTERNS: &[&str] = &["Exiting normally", "Immediate exit requested"];

/// Final outcome of one tool invocation
#[derive(Debug)]
pub enum ToolOutcome {
    /// Source ended, or the tool stopped because we asked it to
    Close,
    /// Spawn failure or abnormal termination
    Error(ToolError),
}

impl ToolOutcome {
    #[cfg(test)]
    pub fn is_close(&self) -> bool {
        matches!(self, ToolOutcome::Close)
    }
}

/// How a tool process terminated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if it was killed (unix only)
    pub signal: Option<i32>,
    /// Last lines written to stderr
    pub stderr_tail: Vec<String>,
}

impl ToolExit {
    pub fn from_status(status: ExitStatus, stderr_tail: Vec<String>) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            stderr_tail,
        }
    }

    fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// Decides whether a finished tool process closed gracefully
#[derive(Debug, Clone)]
pub struct ExitClassifier {
    graceful_patterns: Vec<String>,
    /// A stop request ends the process outright, so any exit that follows
    /// one is a close
    stop_kills: bool,
}

impl Default for ExitClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_GRACEFUL_PATTERNS.iter().map(|p| p.to_string()))
    }
}

impl ExitClassifier {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            graceful_patterns: patterns
                .into_iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.to_lowercase())
                .collect(),
            stop_kills: STOP_KILLS,
        }
    }

    /// Override whether a stop request kills the process (the platform
    /// decides by default)
    #[cfg(test)]
    pub fn with_stop_kills(mut self, stop_kills: bool) -> Self {
        self.stop_kills = stop_kills;
        self
    }

    /// Classify a termination.
    ///
    /// Checked in order: a zero exit, then a signal/interrupt exit after we
    /// requested a stop (any exit, where a stop is a kill), then the stderr
    /// tail against the graceful patterns.
    /// Anything else is a runtime error.
    pub fn classify(&self, tool: &str, exit: ToolExit, stop_requested: bool) -> ToolOutcome {
        if exit.code == Some(0) {
            return ToolOutcome::Close;
        }

        if stop_requested
            && (self.stop_kills
                || exit.signal.is_some()
                || exit.code == Some(FFMPEG_INTERRUPTED_EXIT_CODE))
        {
            return ToolOutcome::Close;
        }

        if self.matches_graceful_message(&exit.stderr_tail) {
            return ToolOutcome::Close;
        }

        ToolOutcome::Error(ToolError::Runtime {
            tool: tool.to_string(),
            status: exit.describe(),
            stderr_tail: exit.stderr_tail,
        })
    }

    fn matches_graceful_message(&self, stderr_tail: &[String]) -> bool {
        stderr_tail.iter().any(|line| {
            let line = line.to_lowercase();
            self.graceful_patterns
                .iter()
                .any(|pattern| line.contains(pattern.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(code: Option<i32>, signal: Option<i32>, tail: &[&str]) -> ToolExit {
        ToolExit {
            code,
            signal,
            stderr_tail: tail.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_zero_exit_is_close() {
        let classifier = ExitClassifier::default();
        let outcome = classifier.classify("ffmpeg", exit(Some(0), None, &[]), false);
        assert!(outcome.is_close());
    }

    #[test]
    fn test_interrupt_after_stop_is_close() {
        let classifier = ExitClassifier::default();
        assert!(classifier
            .classify("ffmpeg", exit(Some(255), None, &[]), true)
            .is_close());
        assert!(classifier
            .classify("ffmpeg", exit(None, Some(15), &[]), true)
            .is_close());
    }

    #[test]
    fn test_killed_after_stop_is_close_where_stop_kills() {
        // TerminateProcess leaves exit code 1 and no signal
        let killing = ExitClassifier::default().with_stop_kills(true);
        assert!(killing
            .classify("ffmpeg", exit(Some(1), None, &[]), true)
            .is_close());
        assert!(!killing
            .classify("ffmpeg", exit(Some(1), None, &[]), false)
            .is_close());

        let signalling = ExitClassifier::default().with_stop_kills(false);
        assert!(!signalling
            .classify("ffmpeg", exit(Some(1), None, &[]), true)
            .is_close());
    }

    #[test]
    fn test_platform_default_stop_mode() {
        let classifier = ExitClassifier::default();
        assert_eq!(
            classifier
                .classify("ffmpeg", exit(Some(1), None, &[]), true)
                .is_close(),
            cfg!(not(unix))
        );
    }

    #[test]
    fn test_signal_without_stop_request_is_error() {
        let classifier = ExitClassifier::default();
        let outcome = classifier.classify("ffmpeg", exit(None, Some(9), &[]), false);
        match outcome {
            ToolOutcome::Error(ToolError::Runtime { status, .. }) => {
                assert_eq!(status, "signal 9");
            }
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_graceful_message_is_close() {
        let classifier = ExitClassifier::default();
        let outcome = classifier.classify(
            "ffmpeg",
            exit(
                Some(255),
                None,
                &["frame= 120 fps= 30", "Exiting normally, received signal 15."],
            ),
            false,
        );
        assert!(outcome.is_close());
    }

    #[test]
    fn test_unmatched_failure_keeps_stderr_tail() {
        let classifier = ExitClassifier::default();
        let outcome = classifier.classify(
            "ffmpeg",
            exit(Some(1), None, &["rtmp://x: Connection refused"]),
            false,
        );
        match outcome {
            ToolOutcome::Error(ToolError::Runtime {
                status,
                stderr_tail,
                ..
            }) => {
                assert_eq!(status, "exit code 1");
                assert_eq!(stderr_tail, vec!["rtmp://x: Connection refused"]);
            }
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_patterns_replace_defaults() {
        let classifier = ExitClassifier::new(vec!["Beendet".to_string(), "  ".to_string()]);
        assert!(classifier
            .classify("ffmpeg", exit(Some(1), None, &["Vorgang beendet"]), false)
            .is_close());
        assert!(!classifier
            .classify("ffmpeg", exit(Some(1), None, &["Exiting normally"]), false)
            .is_close());
    }
}
