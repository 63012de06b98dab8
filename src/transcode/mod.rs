//! Transcode adapter - one external tool invocation per job
//!
//! The adapter turns a `StartRequest` into a running tool process and,
//! once that process is gone, into exactly one `ToolOutcome`. It knows
//! nothing about the supervisor; the worker drives it.

mod classify;
mod ffmpeg;
mod process;

pub use classify::{ExitClassifier, ToolExit, ToolOutcome, DEFAULT_GRACEFUL_PATTERNS};
pub use ffmpeg::FfmpegProfile;

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::ToolError;
use crate::worker::StartRequest;

/// Number of stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on waiting for stderr after exit (grandchildren may hold the pipe)
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a specific tool is invoked
pub trait ToolProfile: Send + Sync {
    /// Short tool name for logs
    fn name(&self) -> &str;

    /// Binary used when the request carries no override
    fn default_program(&self) -> PathBuf;

    /// Full argument list for a request
    fn arguments(&self, request: &StartRequest) -> Vec<OsString>;
}

/// Launches tool processes; cheap to clone, one clone per worker
#[derive(Clone)]
pub struct TranscodeAdapter {
    profile: Arc<dyn ToolProfile>,
    classifier: Arc<ExitClassifier>,
    stop_grace_period: Duration,
}

impl TranscodeAdapter {
    pub fn new(
        profile: Arc<dyn ToolProfile>,
        classifier: ExitClassifier,
        stop_grace_period: Duration,
    ) -> Self {
        Self {
            profile,
            classifier: Arc::new(classifier),
            stop_grace_period,
        }
    }

    /// ffmpeg adapter configured from the user config
    pub fn ffmpeg(config: &Config) -> Self {
        Self::new(
            Arc::new(FfmpegProfile::new(config.tools.ffmpeg_path.as_deref())),
            ExitClassifier::new(config.classifier.graceful_patterns.clone()),
            config.supervisor.stop_grace_period(),
        )
    }

    /// How long a stopped process gets before it is killed outright
    pub fn stop_grace_period(&self) -> Duration {
        self.stop_grace_period
    }

    /// Spawn the tool for `request`
    pub async fn start(&self, request: &StartRequest) -> Result<ToolProcess, ToolError> {
        let program = request
            .tool_path
            .clone()
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(|| self.profile.default_program());
        let tool = program.display().to_string();

        if let Some(parent) = request.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| ToolError::OutputDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let mut cmd = Command::new(&program);
        cmd.args(self.profile.arguments(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process::configure_command(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: tool.clone(),
            source,
        })?;

        let pid = child.id();
        debug!(
            "Spawned {} (pid {:?}) for {} -> {:?}",
            self.profile.name(),
            pid,
            request.target,
            request.output_path
        );

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr_tail(stderr, tool.clone())));

        Ok(ToolProcess {
            tool,
            child,
            pid,
            stderr_task,
            stop_requested: false,
            classifier: self.classifier.clone(),
        })
    }
}

/// A running tool process owned by exactly one worker
pub struct ToolProcess {
    tool: String,
    child: Child,
    pid: Option<u32>,
    stderr_task: Option<JoinHandle<Vec<String>>>,
    stop_requested: bool,
    classifier: Arc<ExitClassifier>,
}

impl ToolProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Send a termination signal; confirmation comes from `wait`
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
        if let Err(e) = process::terminate(&mut self.child) {
            warn!("Failed to signal {} (pid {:?}): {}", self.tool, self.pid, e);
        }
    }

    /// Kill the process outright
    pub fn force_kill(&mut self) {
        warn!(
            "{} (pid {:?}) ignored the stop request, killing it",
            self.tool, self.pid
        );
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to kill {} (pid {:?}): {}", self.tool, self.pid, e);
        }
    }

    /// Wait for the process to exit. Cancel-safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Turn the exit status into the invocation's single outcome
    pub async fn into_outcome(mut self, status: std::io::Result<ExitStatus>) -> ToolOutcome {
        let stderr_tail = match self.stderr_task.take() {
            Some(task) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    debug!("{} stderr still open after exit, giving up on it", self.tool);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        match status {
            Ok(status) => self.classifier.classify(
                &self.tool,
                ToolExit::from_status(status, stderr_tail),
                self.stop_requested,
            ),
            Err(source) => ToolOutcome::Error(ToolError::Wait {
                tool: self.tool,
                source,
            }),
        }
    }
}

async fn collect_stderr_tail(stderr: ChildStderr, tool: String) -> Vec<String> {
    let mut reader = BufReader::new(stderr);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                trace!("[{}] {}", tool, line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                debug!("Stopped reading {} stderr: {}", tool, e);
                break;
            }
        }
    }

    tail.into()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shell-script tool profile used in place of ffmpeg by tests

    use super::*;

    pub struct ShellProfile {
        script: String,
    }

    impl ShellProfile {
        pub fn new(script: &str) -> Self {
            Self {
                script: script.to_string(),
            }
        }
    }

    impl ToolProfile for ShellProfile {
        fn name(&self) -> &str {
            "sh"
        }

        fn default_program(&self) -> PathBuf {
            PathBuf::from("sh")
        }

        fn arguments(&self, _request: &StartRequest) -> Vec<OsString> {
            vec!["-c".into(), self.script.clone().into()]
        }
    }

    pub fn shell_adapter(script: &str) -> TranscodeAdapter {
        TranscodeAdapter::new(
            Arc::new(ShellProfile::new(script)),
            ExitClassifier::default(),
            Duration::from_secs(2),
        )
    }
}
