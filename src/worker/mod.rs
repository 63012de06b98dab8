//! Worker handles - one isolated task per job
//!
//! A worker owns one `TranscodeAdapter` invocation for its whole life. The
//! supervisor talks to it only through messages: commands go in over an
//! unbounded channel, lifecycle events come back tagged with the job ID.
//! Once a worker has emitted its terminal event it exits, and any command
//! sent afterwards is dropped.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::jobs::{JobId, JobKind, JobRequest};
use crate::transcode::{ToolOutcome, TranscodeAdapter};

/// Parameters of the `start` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub target: String,
    pub output_path: PathBuf,
    pub tool_path: Option<PathBuf>,
    pub kind: JobKind,
}

impl From<&JobRequest> for StartRequest {
    fn from(request: &JobRequest) -> Self {
        Self {
            target: request.target.clone(),
            output_path: request.output_path.clone(),
            tool_path: request.tool_path.clone(),
            kind: request.kind.clone(),
        }
    }
}

/// Supervisor -> worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerCommand {
    Start(StartRequest),
    Stop,
}

/// Worker -> supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerEvent {
    /// The tool process is running
    Spawned { pid: Option<u32> },
    /// Graceful completion (terminal)
    Close,
    /// Spawn failure or abnormal exit (terminal)
    Error { error: String },
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Close | WorkerEvent::Error { .. })
    }
}

/// An event together with the job it belongs to
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    pub job_id: JobId,
    pub event: WorkerEvent,
}

/// Supervisor-side handle to a worker task
#[derive(Debug)]
pub struct WorkerHandle {
    job_id: JobId,
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a worker task for `job_id`. Events are delivered on `events_tx`.
    pub fn spawn(
        job_id: JobId,
        adapter: TranscodeAdapter,
        events_tx: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(job_id.clone(), adapter, cmd_rx, events_tx));

        Self {
            job_id,
            cmd_tx,
            task: Some(task),
        }
    }

    /// Handle with no task behind it; the caller gets the command receiver
    #[cfg(test)]
    pub(crate) fn detached(job_id: JobId) -> (Self, mpsc::UnboundedReceiver<WorkerCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                job_id,
                cmd_tx,
                task: None,
            },
            cmd_rx,
        )
    }

    /// Fire-and-forget. Returns false if the worker has already exited.
    pub fn send(&self, command: WorkerCommand) -> bool {
        match self.cmd_tx.send(command) {
            Ok(()) => true,
            Err(e) => {
                debug!("Worker for job {} is gone, dropping {:?}", self.job_id, e.0);
                false
            }
        }
    }

    /// Let go of the worker after its terminal event
    ///
    /// The task has already finished or is about to; it is detached rather
    /// than awaited so the supervisor never blocks on it.
    pub fn release(mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!("Worker for job {} still winding down", self.job_id);
            }
        }
    }
}

async fn emit(events_tx: &mpsc::Sender<WorkerMessage>, job_id: &JobId, event: WorkerEvent) {
    let message = WorkerMessage {
        job_id: job_id.clone(),
        event,
    };
    if events_tx.send(message).await.is_err() {
        debug!("Supervisor gone, event for job {} discarded", job_id);
    }
}

async fn run_worker(
    job_id: JobId,
    adapter: TranscodeAdapter,
    mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    events_tx: mpsc::Sender<WorkerMessage>,
) {
    let request = loop {
        match cmd_rx.recv().await {
            Some(WorkerCommand::Start(request)) => break request,
            Some(WorkerCommand::Stop) => {
                debug!("Job {} stopped before it was started", job_id);
                emit(&events_tx, &job_id, WorkerEvent::Close).await;
                return;
            }
            None => return,
        }
    };

    let mut process = match adapter.start(&request).await {
        Ok(process) => process,
        Err(e) => {
            warn!("Job {} failed to start: {}", job_id, e);
            emit(&events_tx, &job_id, WorkerEvent::Error { error: e.to_string() }).await;
            return;
        }
    };

    info!(
        "Job {} running: {} -> {:?} (pid {:?})",
        job_id,
        request.target,
        request.output_path,
        process.pid()
    );
    emit(&events_tx, &job_id, WorkerEvent::Spawned { pid: process.pid() }).await;

    let mut commands_open = true;
    let mut kill_deadline: Option<Instant> = None;
    let mut killed = false;

    let status = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(WorkerCommand::Stop) => {}
                    Some(WorkerCommand::Start(_)) => {
                        warn!("Job {} is already started, ignoring start command", job_id);
                        continue;
                    }
                    None => {
                        debug!("Supervisor dropped job {}, stopping the tool", job_id);
                        commands_open = false;
                    }
                }
                if !process.stop_requested() {
                    info!("Stopping job {}", job_id);
                    process.request_stop();
                    kill_deadline = Some(Instant::now() + adapter.stop_grace_period());
                }
            }

            _ = async {
                match kill_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            }, if !killed => {
                process.force_kill();
                killed = true;
            }

            status = process.wait() => break status,
        }
    };

    let event = match process.into_outcome(status).await {
        ToolOutcome::Close => {
            info!("Job {} closed", job_id);
            WorkerEvent::Close
        }
        ToolOutcome::Error(e) => {
            warn!("Job {} failed: {}", job_id, e);
            WorkerEvent::Error {
                error: e.to_string(),
            }
        }
    };
    emit(&events_tx, &job_id, event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let start = WorkerCommand::Start(StartRequest {
            target: "streamA".to_string(),
            output_path: PathBuf::from("/out/a.mp4"),
            tool_path: Some(PathBuf::from("/usr/bin/ffmpeg")),
            kind: JobKind::Capture,
        });
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["target"], "streamA");
        assert_eq!(json["outputPath"], "/out/a.mp4");
        assert_eq!(json["toolPath"], "/usr/bin/ffmpeg");

        let stop = serde_json::to_value(&WorkerCommand::Stop).unwrap();
        assert_eq!(stop, serde_json::json!({"type": "stop"}));
    }

    #[test]
    fn test_event_wire_format() {
        let close = serde_json::to_value(&WorkerEvent::Close).unwrap();
        assert_eq!(close, serde_json::json!({"type": "close"}));

        let error: WorkerEvent =
            serde_json::from_value(serde_json::json!({"type": "error", "error": "spawn failed"}))
                .unwrap();
        assert_eq!(
            error,
            WorkerEvent::Error {
                error: "spawn failed".to_string()
            }
        );
        assert!(error.is_terminal());
        assert!(!WorkerEvent::Spawned { pid: None }.is_terminal());
    }

    #[test]
    fn test_send_after_exit_is_dropped() {
        let (handle, cmd_rx) = WorkerHandle::detached(JobId::from("gone"));
        drop(cmd_rx);

        assert!(!handle.send(WorkerCommand::Stop));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::transcode::testing::shell_adapter;
        use std::time::Duration;

        async fn next_event(rx: &mut mpsc::Receiver<WorkerMessage>) -> WorkerEvent {
            tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for worker event")
                .expect("event channel closed")
                .event
        }

        fn start(dir: &tempfile::TempDir) -> WorkerCommand {
            WorkerCommand::Start(StartRequest {
                target: "streamA".to_string(),
                output_path: dir.path().join("a.mp4"),
                tool_path: None,
                kind: JobKind::Capture,
            })
        }

        #[tokio::test]
        async fn test_stop_yields_single_close() {
            let dir = tempfile::tempdir().unwrap();
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let handle = WorkerHandle::spawn(
                JobId::from("1"),
                shell_adapter("exec sleep 30"),
                events_tx,
            );

            handle.send(start(&dir));
            assert!(matches!(
                next_event(&mut events_rx).await,
                WorkerEvent::Spawned { pid: Some(_) }
            ));

            handle.send(WorkerCommand::Stop);
            handle.send(WorkerCommand::Stop);
            assert_eq!(next_event(&mut events_rx).await, WorkerEvent::Close);

            // Worker is gone: the channel closes without a second terminal event
            let after = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
                .await
                .unwrap();
            assert!(after.is_none());
            handle.send(WorkerCommand::Stop);
            handle.release();
        }

        #[tokio::test]
        async fn test_stop_before_start_closes_without_spawning() {
            let dir = tempfile::tempdir().unwrap();
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let handle = WorkerHandle::spawn(
                JobId::from("5"),
                shell_adapter("exec sleep 30"),
                events_tx,
            );

            handle.send(WorkerCommand::Stop);
            assert_eq!(next_event(&mut events_rx).await, WorkerEvent::Close);

            // Worker exits without ever launching the tool
            let after = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
                .await
                .unwrap();
            assert!(after.is_none());
            handle.send(start(&dir));
            assert!(!dir.path().join("a.mp4").exists());
        }

        #[tokio::test]
        async fn test_stop_queued_behind_start() {
            let dir = tempfile::tempdir().unwrap();
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let handle = WorkerHandle::spawn(
                JobId::from("6"),
                shell_adapter("exec sleep 30"),
                events_tx,
            );

            handle.send(start(&dir));
            handle.send(WorkerCommand::Stop);

            assert!(matches!(
                next_event(&mut events_rx).await,
                WorkerEvent::Spawned { .. }
            ));
            assert_eq!(next_event(&mut events_rx).await, WorkerEvent::Close);
        }

        #[tokio::test]
        async fn test_spawn_failure_is_error_without_spawned() {
            let dir = tempfile::tempdir().unwrap();
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let handle = WorkerHandle::spawn(JobId::from("2"), shell_adapter("exit 0"), events_tx);

            handle.send(WorkerCommand::Start(StartRequest {
                target: "streamB".to_string(),
                output_path: dir.path().join("b.mp4"),
                tool_path: Some(PathBuf::from("/nonexistent/ffmpeg")),
                kind: JobKind::Capture,
            }));

            match next_event(&mut events_rx).await {
                WorkerEvent::Error { error } => assert!(error.contains("failed to spawn")),
                other => panic!("expected error event, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_stubborn_process_is_killed_after_grace_period() {
            let dir = tempfile::tempdir().unwrap();
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let adapter = crate::transcode::TranscodeAdapter::new(
                std::sync::Arc::new(crate::transcode::testing::ShellProfile::new(
                    "trap '' TERM; while true; do sleep 0.1; done",
                )),
                crate::transcode::ExitClassifier::default(),
                Duration::from_millis(200),
            );
            let handle = WorkerHandle::spawn(JobId::from("3"), adapter, events_tx);

            handle.send(start(&dir));
            assert!(matches!(
                next_event(&mut events_rx).await,
                WorkerEvent::Spawned { .. }
            ));

            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.send(WorkerCommand::Stop);
            assert_eq!(next_event(&mut events_rx).await, WorkerEvent::Close);
        }

        #[tokio::test]
        async fn test_dropping_handle_stops_the_tool() {
            let dir = tempfile::tempdir().unwrap();
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let handle = WorkerHandle::spawn(
                JobId::from("4"),
                shell_adapter("exec sleep 30"),
                events_tx,
            );

            handle.send(start(&dir));
            next_event(&mut events_rx).await;
            drop(handle);

            assert_eq!(next_event(&mut events_rx).await, WorkerEvent::Close);
        }
    }
}
