//! Job supervisor - the single owner of the job registry
//!
//! Callers hold a cloneable `SupervisorHandle`. Every operation is sent as a
//! command to the supervisor task, which serializes API calls and worker
//! events through one loop, so the registry never needs a lock.

mod engine;

pub use engine::JobSupervisor;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::JobError;
use crate::jobs::{JobId, JobRequest, JobSnapshot};

/// Capacity of the caller -> supervisor command channel
const COMMAND_BUFFER: usize = 64;

/// Capacity of the registry change broadcast
const CHANGE_BUFFER: usize = 256;

/// Commands that can be sent to the supervisor
#[derive(Debug)]
pub(crate) enum SupervisorCommand {
    Start {
        request: JobRequest,
        reply: oneshot::Sender<Result<JobId, JobError>>,
    },
    Stop {
        id: JobId,
        reply: oneshot::Sender<Result<StopAck, JobError>>,
    },
    Acknowledge {
        id: JobId,
        reply: oneshot::Sender<Result<JobSnapshot, JobError>>,
    },
    Get {
        id: JobId,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    List {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    /// Stop everything, wait for the jobs to finish, then exit
    Shutdown {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
}

/// Result of a successful `stop_job`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAck {
    /// The job moved to `Stopping` and the worker was told to stop
    Requested,
    /// A stop was already in flight
    AlreadyStopping,
    /// The job had already finished
    AlreadyFinished,
}

/// Registry change notifications for observers
#[derive(Debug, Clone)]
pub enum RegistryChange {
    /// An entry was created or changed state
    Updated(JobSnapshot),
    /// An entry was removed
    Removed(JobId),
}

/// Create the channels that connect handles to the supervisor task
pub(crate) fn create_supervisor_channels() -> (
    mpsc::Sender<SupervisorCommand>,
    mpsc::Receiver<SupervisorCommand>,
    broadcast::Sender<RegistryChange>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (change_tx, _) = broadcast::channel(CHANGE_BUFFER);
    (cmd_tx, cmd_rx, change_tx)
}

/// Cloneable client of the supervisor task
#[derive(Clone)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    change_tx: broadcast::Sender<RegistryChange>,
}

impl SupervisorHandle {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<SupervisorCommand>,
        change_tx: broadcast::Sender<RegistryChange>,
    ) -> Self {
        Self { cmd_tx, change_tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, JobError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| JobError::SupervisorUnavailable)?;
        reply_rx.await.map_err(|_| JobError::SupervisorUnavailable)
    }

    /// Start a job. Returns as soon as the worker has been dispatched.
    pub async fn start_job(&self, request: JobRequest) -> Result<JobId, JobError> {
        self.request(|reply| SupervisorCommand::Start { request, reply })
            .await?
    }

    /// Ask a running job to stop. Completion arrives later as a state change.
    pub async fn stop_job(&self, id: &JobId) -> Result<StopAck, JobError> {
        let id = id.clone();
        self.request(|reply| SupervisorCommand::Stop { id, reply })
            .await?
    }

    /// Remove a finished job from the registry, returning its final snapshot
    pub async fn acknowledge(&self, id: &JobId) -> Result<JobSnapshot, JobError> {
        let id = id.clone();
        self.request(|reply| SupervisorCommand::Acknowledge { id, reply })
            .await?
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<JobSnapshot>, JobError> {
        let id = id.clone();
        self.request(|reply| SupervisorCommand::Get { id, reply })
            .await
    }

    /// Snapshot of every job, oldest first
    pub async fn list(&self) -> Result<Vec<JobSnapshot>, JobError> {
        self.request(|reply| SupervisorCommand::List { reply }).await
    }

    /// Stop all jobs and end the supervisor; returns the final snapshots
    pub async fn shutdown(&self) -> Result<Vec<JobSnapshot>, JobError> {
        self.request(|reply| SupervisorCommand::Shutdown { reply })
            .await
    }

    /// Resolves once the supervisor task has exited
    pub async fn closed(&self) {
        self.cmd_tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Subscribe to registry changes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.change_tx.subscribe()
    }
}
