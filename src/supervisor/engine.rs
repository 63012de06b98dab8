//! Supervisor task
//!
//! Owns the registry and every worker handle. API calls arrive on the
//! command channel, lifecycle events on the worker event channel; both are
//! handled one at a time by `run`, which is what keeps the registry
//! consistent without locks.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    create_supervisor_channels, RegistryChange, StopAck, SupervisorCommand, SupervisorHandle,
};
use crate::config::SupervisorConfig;
use crate::error::JobError;
use crate::jobs::{
    InvalidTransition, JobEntry, JobId, JobRegistry, JobRequest, JobSnapshot, JobState,
};
use crate::transcode::TranscodeAdapter;
use crate::worker::{StartRequest, WorkerCommand, WorkerEvent, WorkerHandle, WorkerMessage};

/// Pending shutdown: who to answer and when to give up waiting
struct ShutdownState {
    deadline: Instant,
    replies: Vec<oneshot::Sender<Vec<JobSnapshot>>>,
}

/// The job supervisor
pub struct JobSupervisor {
    /// Authoritative job ledger
    registry: JobRegistry,
    /// Tool launcher handed to each new worker
    adapter: TranscodeAdapter,
    /// Tuning
    settings: SupervisorConfig,
    /// Command receiver
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
    /// Registry change broadcaster
    change_tx: broadcast::Sender<RegistryChange>,
    /// Cloned into every worker
    events_tx: mpsc::Sender<WorkerMessage>,
    /// Lifecycle events from all workers
    events_rx: mpsc::Receiver<WorkerMessage>,
}

impl JobSupervisor {
    /// Create a supervisor bound to an existing command channel
    pub(crate) fn new(
        settings: SupervisorConfig,
        adapter: TranscodeAdapter,
        cmd_rx: mpsc::Receiver<SupervisorCommand>,
        change_tx: broadcast::Sender<RegistryChange>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(settings.event_buffer.max(1));

        Self {
            registry: JobRegistry::new(),
            adapter,
            settings,
            cmd_rx,
            change_tx,
            events_tx,
            events_rx,
        }
    }

    /// Spawn the supervisor task on the current runtime
    pub fn spawn(
        settings: SupervisorConfig,
        adapter: TranscodeAdapter,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx, change_tx) = create_supervisor_channels();
        let supervisor = Self::new(settings, adapter, cmd_rx, change_tx.clone());
        let task = tokio::spawn(supervisor.run());
        (SupervisorHandle::new(cmd_tx, change_tx), task)
    }

    /// Run the supervisor main loop until shutdown
    pub async fn run(mut self) {
        info!("Job supervisor started");

        let mut shutdown: Option<ShutdownState> = None;
        let mut commands_open = true;

        loop {
            if shutdown.is_some() && self.registry.active_count() == 0 {
                break;
            }
            let deadline = shutdown.as_ref().map(|s| s.deadline);

            tokio::select! {
                cmd = self.cmd_rx.recv(), if commands_open => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd, &mut shutdown),
                        None => {
                            debug!("All supervisor handles dropped");
                            commands_open = false;
                            if shutdown.is_none() {
                                shutdown = Some(self.begin_shutdown());
                            }
                        }
                    }
                }

                Some(message) = self.events_rx.recv() => {
                    self.on_worker_event(message.job_id, message.event);
                }

                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    warn!(
                        "Shutdown timed out with {} jobs still active",
                        self.registry.active_count()
                    );
                    break;
                }
            }
        }

        let snapshots = self.registry.list();
        if let Some(state) = shutdown {
            for reply in state.replies {
                let _ = reply.send(snapshots.clone());
            }
        }

        if self.registry.is_empty() {
            info!("Job supervisor stopped");
        } else {
            info!("Job supervisor stopped ({} jobs on record)", self.registry.len());
        }
    }

    fn handle_command(&mut self, cmd: SupervisorCommand, shutdown: &mut Option<ShutdownState>) {
        match cmd {
            SupervisorCommand::Start { request, reply } => {
                let result = if shutdown.is_some() {
                    Err(JobError::SupervisorUnavailable)
                } else {
                    self.start_job(request)
                };
                let _ = reply.send(result);
            }
            SupervisorCommand::Stop { id, reply } => {
                let _ = reply.send(self.stop_job(&id));
            }
            SupervisorCommand::Acknowledge { id, reply } => {
                let _ = reply.send(self.acknowledge(&id));
            }
            SupervisorCommand::Get { id, reply } => {
                let _ = reply.send(self.registry.get(&id).map(JobEntry::snapshot));
            }
            SupervisorCommand::List { reply } => {
                let _ = reply.send(self.registry.list());
            }
            SupervisorCommand::Shutdown { reply } => {
                let state = shutdown.get_or_insert_with(|| self.begin_shutdown());
                state.replies.push(reply);
            }
        }
    }

    /// Create a job for `request` and dispatch its worker
    pub(crate) fn start_job(&mut self, request: JobRequest) -> Result<JobId, JobError> {
        if let Some(existing) = self.registry.find_active_by_target(&request.target) {
            warn!(
                "Refusing duplicate job for {}: job {} is {}",
                request.target,
                existing.id,
                existing.state()
            );
            return Err(JobError::DuplicateJob {
                target: request.target,
                existing: existing.id.clone(),
            });
        }

        let mut id = JobId::new();
        while self.registry.contains(&id) {
            id = JobId::new();
        }

        let mut entry = JobEntry::new(id.clone(), &request);
        let worker = WorkerHandle::spawn(id.clone(), self.adapter.clone(), self.events_tx.clone());
        worker.send(WorkerCommand::Start(StartRequest::from(&request)));
        entry
            .mark_starting(worker)
            .map_err(|e| invalid_state(&id, e, "start"))?;

        info!(
            "Job {} created for {} -> {:?}",
            id, request.target, request.output_path
        );
        self.registry.upsert(entry);
        self.publish(&id);

        Ok(id)
    }

    /// Ask an active job to stop
    ///
    /// A job still `Starting` goes straight to `Stopping`: its worker gets
    /// the stop right behind the start and ends the tool as soon as it runs.
    pub(crate) fn stop_job(&mut self, id: &JobId) -> Result<StopAck, JobError> {
        let entry = self
            .registry
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.clone()))?;

        let ack = match entry.state() {
            JobState::Starting | JobState::Running => {
                entry
                    .mark_stopping()
                    .map_err(|e| invalid_state(id, e, "stop"))?;
                if let Some(worker) = entry.worker() {
                    worker.send(WorkerCommand::Stop);
                }
                StopAck::Requested
            }
            JobState::Stopping => return Ok(StopAck::AlreadyStopping),
            JobState::Stopped | JobState::Errored => return Ok(StopAck::AlreadyFinished),
            state @ JobState::Idle => {
                return Err(JobError::InvalidState {
                    id: id.clone(),
                    state,
                    operation: "stop",
                });
            }
        };

        info!("Stop requested for job {}", id);
        self.publish(id);
        Ok(ack)
    }

    /// Remove a finished job from the registry
    pub(crate) fn acknowledge(
        &mut self,
        id: &JobId,
    ) -> Result<JobSnapshot, JobError> {
        let state = self
            .registry
            .get(id)
            .map(JobEntry::state)
            .ok_or_else(|| JobError::NotFound(id.clone()))?;

        if !state.is_terminal() {
            return Err(JobError::InvalidState {
                id: id.clone(),
                state,
                operation: "acknowledge",
            });
        }

        let entry = self
            .registry
            .remove(id)
            .ok_or_else(|| JobError::NotFound(id.clone()))?;
        let _ = self.change_tx.send(RegistryChange::Removed(id.clone()));
        Ok(entry.snapshot())
    }

    /// Apply a worker lifecycle event to the registry
    pub(crate) fn on_worker_event(&mut self, id: JobId, event: WorkerEvent) {
        let Some(entry) = self.registry.get_mut(&id) else {
            warn!("Dropping {:?} for unknown job {}", event, id);
            return;
        };

        if entry.state().is_terminal() {
            warn!(
                "Ignoring {:?} for job {} which already {}",
                event,
                id,
                entry.state()
            );
            return;
        }

        let terminal = event.is_terminal();
        let result = match event {
            WorkerEvent::Spawned { pid } => entry.mark_running(pid),
            WorkerEvent::Close => entry.finish(None).map(release_worker),
            WorkerEvent::Error { error } => entry.finish(Some(error)).map(release_worker),
        };

        if let Err(e) = result {
            warn!("Job {}: {}", id, e);
            return;
        }

        let state = entry.state();
        match state {
            JobState::Stopped => info!("Job {} stopped", id),
            JobState::Errored => warn!(
                "Job {} errored: {}",
                id,
                entry.last_error().unwrap_or("unknown error")
            ),
            _ => debug!("Job {} is {}", id, state),
        }
        self.publish(&id);

        if terminal && !self.settings.retain_terminal {
            for removed in self.registry.prune_terminal() {
                let _ = self.change_tx.send(RegistryChange::Removed(removed));
            }
        }
    }

    /// Stop every active job; returns the state that tracks the wait
    fn begin_shutdown(&mut self) -> ShutdownState {
        let active = self.registry.active_ids();
        info!("Shutting down, stopping {} active jobs", active.len());

        for id in active {
            if let Err(e) = self.stop_job(&id) {
                warn!("Failed to stop job {} during shutdown: {}", id, e);
            }
        }

        ShutdownState {
            deadline: Instant::now() + self.settings.shutdown_timeout(),
            replies: Vec::new(),
        }
    }

    fn publish(&self, id: &JobId) {
        if let Some(entry) = self.registry.get(id) {
            // No subscribers is fine
            let _ = self.change_tx.send(RegistryChange::Updated(entry.snapshot()));
        }
    }
}

fn release_worker(worker: Option<WorkerHandle>) {
    if let Some(worker) = worker {
        worker.release();
    }
}

fn invalid_state(id: &JobId, err: InvalidTransition, operation: &'static str) -> JobError {
    JobError::InvalidState {
        id: id.clone(),
        state: err.from,
        operation,
    }
}
