//! streamcap
//!
//! Captures live streams and cuts recordings with ffmpeg, one supervised
//! process per job.

mod batch;
mod bulk;
mod config;
mod error;
mod jobs;
mod logging;
mod supervisor;
mod transcode;
mod worker;

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use batch::{default_output_path, BatchFile};
use bulk::{run_sequential, Abort, BulkPolicy};
use config::Config;
use error::JobError;
use jobs::{JobId, JobRequest, JobSnapshot, JobState};
use supervisor::{JobSupervisor, RegistryChange, SupervisorHandle};
use transcode::TranscodeAdapter;

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    Help,
    Capture {
        target: String,
        output: Option<PathBuf>,
    },
    Cut {
        source: String,
        output: PathBuf,
        start: String,
        end: String,
    },
    Batch {
        file: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    command: CliCommand,
    tool: Option<PathBuf>,
    json: bool,
}

/// Final job states plus how many jobs did not end cleanly
struct RunSummary {
    snapshots: Vec<JobSnapshot>,
    failures: usize,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {:#}", e);
            eprintln!();
            print_help();
            std::process::exit(2);
        }
    };

    if cli.command == CliCommand::Help {
        print_help();
        return Ok(());
    }

    let _log_guard = logging::init_logging().context("Failed to initialize logging")?;
    info!("streamcap {} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Configuration loaded from {:?}", config.config_path());

    let (requests, sequential) = build_requests(&cli, &config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let summary = runtime.block_on(run(requests, sequential, &config))?;

    print_snapshots(&summary.snapshots, cli.json)?;

    if summary.failures > 0 {
        error!("{} job(s) did not finish cleanly", summary.failures);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(requests: Vec<JobRequest>, sequential: bool, config: &Config) -> Result<RunSummary> {
    let adapter = TranscodeAdapter::ffmpeg(config);
    let (supervisor, supervisor_task) = JobSupervisor::spawn(config.supervisor.clone(), adapter);

    // Ctrl+C stops every active job; the waits below then finish normally
    let ctrl_c_handle = supervisor.clone();
    let ctrl_c_runtime = tokio::runtime::Handle::current();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, stopping jobs...");
        let handle = ctrl_c_handle.clone();
        ctrl_c_runtime.spawn(async move { stop_active(&handle).await });
    })?;

    let summary = if sequential {
        run_in_sequence(&supervisor, requests, &BulkPolicy::from(&config.bulk)).await
    } else {
        run_all(&supervisor, requests).await
    };

    match supervisor.shutdown().await {
        Ok(_) => {
            if let Err(e) = supervisor_task.await {
                warn!("Supervisor task ended abnormally: {}", e);
            }
        }
        Err(e) => info!("Supervisor already stopped: {}", e),
    }

    Ok(summary)
}

/// Stop every active job, then shut the supervisor down
async fn stop_active(supervisor: &SupervisorHandle) {
    let jobs = match supervisor.list().await {
        Ok(jobs) => jobs,
        Err(e) => {
            info!("Supervisor already stopped: {}", e);
            return;
        }
    };

    for job in jobs
        .iter()
        .filter(|job| matches!(job.state, JobState::Starting | JobState::Running))
    {
        match supervisor.stop_job(&job.id).await {
            Ok(ack) => info!("Stopping job {} ({}): {:?}", job.id, job.target, ack),
            Err(e) => warn!("Could not stop job {}: {}", job.id, e),
        }
    }

    if let Err(e) = supervisor.shutdown().await {
        info!("Supervisor already stopped: {}", e);
    }
}

/// One job at a time, with cooldown and retries between them
async fn run_in_sequence(
    supervisor: &SupervisorHandle,
    requests: Vec<JobRequest>,
    policy: &BulkPolicy,
) -> RunSummary {
    let finished = Mutex::new(Vec::new());
    let finished_ref = &finished;

    let report = run_sequential(requests, policy, move |request| {
        let request = request.clone();
        async move {
            let snapshot = run_one(supervisor, request).await.map_err(|e| {
                // Nothing after this can start either
                if matches!(
                    e.downcast_ref::<JobError>(),
                    Some(JobError::SupervisorUnavailable)
                ) {
                    anyhow::Error::new(Abort(format!("{:#}", e)))
                } else {
                    e
                }
            })?;
            let outcome = match snapshot.state {
                JobState::Stopped => Ok(()),
                state => Err(anyhow::anyhow!(
                    "job {} ended {}: {}",
                    snapshot.id,
                    state,
                    snapshot.last_error.as_deref().unwrap_or("no error recorded")
                )),
            };
            finished_ref.lock().await.push(snapshot);
            outcome
        }
    })
    .await;

    if report.aborted {
        warn!(
            "Batch aborted: {} succeeded, {} not completed",
            report.succeeded.len(),
            report.failed.len()
        );
    } else {
        info!(
            "Batch finished: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
    }

    RunSummary {
        snapshots: finished.into_inner(),
        failures: report.failed.len(),
    }
}

/// Start one job and wait for it to finish
async fn run_one(supervisor: &SupervisorHandle, request: JobRequest) -> Result<JobSnapshot> {
    let mut changes = supervisor.subscribe();
    let id = supervisor.start_job(request).await?;

    let mut pending = HashSet::from([id.clone()]);
    let mut latest = HashMap::new();
    wait_for_jobs(supervisor, &mut changes, &mut pending, &mut latest).await;

    match final_snapshot(supervisor, &id, &mut latest).await {
        Some(snapshot) => Ok(snapshot),
        None if supervisor.is_closed() => Err(JobError::SupervisorUnavailable)
            .with_context(|| format!("job {} vanished before finishing", id)),
        None => bail!("job {} vanished before finishing", id),
    }
}

/// Take a finished job off the registry, falling back to the last update
/// seen when it is already gone
async fn final_snapshot(
    supervisor: &SupervisorHandle,
    id: &JobId,
    latest: &mut HashMap<JobId, JobSnapshot>,
) -> Option<JobSnapshot> {
    let seen = latest.remove(id);
    if !seen.as_ref().is_some_and(|s| s.state.is_terminal()) {
        return seen;
    }
    match supervisor.acknowledge(id).await {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            debug!("Job {} not acknowledged: {}", id, e);
            seen
        }
    }
}

/// Start every job at once and wait for all of them
async fn run_all(supervisor: &SupervisorHandle, requests: Vec<JobRequest>) -> RunSummary {
    let mut changes = supervisor.subscribe();
    let mut order = Vec::new();
    let mut failures = 0;

    for request in requests {
        let description = request.to_string();
        match supervisor.start_job(request).await {
            Ok(id) => {
                info!("Started job {} for {}", id, description);
                order.push(id);
            }
            Err(e) => {
                error!("Could not start {}: {}", description, e);
                failures += 1;
            }
        }
    }

    let mut pending: HashSet<JobId> = order.iter().cloned().collect();
    let mut latest = HashMap::new();
    wait_for_jobs(supervisor, &mut changes, &mut pending, &mut latest).await;

    let mut snapshots = Vec::with_capacity(order.len());
    for id in &order {
        if let Some(snapshot) = final_snapshot(supervisor, id, &mut latest).await {
            snapshots.push(snapshot);
        }
    }
    failures += order.len() - snapshots.len();
    failures += snapshots
        .iter()
        .filter(|s| s.state != JobState::Stopped)
        .count();

    RunSummary {
        snapshots,
        failures,
    }
}

/// Follow registry changes until every id in `pending` is terminal
async fn wait_for_jobs(
    supervisor: &SupervisorHandle,
    changes: &mut broadcast::Receiver<RegistryChange>,
    pending: &mut HashSet<JobId>,
    latest: &mut HashMap<JobId, JobSnapshot>,
) {
    // Catch up on anything that changed before we started listening
    refresh(supervisor, pending, latest).await;

    while !pending.is_empty() {
        let change = tokio::select! {
            biased;
            change = changes.recv() => change,
            _ = supervisor.closed() => {
                warn!("Supervisor stopped with {} jobs unfinished", pending.len());
                return;
            }
        };

        match change {
            Ok(RegistryChange::Updated(snapshot)) => record(snapshot, pending, latest),
            Ok(RegistryChange::Removed(id)) => {
                pending.remove(&id);
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} job updates, re-reading state", missed);
                refresh(supervisor, pending, latest).await;
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn refresh(
    supervisor: &SupervisorHandle,
    pending: &mut HashSet<JobId>,
    latest: &mut HashMap<JobId, JobSnapshot>,
) {
    let ids: Vec<JobId> = pending.iter().cloned().collect();
    for id in ids {
        match supervisor.get(&id).await {
            Ok(Some(snapshot)) => record(snapshot, pending, latest),
            Ok(None) => {
                pending.remove(&id);
            }
            Err(_) => return,
        }
    }
}

fn record(
    snapshot: JobSnapshot,
    pending: &mut HashSet<JobId>,
    latest: &mut HashMap<JobId, JobSnapshot>,
) {
    if !pending.contains(&snapshot.id) {
        return;
    }
    match snapshot.state {
        JobState::Running => info!("Job {} running (pid {:?})", snapshot.id, snapshot.pid),
        JobState::Stopped => info!("Job {} finished: {:?}", snapshot.id, snapshot.output_path),
        JobState::Errored => error!(
            "Job {} failed: {}",
            snapshot.id,
            snapshot.last_error.as_deref().unwrap_or("unknown error")
        ),
        _ => {}
    }
    if snapshot.state.is_terminal() {
        pending.remove(&snapshot.id);
    }
    latest.insert(snapshot.id.clone(), snapshot);
}

/// Requests for the command, and whether they should run one at a time
fn build_requests(cli: &CliArgs, config: &Config) -> Result<(Vec<JobRequest>, bool)> {
    let output_dir = &config.output.directory;
    let (requests, sequential) = match &cli.command {
        CliCommand::Help => (Vec::new(), false),
        CliCommand::Capture { target, output } => {
            let output = output
                .clone()
                .unwrap_or_else(|| default_output_path(output_dir, target, chrono::Local::now()));
            (vec![JobRequest::capture(target.clone(), output)], false)
        }
        CliCommand::Cut {
            source,
            output,
            start,
            end,
        } => (
            vec![JobRequest::cut(
                source.clone(),
                output.clone(),
                start.clone(),
                end.clone(),
            )],
            false,
        ),
        CliCommand::Batch { file } => {
            let batch = BatchFile::load(file)?;
            (
                batch.to_requests(output_dir, cli.tool.as_deref())?,
                batch.sequential,
            )
        }
    };

    let requests = requests
        .into_iter()
        .map(|request| match (&cli.tool, request.tool_path.is_some()) {
            (Some(tool), false) => request.with_tool_path(tool),
            _ => request,
        })
        .collect();
    Ok((requests, sequential))
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut positional = Vec::new();
    let mut tool = None;
    let mut json = false;
    let mut start = None;
    let mut end = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                return Ok(CliArgs {
                    command: CliCommand::Help,
                    tool: None,
                    json: false,
                })
            }
            "--json" => json = true,
            "--tool" => tool = Some(PathBuf::from(flag_value(&mut iter, "--tool")?)),
            "--start" => start = Some(flag_value(&mut iter, "--start")?),
            "--end" => end = Some(flag_value(&mut iter, "--end")?),
            other if other.starts_with('-') => bail!("unknown option {}", other),
            other => positional.push(other.to_string()),
        }
    }

    let command = match positional.split_first() {
        None => CliCommand::Help,
        Some((cmd, rest)) => match (cmd.as_str(), rest) {
            ("capture", [target]) => CliCommand::Capture {
                target: target.clone(),
                output: None,
            },
            ("capture", [target, output]) => CliCommand::Capture {
                target: target.clone(),
                output: Some(PathBuf::from(output)),
            },
            ("cut", [source, output]) => CliCommand::Cut {
                source: source.clone(),
                output: PathBuf::from(output),
                start: start.take().context("cut needs --start")?,
                end: end.take().context("cut needs --end")?,
            },
            ("batch", [file]) => CliCommand::Batch {
                file: PathBuf::from(file),
            },
            ("capture" | "cut" | "batch", _) => bail!("wrong number of arguments for {}", cmd),
            (other, _) => bail!("unknown command {}", other),
        },
    };

    if start.is_some() || end.is_some() {
        bail!("--start/--end only apply to cut");
    }

    Ok(CliArgs {
        command,
        tool,
        json,
    })
}

fn flag_value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<String> {
    iter.next()
        .cloned()
        .with_context(|| format!("{} needs a value", flag))
}

fn print_snapshots(snapshots: &[JobSnapshot], json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(snapshots).context("Failed to serialize jobs")?;
        println!("{}", out);
        return Ok(());
    }

    for s in snapshots {
        match &s.last_error {
            Some(err) => println!("{}  {:<8} {}  ({})", s.id, s.state, s.target, err),
            None => println!(
                "{}  {:<8} {} -> {}",
                s.id,
                s.state,
                s.target,
                s.output_path.display()
            ),
        }
    }
    Ok(())
}

fn print_help() {
    println!("streamcap - Supervised ffmpeg captures and cuts");
    println!();
    println!("USAGE:");
    println!("    streamcap capture <target> [output] [OPTIONS]");
    println!("    streamcap cut <source> <output> --start <time> --end <time> [OPTIONS]");
    println!("    streamcap batch <file.toml> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --tool <path>  ffmpeg binary to use for these jobs");
    println!("    --json         Print final job states as JSON");
    println!("    -h, --help     Print this help message");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG            Set log level (e.g., debug, info, warn)");
    println!("    STREAMCAP_LOG_PATH  Override the log directory");
}
