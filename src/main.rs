// src/main.rs
//
// =============================================================================
// WJM: COMMAND-LINE ENTRY POINT
// =============================================================================
//
// Parses the Command Surface with `clap`, resolves a `Config` for the
// current directory (or `--root`), and dispatches. Every handler returns a
// `wjm::Result`; the only place a `SchedError` is translated into a
// process exit code is here, at the boundary (§6).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use wjm::config::Config;
use wjm::directive::Priority;
use wjm::error::SchedError;
use wjm::lock::LockTracker;
use wjm::record::JobStatus;
use wjm::submit::{SubmitOutcome, SubmitOverrides, SubmitRequest};
use wjm::{lifecycle, queue, resources, store, submit, supervisor};

#[derive(Parser)]
#[command(name = "wjm", version = lifecycle::VERSION, about = "Single-workstation job scheduler")]
struct Cli {
    /// Scheduler state root (job/queue/archive/log dirs live under here).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Default)]
struct SubmitArgs {
    script: PathBuf,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    preset: Option<String>,
    #[arg(long)]
    priority: Option<String>,
    #[arg(long)]
    weight: Option<u32>,
    #[arg(long)]
    gpu: Option<String>,
    #[arg(long)]
    cpu: Option<String>,
    #[arg(long)]
    memory: Option<String>,
    #[arg(long)]
    timeout: Option<String>,
    #[arg(long)]
    retry: Option<u32>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long = "depends-on")]
    depends_on: Vec<String>,
    #[arg(long)]
    array: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a script to run immediately if capacity allows, else queue it.
    SubmitNow(SubmitArgs),
    /// Submit a script directly to the queue, bypassing admission.
    SubmitQueued(SubmitArgs),
    Kill { job_id: String },
    Pause { job_id: String },
    Resume { job_id: String },
    Signal { job_id: String, signal: String },
    Resubmit { job_id: String },
    Status { job_id: String },
    List {
        #[arg(long)]
        status: Option<String>,
        /// Emit one JSON object per line instead of the table (for dashboards).
        #[arg(long)]
        json: bool,
    },
    Info { job_id: String },
    Logs { job_id: String },
    /// Repeatedly reprint `list` until interrupted.
    Watch,
    Archive,
    Clean {
        #[arg(long, default_value = "failed")]
        scope: String,
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    Doctor,
    ValidateConfig {
        #[arg(default_value = "wjm.conf")]
        path: PathBuf,
    },
    Resources {
        #[arg(long)]
        json: bool,
    },
    Version,
    /// Runs one non-blocking pass over the queue, dispatching whatever now
    /// fits. Safe to call any time; a concurrent drain is simply skipped.
    DrainQueue,
    /// Internal: runs the supervised lifecycle for one job. Spawned
    /// detached by the submission path; not meant for interactive use.
    #[command(hide = true)]
    Supervise { job_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("wjm: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<(), SchedError> {
    let config = resolve_config(&cli.root)?;
    config.ensure_dirs()?;
    let tracker = LockTracker::new();

    match cli.command {
        Command::SubmitNow(args) => cmd_submit(&config, &tracker, args, false).await,
        Command::SubmitQueued(args) => cmd_submit(&config, &tracker, args, true).await,
        Command::Kill { job_id } => cmd_kill(&config, &job_id),
        Command::Pause { job_id } => cmd_pause(&config, &job_id),
        Command::Resume { job_id } => cmd_resume(&config, &job_id),
        Command::Signal { job_id, signal } => cmd_signal(&config, &job_id, &signal),
        Command::Resubmit { job_id } => cmd_resubmit(&config, &tracker, &job_id).await,
        Command::Status { job_id } => cmd_status(&config, &job_id),
        Command::List { status, json } => cmd_list(&config, status.as_deref(), json),
        Command::Info { job_id } => cmd_info(&config, &job_id),
        Command::Logs { job_id } => cmd_logs(&config, &job_id),
        Command::Watch => cmd_watch(&config).await,
        Command::Archive => cmd_archive(&config),
        Command::Clean { scope, older_than_days } => cmd_clean(&config, &scope, older_than_days),
        Command::Doctor => cmd_doctor(&config),
        Command::ValidateConfig { path } => cmd_validate_config(&path),
        Command::Resources { json } => cmd_resources(&config, json),
        Command::DrainQueue => drain_queue_once(&config, &tracker),
        Command::Version => {
            println!("wjm {}", lifecycle::VERSION);
            Ok(())
        }
        Command::Supervise { job_id } => supervisor::run(&config, &job_id).await,
    }
}

fn resolve_config(root: &std::path::Path) -> Result<Config, SchedError> {
    let conf_path = root.join("wjm.conf");
    Config::load(&conf_path, root)
}

async fn cmd_submit(
    config: &Config,
    tracker: &LockTracker,
    args: SubmitArgs,
    force_queue: bool,
) -> Result<(), SchedError> {
    let raw = std::fs::read_to_string(&args.script).map_err(|e| SchedError::io(&args.script, e))?;
    let basename = args
        .script
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("job.sh")
        .to_string();
    let priority = match &args.priority {
        Some(p) => Some(Priority::parse(p).ok_or_else(|| SchedError::Validation {
            field: "--priority".into(),
            reason: format!("unknown priority '{p}'"),
        })?),
        None => None,
    };
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());

    let req = SubmitRequest {
        raw_script: &raw,
        script_basename: basename,
        preset: args.preset.as_deref(),
        user,
        force_queue,
        array: args.array.as_deref(),
        overrides: SubmitOverrides {
            name: args.name,
            weight: args.weight,
            priority,
            gpu: args.gpu,
            cpu: args.cpu,
            memory: args.memory,
            timeout: args.timeout,
            retry: args.retry,
            project: args.project,
            depends_on: args.depends_on,
        },
    };

    let outcomes = submit::submit(config, tracker, &req)?;
    for outcome in outcomes {
        match outcome {
            SubmitOutcome::Running { job_id } => {
                println!("{job_id}: RUNNING");
                spawn_supervisor(config, &job_id)?;
            }
            SubmitOutcome::Queued { job_id, reason } => {
                println!("{job_id}: QUEUED ({reason})");
            }
        }
    }
    Ok(())
}

/// Spawns `wjm supervise <job_id>` as a detached child of the current
/// process (its own session, stdio redirected away) so it keeps running
/// after this short-lived CLI invocation exits (§4.8).
fn spawn_supervisor(config: &Config, job_id: &str) -> Result<(), SchedError> {
    use std::os::unix::process::CommandExt;
    let exe = std::env::current_exe().map_err(|e| SchedError::Other(anyhow::anyhow!("current_exe: {e}")))?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--root").arg(&config.root).arg("supervise").arg(job_id);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map(|_| ()).map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }
    cmd.spawn().map_err(|e| SchedError::Other(anyhow::anyhow!("spawn supervisor: {e}")))?;
    Ok(())
}

fn read_pid(config: &Config, job_id: &str) -> Result<u32, SchedError> {
    let dir = store::job_dir(config, job_id);
    if !dir.join("job.info").exists() {
        return Err(SchedError::NotFound(job_id.to_string()));
    }
    let pid_path = store::pid_file_path(&dir);
    let text = std::fs::read_to_string(&pid_path).map_err(|e| SchedError::io(&pid_path, e))?;
    text.trim().parse().map_err(|_| SchedError::Validation {
        field: "job.pid".into(),
        reason: "not a valid pid".into(),
    })
}

/// Only the owner (or an elevated process) may kill/pause/resume/signal a
/// record — spec.md's Ownership error category, enforced here rather than
/// left to rely on filesystem permissions.
fn check_owner(job_id: &str, rec: &wjm::record::JobRecord) -> Result<(), SchedError> {
    let caller = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    if rec.user != caller {
        return Err(SchedError::NotOwner(job_id.to_string(), rec.user.clone()));
    }
    Ok(())
}

/// Sends SIGTERM (escalation is the timeout facility's job, not kill's) and
/// writes the terminal state directly: `status=KILLED`, `end_time`, pid file
/// and owning queue entry removed. The supervisor loop notices the record
/// already carries `KILLED` and stops without overwriting it (see
/// `supervisor::run`'s post-execute check).
fn cmd_kill(config: &Config, job_id: &str) -> Result<(), SchedError> {
    let dir = store::job_dir(config, job_id);
    let mut rec = wjm::record::read_record(&dir)?;
    check_owner(job_id, &rec)?;

    let pid_path = store::pid_file_path(&dir);
    if pid_path.exists() {
        let pid = read_pid(config, job_id)?;
        supervisor::kill_job(pid)?;
    }

    rec.status = JobStatus::Killed;
    rec.end_time = Some(chrono::Utc::now());
    rec.pid = None;
    wjm::record::write_record(&dir, &rec)?;
    let _ = std::fs::remove_file(&pid_path);
    store::remove_queue_entry(config, job_id)
}

fn cmd_pause(config: &Config, job_id: &str) -> Result<(), SchedError> {
    let dir = store::job_dir(config, job_id);
    let mut rec = wjm::record::read_record(&dir)?;
    check_owner(job_id, &rec)?;
    let pid = read_pid(config, job_id)?;
    supervisor::pause_job(pid)?;
    rec.status = JobStatus::Paused;
    wjm::record::write_record(&dir, &rec)
}

fn cmd_resume(config: &Config, job_id: &str) -> Result<(), SchedError> {
    let dir = store::job_dir(config, job_id);
    let mut rec = wjm::record::read_record(&dir)?;
    check_owner(job_id, &rec)?;
    let pid = read_pid(config, job_id)?;
    supervisor::resume_job(pid)?;
    rec.status = JobStatus::Running;
    wjm::record::write_record(&dir, &rec)
}

fn cmd_signal(config: &Config, job_id: &str, signal: &str) -> Result<(), SchedError> {
    let dir = store::job_dir(config, job_id);
    let rec = wjm::record::read_record(&dir)?;
    check_owner(job_id, &rec)?;
    let pid = read_pid(config, job_id)?;
    let sig = supervisor::parse_forwardable_signal(signal)?;
    supervisor::forward_signal(pid, sig)
}

async fn cmd_resubmit(config: &Config, tracker: &LockTracker, job_id: &str) -> Result<(), SchedError> {
    let dir = store::job_dir(config, job_id);
    let rec = wjm::record::read_record(&dir)?;
    check_owner(job_id, &rec)?;
    let script = std::fs::read_to_string(store::command_run_path(&dir)).unwrap_or_default();

    let req = SubmitRequest {
        raw_script: &script,
        script_basename: rec.script_basename.clone(),
        preset: None,
        user: rec.user.clone(),
        force_queue: false,
        array: None,
        overrides: SubmitOverrides {
            name: rec.name.clone(),
            weight: Some(rec.weight),
            priority: Some(rec.priority),
            gpu: Some(rec.gpu_spec.to_field()),
            cpu: Some(rec.cpu_spec.to_field()),
            memory: Some(rec.memory_spec.to_field()),
            timeout: rec.timeout.map(|d| format!("{}s", d.as_secs())),
            retry: Some(rec.retry_max),
            project: rec.project.clone(),
            depends_on: rec.dependencies.iter().cloned().collect(),
        },
    };
    let outcomes = submit::submit(config, tracker, &req)?;
    for outcome in outcomes {
        match outcome {
            SubmitOutcome::Running { job_id } => {
                println!("{job_id}: RUNNING");
                spawn_supervisor(config, &job_id)?;
            }
            SubmitOutcome::Queued { job_id, reason } => println!("{job_id}: QUEUED ({reason})"),
        }
    }
    Ok(())
}

fn cmd_status(config: &Config, job_id: &str) -> Result<(), SchedError> {
    let dir = store::job_dir(config, job_id);
    let rec = wjm::record::read_record(&dir)?;
    println!("{}", rec.status);
    Ok(())
}

/// A flattened, serializable view of a record for `list --json` (dashboard
/// and analytics consumers get a stable shape without pulling in the full
/// `job.info` key set, mirroring the teacher's use of `serde_json` at its
/// own API boundary).
#[derive(serde::Serialize)]
struct JobSummary {
    job_id: String,
    status: String,
    priority: String,
    weight: u32,
    name: Option<String>,
}

fn cmd_list(config: &Config, status_filter: Option<&str>, json: bool) -> Result<(), SchedError> {
    let wanted = status_filter.map(|s| s.to_ascii_uppercase());
    for job_id in store::list_job_ids(config)? {
        let dir = store::job_dir(config, &job_id);
        let Ok(rec) = wjm::record::read_record(&dir) else {
            continue;
        };
        if let Some(w) = &wanted {
            if rec.status.as_str() != w {
                continue;
            }
        }
        if json {
            let summary = JobSummary {
                job_id: rec.job_id,
                status: rec.status.as_str().to_string(),
                priority: rec.priority.to_string(),
                weight: rec.weight,
                name: rec.name,
            };
            println!("{}", serde_json::to_string(&summary).map_err(|e| SchedError::Other(anyhow::anyhow!(e)))?);
        } else {
            println!(
                "{:<10} {:<10} {:<8} weight={:<4} {}",
                rec.job_id,
                rec.status,
                rec.priority,
                rec.weight,
                rec.name.unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn cmd_info(config: &Config, job_id: &str) -> Result<(), SchedError> {
    let dir = store::job_dir(config, job_id);
    let rec = wjm::record::read_record(&dir)?;
    print!("{}", rec.to_kv());
    Ok(())
}

fn cmd_logs(config: &Config, job_id: &str) -> Result<(), SchedError> {
    let dir = store::job_dir(config, job_id);
    let log_path = store::log_path(&dir, job_id);
    let text = std::fs::read_to_string(&log_path).map_err(|e| SchedError::io(&log_path, e))?;
    print!("{text}");
    Ok(())
}

async fn cmd_watch(config: &Config) -> Result<(), SchedError> {
    loop {
        print!("\x1B[2J\x1B[1;1H");
        cmd_list(config, None, false)?;
        tokio::time::sleep(std::time::Duration::from_millis(config.watch_refresh_interval_ms)).await;
    }
}

fn cmd_archive(config: &Config) -> Result<(), SchedError> {
    let report = lifecycle::archive(config)?;
    if report.archived.is_empty() {
        println!("nothing to archive");
    } else {
        println!(
            "archived {} job(s) into {:?}",
            report.archived.len(),
            report.batch_dir.unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_clean(config: &Config, scope: &str, older_than_days: Option<u32>) -> Result<(), SchedError> {
    let scope = match (scope, older_than_days) {
        (_, Some(days)) => lifecycle::CleanScope::OlderThanDays(days),
        ("failed", None) => lifecycle::CleanScope::Failed,
        ("completed", None) => lifecycle::CleanScope::Completed,
        ("all", None) => lifecycle::CleanScope::All,
        (other, None) => {
            return Err(SchedError::Validation {
                field: "--scope".into(),
                reason: format!("unknown scope '{other}'"),
            })
        }
    };
    let removed = lifecycle::clean(config, scope)?;
    println!("removed {} job(s)", removed.len());
    Ok(())
}

fn cmd_doctor(config: &Config) -> Result<(), SchedError> {
    let report = lifecycle::doctor(config)?;
    println!("healed stale records: {:?}", report.healed_stale);
    println!("orphan queue entries: {:?}", report.orphan_queue_entries);
    println!("record dirs with no job.info: {:?}", report.empty_record_dirs);
    Ok(())
}

fn cmd_validate_config(path: &std::path::Path) -> Result<(), SchedError> {
    let unknown = lifecycle::validate_config(path)?;
    if unknown.is_empty() {
        println!("ok: no unrecognized keys");
    } else {
        println!("unrecognized keys: {}", unknown.join(", "));
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct ResourcesSummary {
    hostname: String,
    logical_cpus: u32,
    physical_cpus: u32,
    total_memory_bytes: u64,
    available_memory_bytes: u64,
    gpu_ids: Vec<u32>,
    free_gpu_ids: Vec<u32>,
    running_jobs: u32,
    total_weight: u32,
}

fn cmd_resources(config: &Config, json: bool) -> Result<(), SchedError> {
    let (snapshot, commitment) = lifecycle::resources_report(config)?;
    let free_gpus = commitment.free_gpus(&snapshot.gpus);

    if json {
        let summary = ResourcesSummary {
            hostname: snapshot.hostname,
            logical_cpus: snapshot.logical_cpus,
            physical_cpus: snapshot.physical_cpus,
            total_memory_bytes: snapshot.total_memory_bytes,
            available_memory_bytes: snapshot.available_memory_bytes,
            gpu_ids: snapshot.gpus.total_ids,
            free_gpu_ids: free_gpus,
            running_jobs: commitment.running_jobs,
            total_weight: commitment.total_weight,
        };
        println!("{}", serde_json::to_string(&summary).map_err(|e| SchedError::Other(anyhow::anyhow!(e)))?);
        return Ok(());
    }

    println!("host: {}", snapshot.hostname);
    println!("cpus: {} logical / {} physical", snapshot.logical_cpus, snapshot.physical_cpus);
    println!(
        "memory: {} / {} bytes available",
        snapshot.available_memory_bytes, snapshot.total_memory_bytes
    );
    println!("gpus: {:?} total, {:?} free", snapshot.gpus.total_ids, free_gpus);
    println!("running jobs: {}, total weight: {}", commitment.running_jobs, commitment.total_weight);
    Ok(())
}

fn drain_queue_once(config: &Config, tracker: &LockTracker) -> Result<(), SchedError> {
    let gpu_inventory = resources::probe_system().gpus;
    let outcomes = queue::drain_once(config, tracker, &gpu_inventory, |job_id, _rec| {
        spawn_supervisor(config, job_id)
    })?;
    for outcome in outcomes {
        match outcome {
            queue::DispatchOutcome::Started { job_id } => println!("{job_id}: dispatched from queue"),
            queue::DispatchOutcome::StillQueued { job_id, reason } => {
                log::debug!("{job_id} remains queued: {reason}")
            }
        }
    }
    Ok(())
}
