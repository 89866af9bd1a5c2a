// src/supervisor.rs
//
// =============================================================================
// WJM: JOB SUPERVISOR (v 0.1)
// =============================================================================
//
// One Supervisor per RUNNING job, spawned detached by the submit path and
// outliving it (§4.8). It runs the pre-hook, execs the script under a
// timeout with CPU affinity and a memory ulimit applied, captures stdout
// and stderr to the job's log (rotating it if it grows past
// MAX_LOG_SIZE_MB), retries on a matching exit code, then runs the
// appropriate post/on_fail/on_success hook and finalizes the record.
//
// Pause/resume/kill/signal act on the job's process *group* so background
// children started by the script are covered too (Design Notes: a script
// that backgrounds `sleep` must still stop when the job is paused).

use crate::config::Config;
use crate::directive::RetryOn;
use crate::error::{Result, SchedError};
use crate::record::{self, JobRecord, JobStatus};
use crate::store;
use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

const KILL_GRACE: Duration = Duration::from_secs(10);

/// Signals a job may forward from `wjm signal` other than pause/resume,
/// which are reserved (§4.8 "rejecting SIGSTOP/SIGCONT as reserved").
pub fn parse_forwardable_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let canonical = upper.strip_prefix("SIG").unwrap_or(&upper);
    if canonical == "STOP" || canonical == "CONT" {
        return Err(SchedError::ReservedSignal(name.to_string()));
    }
    match canonical {
        "TERM" => Ok(Signal::SIGTERM),
        "KILL" => Ok(Signal::SIGKILL),
        "INT" => Ok(Signal::SIGINT),
        "HUP" => Ok(Signal::SIGHUP),
        "USR1" => Ok(Signal::SIGUSR1),
        "USR2" => Ok(Signal::SIGUSR2),
        "QUIT" => Ok(Signal::SIGQUIT),
        _ => Err(SchedError::UnknownSignal(name.to_string())),
    }
}

fn signal_process_group(pid: u32, sig: Signal) -> Result<()> {
    // Negative pid targets the whole process group (setpgid'd at spawn).
    let pgid = Pid::from_raw(-(pid as i32));
    signal::kill(pgid, sig).map_err(|e| SchedError::Other(anyhow::anyhow!("signal {sig:?} to pgid {pid}: {e}")))
}

pub fn pause_job(pid: u32) -> Result<()> {
    signal_process_group(pid, Signal::SIGSTOP)
}

pub fn resume_job(pid: u32) -> Result<()> {
    signal_process_group(pid, Signal::SIGCONT)
}

pub fn kill_job(pid: u32) -> Result<()> {
    signal_process_group(pid, Signal::SIGTERM)
}

pub fn forward_signal(pid: u32, sig: Signal) -> Result<()> {
    signal_process_group(pid, sig)
}

/// Registers a supervised pid in `.scheduler_state/managed_pids.txt` so
/// `doctor` can cross-check live processes against job records even if a
/// record's own `job.pid` file goes missing (§4.1 supplement).
fn register_managed_pid(config: &Config, job_id: &str, pid: u32) -> Result<()> {
    let path = config.managed_pids_path();
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| SchedError::io(&path, e))?;
    writeln!(f, "{job_id}={pid}").map_err(|e| SchedError::io(&path, e))?;
    Ok(())
}

fn unregister_managed_pid(config: &Config, job_id: &str) -> Result<()> {
    let path = config.managed_pids_path();
    if !path.exists() {
        return Ok(());
    }
    let text = std::fs::read_to_string(&path).map_err(|e| SchedError::io(&path, e))?;
    let prefix = format!("{job_id}=");
    let filtered: String = text
        .lines()
        .filter(|l| !l.starts_with(&prefix))
        .map(|l| format!("{l}\n"))
        .collect();
    record::write_atomic(&path, &filtered)
}

fn run_hook(hook: &str, job_dir: &Path, env_extra: &[(String, String)]) -> std::io::Result<i32> {
    let mut cmd = std::process::Command::new("/bin/sh");
    cmd.arg("-c").arg(hook).current_dir(job_dir).stdin(Stdio::null());
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let status = cmd.status()?;
    Ok(status.code().unwrap_or(-1))
}

fn base_env(config: &Config, rec: &JobRecord) -> Vec<(String, String)> {
    let mut env = vec![
        ("WJM_JOB_ID".to_string(), rec.job_id.clone()),
        ("WJM_JOB_DIR".to_string(), store::job_dir(config, &rec.job_id).display().to_string()),
        ("WJM_WEIGHT".to_string(), rec.weight.to_string()),
    ];
    if let crate::directive::GpuSpec::List(ids) = &rec.gpu_spec {
        let csv = ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        env.push(("CUDA_VISIBLE_DEVICES".to_string(), csv));
    }
    if let Some(group) = &rec.group {
        env.push(("WJM_GROUP".to_string(), group.clone()));
        if let Some(idx) = rec.extra.get("WJM_ARRAY_INDEX") {
            env.push(("WJM_ARRAY_INDEX".to_string(), idx.clone()));
        }
        if let Some(id) = rec.extra.get("WJM_ARRAY_ID") {
            env.push(("WJM_ARRAY_ID".to_string(), id.clone()));
        }
        if let Some(size) = rec.extra.get("WJM_ARRAY_SIZE") {
            env.push(("WJM_ARRAY_SIZE".to_string(), size.clone()));
        }
    }
    env
}

/// Applies the CPU affinity subset and soft memory ulimit to the child
/// before exec, in the child process via `pre_exec` — both are best-effort
/// (not every kernel/cgroup setup permits them) so failures there are
/// logged, not fatal, matching the teacher's own tolerance for partially
/// unavailable instrumentation.
fn apply_resource_constraints(cmd: &mut Command, cpu_ids: Vec<u32>, memory_bytes: Option<u64>) {
    use tokio::process::unix::CommandExt;
    unsafe {
        cmd.pre_exec(move || {
            let _ = nix::unistd::setsid();
            #[cfg(target_os = "linux")]
            {
                if !cpu_ids.is_empty() {
                    use nix::sched::{sched_setaffinity, CpuSet};
                    let mut set = CpuSet::new();
                    for id in &cpu_ids {
                        let _ = set.set(*id as usize);
                    }
                    let _ = sched_setaffinity(Pid::from_raw(0), &set);
                }
                if let Some(bytes) = memory_bytes {
                    use nix::sys::resource::{setrlimit, Resource};
                    let _ = setrlimit(Resource::RLIMIT_AS, bytes, bytes);
                }
            }
            Ok(())
        });
    }
}

/// Runs the full supervised lifecycle for one job to completion: pre-hook,
/// (retry loop of) execute-under-timeout, post/on_fail/on_success hook,
/// finalize. Intended to be the entire body of a detached supervisor
/// process (see `main.rs`'s `supervise` subcommand).
pub async fn run(config: &Config, job_id: &str) -> Result<()> {
    let dir = store::job_dir(config, job_id);
    let mut rec = record::read_record(&dir)?;
    rec.start_time = Some(Utc::now());
    record::write_record(&dir, &rec)?;

    let script_path = store::command_run_path(&dir);
    let log_path = store::log_path(&dir, job_id);

    if let Some(hook) = rec.pre_hook.clone() {
        let env = base_env(config, &rec);
        let code = run_hook(&hook, &dir, &env).unwrap_or(-1);
        if code != 0 {
            finalize(config, &dir, &mut rec, JobStatus::Failed, Some(code), Some("pre_hook_failed".into()))?;
            return Ok(());
        }
    }

    let cpu_ids = rec.cpu_spec.resolve_ids();
    let sys = crate::resources::probe_system();
    let memory_bytes = rec.memory_spec.resolve_bytes(sys.total_memory_bytes);

    let mut attempt = 0u32;
    let (final_status, final_code, fail_reason) = loop {
        let env = base_env(config, &rec);
        let outcome = execute_once(&script_path, &dir, &log_path, &env, cpu_ids.clone(), memory_bytes, rec.timeout, config, job_id).await;

        // A `kill` invocation writes KILLED directly (it doesn't wait for
        // this loop to notice); once it has, stop here rather than let the
        // ordinary retry/finalize path overwrite it with FAILED.
        if let Ok(latest) = record::read_record(&dir) {
            if latest.status == JobStatus::Killed {
                return Ok(());
            }
        }

        match outcome {
            ExecOutcome::Exited(code) => {
                if code == 0 {
                    break (JobStatus::Completed, Some(code), None);
                }
                if attempt < rec.retry_max && rec.retry_on.matches(code) {
                    attempt += 1;
                    rec.retry_count = attempt;
                    record::write_record(&dir, &rec)?;
                    tokio::time::sleep(Duration::from_secs(rec.retry_delay_seconds)).await;
                    continue;
                }
                break (JobStatus::Failed, Some(code), Some(format!("exited with code {code}")));
            }
            ExecOutcome::TimedOut(code) => {
                break (JobStatus::Failed, Some(code), Some("timeout".to_string()));
            }
            ExecOutcome::SpawnFailed(msg) => {
                break (JobStatus::Failed, None, Some(msg));
            }
        }
    };

    let hook = match final_status {
        JobStatus::Completed => rec.on_success.clone(),
        _ => rec.on_fail.clone(),
    };
    if let Some(hook) = hook {
        let env = base_env(config, &rec);
        let _ = run_hook(&hook, &dir, &env);
    }
    if let Some(hook) = rec.post_hook.clone() {
        let env = base_env(config, &rec);
        let _ = run_hook(&hook, &dir, &env);
    }

    finalize(config, &dir, &mut rec, final_status, final_code, fail_reason)?;
    spawn_queue_drain(&config.root);
    Ok(())
}

/// A job finishing frees capacity; kick a detached, non-blocking queue
/// drain so a waiting job doesn't sit until something else happens to
/// invoke the CLI again. Best-effort: failure to spawn is logged, not
/// propagated, since the job itself already finished successfully.
fn spawn_queue_drain(root: &Path) {
    let Ok(exe) = std::env::current_exe() else {
        return;
    };
    let _ = std::process::Command::new(exe)
        .arg("--root")
        .arg(root)
        .arg("drain-queue")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
}

enum ExecOutcome {
    Exited(i32),
    /// Carries the exit code a `timeout`-style wrapper would report: 124 if
    /// SIGTERM alone stopped the process within `KILL_GRACE`, 137 if it took
    /// SIGKILL.
    TimedOut(i32),
    SpawnFailed(String),
}

async fn execute_once(
    script_path: &Path,
    job_dir: &Path,
    log_path: &Path,
    env: &[(String, String)],
    cpu_ids: Vec<u32>,
    memory_bytes: Option<u64>,
    job_timeout: Option<Duration>,
    config: &Config,
    job_id: &str,
) -> ExecOutcome {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg(script_path)
        .current_dir(job_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in env {
        cmd.env(k, v);
    }
    apply_resource_constraints(&mut cmd, cpu_ids, memory_bytes);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return ExecOutcome::SpawnFailed(format!("spawn failed: {e}")),
    };

    if let Some(pid) = child.id() {
        register_managed_pid(config, job_id, pid).ok();
        record::write_atomic(&store::pid_file_path(job_dir), &pid.to_string()).ok();
    }

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let log_path = log_path.to_path_buf();
    let capture = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.read_to_end(&mut buf).await;
        }
        if let Some(mut err) = stderr.take() {
            let _ = err.read_to_end(&mut buf).await;
        }
        let _ = std::fs::write(&log_path, &buf);
    });

    let wait = child.wait();
    let result = match job_timeout {
        Some(d) => timeout(d, wait).await,
        None => Ok(wait.await),
    };

    let _ = capture.await;
    unregister_managed_pid(config, job_id).ok();

    match result {
        Err(_) => {
            let mut code = 124;
            if let Some(pid) = child.id() {
                let _ = signal_process_group(pid, Signal::SIGTERM);
                if timeout(KILL_GRACE, child.wait()).await.is_err() {
                    let _ = signal_process_group(pid, Signal::SIGKILL);
                    let _ = child.wait().await;
                    code = 137;
                }
            }
            ExecOutcome::TimedOut(code)
        }
        Ok(Ok(status)) => ExecOutcome::Exited(status.code().unwrap_or(-1)),
        Ok(Err(e)) => ExecOutcome::SpawnFailed(format!("wait failed: {e}")),
    }
}

fn finalize(
    config: &Config,
    dir: &Path,
    rec: &mut JobRecord,
    status: JobStatus,
    exit_code: Option<i32>,
    fail_reason: Option<String>,
) -> Result<()> {
    rec.end_time = Some(Utc::now());
    rec.status = status;
    rec.exit_code = exit_code;
    rec.fail_reason = fail_reason;
    rec.pid = None;
    record::write_record(dir, rec)?;
    if let Some(code) = exit_code {
        record::write_atomic(&store::exit_code_path(dir), &code.to_string())?;
    }
    let _ = std::fs::remove_file(store::pid_file_path(dir));
    rotate_log_if_needed(config, dir, &rec.job_id)?;
    Ok(())
}

/// Rotates `<job_id>.log` when it exceeds `MAX_LOG_SIZE_MB`, keeping up to
/// `LOG_ROTATION_COUNT` gzip-compressed generations (§4.8 supplement).
fn rotate_log_if_needed(config: &Config, dir: &Path, job_id: &str) -> Result<()> {
    let log_path = store::log_path(dir, job_id);
    let Ok(meta) = std::fs::metadata(&log_path) else {
        return Ok(());
    };
    let limit_bytes = config.max_log_size_mb * 1024 * 1024;
    if meta.len() <= limit_bytes {
        return Ok(());
    }

    for gen in (1..config.log_rotation_count).rev() {
        let src = dir.join(format!("{job_id}.log.{gen}.gz"));
        let dst = dir.join(format!("{job_id}.log.{}.gz", gen + 1));
        if src.exists() {
            let _ = std::fs::rename(&src, &dst);
        }
    }

    let rotated = dir.join(format!("{job_id}.log.1.gz"));
    if config.log_compression_enabled {
        let data = std::fs::read(&log_path).map_err(|e| SchedError::io(&log_path, e))?;
        let f = std::fs::File::create(&rotated).map_err(|e| SchedError::io(&rotated, e))?;
        let mut encoder = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        encoder.write_all(&data).map_err(|e| SchedError::io(&rotated, e))?;
        encoder.finish().map_err(|e| SchedError::io(&rotated, e))?;
    } else {
        let _ = std::fs::copy(&log_path, dir.join(format!("{job_id}.log.1")));
    }
    std::fs::write(&log_path, b"").map_err(|e| SchedError::io(&log_path, e))?;
    Ok(())
}
