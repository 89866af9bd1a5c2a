// src/lifecycle.rs
//
// =============================================================================
// WJM: LIFECYCLE COMMANDS (v 0.1)
// =============================================================================
//
// The housekeeping commands named in the Command Surface supplement:
// `archive`, `clean`, `doctor`, `validate-config`, `resources`, `version`.
// None of these touch the admission path; they only read and rearrange
// already-terminal job records.

use crate::config::Config;
use crate::error::Result;
use crate::record::{self, JobStatus};
use crate::resources::{self, SystemSnapshot};
use crate::store;
use std::path::Path;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanScope {
    Failed,
    Completed,
    All,
    OlderThanDays(u32),
}

#[derive(Debug, Default)]
pub struct ArchiveReport {
    pub archived: Vec<String>,
    pub batch_dir: Option<std::path::PathBuf>,
}

/// Moves every terminal job whose record directory has accumulated past
/// `ARCHIVE_THRESHOLD` into a new numbered batch under `ARCHIVE_DIR`,
/// keeping only `MAX_ARCHIVE_BATCHES` of them (0 = unbounded) — §4.1
/// supplement "archive batch rollover".
pub fn archive(config: &Config) -> Result<ArchiveReport> {
    let mut terminal: Vec<String> = Vec::new();
    for job_id in store::list_job_ids(config)? {
        let dir = store::job_dir(config, &job_id);
        if let Ok(rec) = record::read_record(&dir) {
            if rec.status.is_terminal() {
                terminal.push(job_id);
            }
        }
    }

    if (terminal.len() as u32) < config.archive_threshold {
        return Ok(ArchiveReport::default());
    }

    let batch_dir = store::next_archive_batch_dir(config)?;
    std::fs::create_dir_all(&batch_dir).map_err(|e| crate::error::SchedError::io(&batch_dir, e))?;

    for job_id in &terminal {
        let src = store::job_dir(config, job_id);
        let dst = batch_dir.join(job_id);
        std::fs::rename(&src, &dst).map_err(|e| crate::error::SchedError::io(&src, e))?;
    }

    if config.max_archive_batches > 0 {
        prune_old_batches(config)?;
    }

    Ok(ArchiveReport {
        archived: terminal,
        batch_dir: Some(batch_dir),
    })
}

fn prune_old_batches(config: &Config) -> Result<()> {
    let mut batches: Vec<(i64, std::path::PathBuf)> = Vec::new();
    if !config.archive_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&config.archive_dir).map_err(|e| crate::error::SchedError::io(&config.archive_dir, e))? {
        let entry = entry.map_err(|e| crate::error::SchedError::io(&config.archive_dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(n) = name.parse::<i64>() {
                batches.push((n, entry.path()));
            }
        }
    }
    batches.sort_by_key(|(n, _)| *n);
    while batches.len() as u32 > config.max_archive_batches {
        let (_, path) = batches.remove(0);
        let _ = std::fs::remove_dir_all(path);
    }
    Ok(())
}

/// Permanently deletes terminal job record directories matching `scope`.
pub fn clean(config: &Config, scope: CleanScope) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    let cutoff_days = match scope {
        CleanScope::OlderThanDays(d) => Some(d),
        _ => None,
    };
    for job_id in store::list_job_ids(config)? {
        let dir = store::job_dir(config, &job_id);
        let Ok(rec) = record::read_record(&dir) else {
            continue;
        };
        if !rec.status.is_terminal() {
            continue;
        }
        let matches = match scope {
            CleanScope::Failed => rec.status == JobStatus::Failed,
            CleanScope::Completed => rec.status == JobStatus::Completed,
            CleanScope::All => true,
            CleanScope::OlderThanDays(_) => rec
                .end_time
                .map(|t| chrono::Utc::now().signed_duration_since(t).num_days() >= cutoff_days.unwrap() as i64)
                .unwrap_or(false),
        };
        if matches {
            std::fs::remove_dir_all(&dir).map_err(|e| crate::error::SchedError::io(&dir, e))?;
            removed.push(job_id);
        }
    }
    Ok(removed)
}

#[derive(Debug, Default)]
pub struct DoctorReport {
    /// Records claiming RUNNING whose `job.pid` is gone or whose pid is
    /// dead — self-healed to FAILED (§7 "Stale").
    pub healed_stale: Vec<String>,
    /// Queue sidecar sets missing one or more required attributes.
    pub orphan_queue_entries: Vec<String>,
    /// Job directories with no `job.info` at all (an id claim that never
    /// got a record, e.g. a crash between allocate and write).
    pub empty_record_dirs: Vec<String>,
}

/// Scans for and repairs the inconsistencies described in §7: a RUNNING
/// record whose process is actually gone, a queue entry with a missing
/// sidecar, or a record directory with no `job.info`.
pub fn doctor(config: &Config) -> Result<DoctorReport> {
    let mut report = DoctorReport::default();

    for job_id in store::list_all_job_dirs(config)? {
        let dir = store::job_dir(config, &job_id);
        if !dir.join("job.info").exists() {
            report.empty_record_dirs.push(job_id.clone());
            continue;
        }
        let Ok(mut rec) = record::read_record(&dir) else {
            continue;
        };
        if rec.status == JobStatus::Running {
            let pid_path = store::pid_file_path(&dir);
            let alive = pid_path
                .exists()
                .then(|| std::fs::read_to_string(&pid_path).ok())
                .flatten()
                .and_then(|s| s.trim().parse::<i32>().ok())
                .map(process_is_alive)
                .unwrap_or(false);
            if !alive {
                rec.status = JobStatus::Failed;
                rec.fail_reason = Some("self-healed: process not found on doctor scan".to_string());
                rec.end_time = Some(chrono::Utc::now());
                record::write_record(&dir, &rec)?;
                report.healed_stale.push(job_id);
            }
        }
    }

    for job_id in store::list_queue_job_ids(config)? {
        if store::read_queue_entry(config, &job_id).is_err() {
            report.orphan_queue_entries.push(job_id);
        }
    }

    Ok(report)
}

fn process_is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

pub fn validate_config(path: impl AsRef<Path>) -> Result<Vec<String>> {
    Config::validate_unknown_keys(path)
}

pub fn resources_report(config: &Config) -> Result<(SystemSnapshot, resources::Commitment)> {
    let snapshot = resources::probe_system();
    let commitment = resources::derive_commitment(config)?;
    Ok((snapshot, commitment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::JobSpec;
    use crate::record::JobRecord;

    fn cfg() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::defaults_at(dir.path());
        cfg.ensure_dirs().unwrap();
        (dir, cfg)
    }

    fn make_terminal(cfg: &Config, job_id: &str, status: JobStatus) {
        let spec = JobSpec::default();
        let mut rec = JobRecord::new(job_id.to_string(), "alice".into(), &spec);
        rec.status = status;
        rec.end_time = Some(chrono::Utc::now() - chrono::Duration::days(40));
        let dir = store::job_dir(cfg, job_id);
        std::fs::create_dir_all(&dir).unwrap();
        record::write_record(&dir, &rec).unwrap();
    }

    #[test]
    fn clean_failed_only_removes_failed() {
        let (_dir, cfg) = cfg();
        make_terminal(&cfg, "job_001", JobStatus::Failed);
        make_terminal(&cfg, "job_002", JobStatus::Completed);
        let removed = clean(&cfg, CleanScope::Failed).unwrap();
        assert_eq!(removed, vec!["job_001".to_string()]);
    }

    #[test]
    fn doctor_heals_running_record_with_no_pid_file() {
        let (_dir, cfg) = cfg();
        let spec = JobSpec::default();
        let mut rec = JobRecord::new("job_001".into(), "alice".into(), &spec);
        rec.status = JobStatus::Running;
        let dir = store::job_dir(&cfg, "job_001");
        std::fs::create_dir_all(&dir).unwrap();
        record::write_record(&dir, &rec).unwrap();

        let report = doctor(&cfg).unwrap();
        assert_eq!(report.healed_stale, vec!["job_001".to_string()]);
        let healed = record::read_record(&dir).unwrap();
        assert_eq!(healed.status, JobStatus::Failed);
    }

    #[test]
    fn archive_noop_below_threshold() {
        let (_dir, mut cfg) = cfg();
        cfg.archive_threshold = 100;
        make_terminal(&cfg, "job_001", JobStatus::Completed);
        let report = archive(&cfg).unwrap();
        assert!(report.archived.is_empty());
    }
}
