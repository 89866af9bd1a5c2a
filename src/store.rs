// src/store.rs
//
// =============================================================================
// WJM: STATE STORE (v 0.1)
// =============================================================================
//
// On-disk layout per §4.1 / §6 "Persistent layout":
//
//   <JOB_DIR>/job_NNN/{job.info, command.run, job.pid, exit.code, *.log}
//   <QUEUE_DIR>/job_NNN.{run,weight,gpu,priority,depends,submit_time,name,reason}
//   <ARCHIVE_DIR>/NNN/job_NNN/...
//   .scheduler_state/managed_pids.txt
//
// Queue entries are a script file plus a sidecar per attribute because
// atomic multi-field writes aren't available on the target substrate
// (§3 "Queue Entry"); each sidecar is rewritten atomically via rename.

use crate::config::Config;
use crate::directive::{GpuSpec, Priority};
use crate::error::{Result, SchedError};
use crate::record::write_atomic;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;

pub fn job_dir(config: &Config, job_id: &str) -> PathBuf {
    config.job_dir.join(job_id)
}

pub fn numeric_suffix(name: &str) -> Option<u32> {
    let digits: String = name.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let digits: String = digits.chars().rev().collect();
    digits.parse().ok()
}

pub fn format_job_id(n: u32) -> String {
    format!("job_{n:03}")
}

/// One small per-attribute sidecar file beside a queued script.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job_id: String,
    pub weight: u32,
    pub gpu_spec: GpuSpec,
    pub priority: Priority,
    pub dependencies: BTreeSet<String>,
    pub submit_time: DateTime<Utc>,
    pub name: Option<String>,
    pub queue_reason: String,
}

pub fn queue_script_path(config: &Config, job_id: &str) -> PathBuf {
    config.queue_dir.join(format!("{job_id}.run"))
}

pub fn queue_processed_marker_path(config: &Config, job_id: &str) -> PathBuf {
    config.queue_dir.join(format!("{job_id}.run.processed"))
}

fn sidecar_path(config: &Config, job_id: &str, attr: &str) -> PathBuf {
    config.queue_dir.join(format!("{job_id}.{attr}"))
}

pub fn write_queue_entry(config: &Config, entry: &QueueEntry, script_body: &str) -> Result<()> {
    write_atomic(&queue_script_path(config, &entry.job_id), script_body)?;
    write_atomic(&sidecar_path(config, &entry.job_id, "weight"), &entry.weight.to_string())?;
    write_atomic(&sidecar_path(config, &entry.job_id, "gpu"), &entry.gpu_spec.to_field())?;
    write_atomic(
        &sidecar_path(config, &entry.job_id, "priority"),
        &entry.priority.value().to_string(),
    )?;
    write_atomic(
        &sidecar_path(config, &entry.job_id, "depends"),
        &entry.dependencies.iter().cloned().collect::<Vec<_>>().join(","),
    )?;
    write_atomic(
        &sidecar_path(config, &entry.job_id, "submit_time"),
        &entry.submit_time.to_rfc3339(),
    )?;
    write_atomic(
        &sidecar_path(config, &entry.job_id, "name"),
        entry.name.as_deref().unwrap_or(""),
    )?;
    write_atomic(&sidecar_path(config, &entry.job_id, "reason"), &entry.queue_reason)?;
    Ok(())
}

pub fn read_queue_entry(config: &Config, job_id: &str) -> Result<QueueEntry> {
    let read = |attr: &str| -> Result<String> {
        let p = sidecar_path(config, job_id, attr);
        std::fs::read_to_string(&p).map_err(|e| SchedError::io(&p, e))
    };
    let weight: u32 = read("weight")?.trim().parse().unwrap_or(10);
    let gpu_spec = GpuSpec::parse(read("gpu")?.trim()).unwrap_or(GpuSpec::NotApplicable);
    let priority_value: i32 = read("priority")?.trim().parse().unwrap_or(Priority::Normal.value());
    let priority = priority_from_value(priority_value);
    let deps_raw = read("depends").unwrap_or_default();
    let dependencies: BTreeSet<String> = deps_raw
        .trim()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let submit_time = DateTime::parse_from_rfc3339(read("submit_time")?.trim())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let name_raw = read("name").unwrap_or_default();
    let name = if name_raw.trim().is_empty() {
        None
    } else {
        Some(name_raw.trim().to_string())
    };
    let queue_reason = read("reason").unwrap_or_default();

    Ok(QueueEntry {
        job_id: job_id.to_string(),
        weight,
        gpu_spec,
        priority,
        dependencies,
        submit_time,
        name,
        queue_reason,
    })
}

fn priority_from_value(v: i32) -> Priority {
    if v >= Priority::Urgent.value() {
        Priority::Urgent
    } else if v >= Priority::High.value() {
        Priority::High
    } else if v >= Priority::Normal.value() {
        Priority::Normal
    } else {
        Priority::Low
    }
}

pub fn remove_queue_entry(config: &Config, job_id: &str) -> Result<()> {
    for attr in ["run", "weight", "gpu", "priority", "depends", "submit_time", "name", "reason"] {
        let p = if attr == "run" {
            queue_script_path(config, job_id)
        } else {
            sidecar_path(config, job_id, attr)
        };
        let _ = std::fs::remove_file(&p);
    }
    Ok(())
}

/// List queue entry job ids currently present (by scanning for `.weight`
/// sidecars, which every valid entry has).
pub fn list_queue_job_ids(config: &Config) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    if !config.queue_dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(&config.queue_dir).map_err(|e| SchedError::io(&config.queue_dir, e))? {
        let entry = entry.map_err(|e| SchedError::io(&config.queue_dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(job_id) = name.strip_suffix(".weight") {
            ids.push(job_id.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

/// List all job ids with a record directory (i.e. `job.info` present).
pub fn list_job_ids(config: &Config) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    if !config.job_dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(&config.job_dir).map_err(|e| SchedError::io(&config.job_dir, e))? {
        let entry = entry.map_err(|e| SchedError::io(&config.job_dir, e))?;
        let path = entry.path();
        if path.is_dir() && path.join("job.info").exists() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                ids.push(name.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// List every `job_NNN` directory regardless of whether `job.info` has been
/// written yet — used by the ID Allocator, for which the directory itself
/// (not the record inside it) is the claim on that id.
pub fn list_all_job_dirs(config: &Config) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    if !config.job_dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(&config.job_dir).map_err(|e| SchedError::io(&config.job_dir, e))? {
        let entry = entry.map_err(|e| SchedError::io(&config.job_dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                ids.push(name.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Remove a job's record directory without a `job.info` file (the ID was
/// allocated, but admission decided to queue instead — §4.6 "The record
/// directory created by the ID Allocator is removed").
pub fn remove_empty_record_dir(config: &Config, job_id: &str) -> Result<()> {
    let dir = job_dir(config, job_id);
    if dir.join("job.info").exists() {
        return Ok(());
    }
    if dir.exists() {
        let _ = std::fs::remove_dir_all(&dir);
    }
    Ok(())
}

pub fn next_archive_batch_dir(config: &Config) -> Result<PathBuf> {
    std::fs::create_dir_all(&config.archive_dir).map_err(|e| SchedError::io(&config.archive_dir, e))?;
    let mut max_batch: i64 = -1;
    for entry in std::fs::read_dir(&config.archive_dir).map_err(|e| SchedError::io(&config.archive_dir, e))? {
        let entry = entry.map_err(|e| SchedError::io(&config.archive_dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(n) = name.parse::<i64>() {
                max_batch = max_batch.max(n);
            }
        }
    }
    let next = (max_batch + 1).max(0);
    Ok(config.archive_dir.join(format!("{next:03}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::defaults_at(dir.path());
        cfg.ensure_dirs().unwrap();
        (dir, cfg)
    }

    #[test]
    fn numeric_suffix_parses_trailing_digits() {
        assert_eq!(numeric_suffix("job_042"), Some(42));
        assert_eq!(numeric_suffix("job_abc"), None);
    }

    #[test]
    fn queue_entry_round_trips() {
        let (_dir, cfg) = cfg();
        let entry = QueueEntry {
            job_id: "job_001".into(),
            weight: 40,
            gpu_spec: GpuSpec::List(vec![0]),
            priority: Priority::High,
            dependencies: BTreeSet::new(),
            submit_time: Utc::now(),
            name: Some("demo".into()),
            queue_reason: "weight 40+40+40=120>100".into(),
        };
        write_queue_entry(&cfg, &entry, "echo hi\n").unwrap();
        let restored = read_queue_entry(&cfg, "job_001").unwrap();
        assert_eq!(restored.weight, 40);
        assert_eq!(restored.priority, Priority::High);
        assert_eq!(restored.name.as_deref(), Some("demo"));

        let ids = list_queue_job_ids(&cfg).unwrap();
        assert_eq!(ids, vec!["job_001".to_string()]);

        remove_queue_entry(&cfg, "job_001").unwrap();
        assert!(list_queue_job_ids(&cfg).unwrap().is_empty());
    }

    #[test]
    fn archive_batches_are_zero_padded_and_monotonic() {
        let (_dir, cfg) = cfg();
        let b0 = next_archive_batch_dir(&cfg).unwrap();
        std::fs::create_dir_all(&b0).unwrap();
        let b1 = next_archive_batch_dir(&cfg).unwrap();
        assert_eq!(b0.file_name().unwrap(), "000");
        assert_eq!(b1.file_name().unwrap(), "001");
    }
}
