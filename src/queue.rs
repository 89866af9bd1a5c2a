// src/queue.rs
//
// =============================================================================
// WJM: QUEUE PROCESSOR (v 0.1)
// =============================================================================
//
// Drains the on-disk queue in priority order with backfill: a lower
// priority job that fits is dispatched ahead of a higher priority job that
// doesn't, rather than head-of-line blocking the whole queue (§4.7,
// "work-conserving, not strictly priority-preserving"). Runs under a
// non-blocking `QueueDrain` acquire — if another invocation is already
// draining, this one simply returns (§4.2).

use crate::admission::{self, Decision};
use crate::config::Config;
use crate::directive::JobSpec;
use crate::error::Result;
use crate::lock::{self, LockName, LockTracker};
use crate::record::{self, JobRecord, JobStatus};
use crate::resources::GpuInventory;
use crate::store::{self, QueueEntry};
use chrono::Utc;

pub enum DispatchOutcome {
    Started { job_id: String },
    StillQueued { job_id: String, reason: String },
}

/// One pass over the queue: acquires `QueueDrain` non-blocking, loads every
/// entry, sorts by priority (stable, descending) and submit time as a
/// tiebreak, then walks the list once attempting admission for each —
/// a later (lower priority) entry can still be dispatched if an earlier
/// one is refused, which is what makes this backfill rather than strict
/// FIFO-by-priority.
pub fn drain_once<F>(
    config: &Config,
    tracker: &LockTracker,
    gpu_inventory: &GpuInventory,
    mut on_dispatch: F,
) -> Result<Vec<DispatchOutcome>>
where
    F: FnMut(&str, &JobRecord) -> Result<()>,
{
    let Some(_guard) = lock::try_acquire(config, tracker, LockName::QueueDrain)? else {
        return Ok(vec![]);
    };

    cleanup_stale_processed_markers(config)?;

    let ids = store::list_queue_job_ids(config)?;
    let mut entries: Vec<QueueEntry> = Vec::new();
    for id in &ids {
        if let Ok(entry) = store::read_queue_entry(config, id) {
            entries.push(entry);
        }
    }
    entries.sort_by(|a, b| {
        b.priority
            .value()
            .cmp(&a.priority.value())
            .then(a.submit_time.cmp(&b.submit_time))
    });

    let mut outcomes = Vec::new();

    for entry in &entries {
        let script_path = store::queue_script_path(config, &entry.job_id);
        let script_body = match std::fs::read_to_string(&script_path) {
            Ok(s) => s,
            Err(_) => continue,
        };

        let spec = JobSpec {
            weight: entry.weight,
            gpu_spec: entry.gpu_spec.clone(),
            priority: entry.priority,
            dependencies: entry.dependencies.clone(),
            name: entry.name.clone(),
            script_body,
            ..JobSpec::default()
        };

        let decision = admission::evaluate(config, tracker, &spec, None, gpu_inventory, true, |_resolved_gpus| Ok(()))?;
        match decision {
            Decision::Admit { resolved_gpus } => {
                let dir = store::job_dir(config, &entry.job_id);
                std::fs::create_dir_all(&dir).map_err(|e| crate::error::SchedError::io(&dir, e))?;

                let mut record_spec = spec;
                if !resolved_gpus.is_empty() {
                    record_spec.gpu_spec = crate::directive::GpuSpec::List(resolved_gpus);
                }
                let user = dequeue_owner(config, &entry.job_id).unwrap_or_else(|| "unknown".to_string());
                let mut rec = JobRecord::new(entry.job_id.clone(), user, &record_spec);
                rec.queue_time = Some(entry.submit_time);
                rec.status = JobStatus::Running;
                record::write_record(&dir, &rec)?;

                on_dispatch(&entry.job_id, &rec)?;

                store::remove_queue_entry(config, &entry.job_id)?;
                outcomes.push(DispatchOutcome::Started {
                    job_id: entry.job_id.clone(),
                });
            }
            Decision::Queue { reason } => {
                outcomes.push(DispatchOutcome::StillQueued {
                    job_id: entry.job_id.clone(),
                    reason,
                });
            }
        }
    }

    Ok(outcomes)
}

/// The queue sidecar set has no `user` field (§4.1 only tracks what's
/// needed to re-evaluate admission); ownership for a queued job is instead
/// recorded in the reason/record the submit path writes once the job is
/// created. Until then we fall back to the process owner performing the
/// drain, mirroring how an unattended cron-triggered drain would behave.
fn dequeue_owner(_config: &Config, _job_id: &str) -> Option<String> {
    std::env::var("USER").ok()
}

fn cleanup_stale_processed_markers(config: &Config) -> Result<()> {
    if !config.queue_dir.exists() {
        return Ok(());
    }
    let cutoff = Utc::now() - chrono::Duration::hours(24);
    for entry in std::fs::read_dir(&config.queue_dir).map_err(|e| crate::error::SchedError::io(&config.queue_dir, e))? {
        let entry = entry.map_err(|e| crate::error::SchedError::io(&config.queue_dir, e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".run.processed") {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                let modified: chrono::DateTime<Utc> = modified.into();
                if modified < cutoff {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{GpuSpec, Priority};
    use std::collections::BTreeSet;

    fn cfg() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::defaults_at(dir.path());
        cfg.ensure_dirs().unwrap();
        (dir, cfg)
    }

    fn push_entry(cfg: &Config, job_id: &str, priority: Priority, weight: u32) {
        let entry = QueueEntry {
            job_id: job_id.to_string(),
            weight,
            gpu_spec: GpuSpec::NotApplicable,
            priority,
            dependencies: BTreeSet::new(),
            submit_time: Utc::now(),
            name: None,
            queue_reason: "test".into(),
        };
        store::write_queue_entry(cfg, &entry, "echo hi\n").unwrap();
    }

    #[test]
    fn backfill_admits_low_priority_when_high_priority_is_blocked() {
        let (_dir, mut cfg) = cfg();
        cfg.max_total_weight = 15;
        push_entry(&cfg, "job_001", Priority::Urgent, 20);
        push_entry(&cfg, "job_002", Priority::Low, 5);

        let tracker = LockTracker::new();
        let inv = GpuInventory { total_ids: vec![] };
        let outcomes = drain_once(&cfg, &tracker, &inv, |_, _| Ok(())).unwrap();

        let started: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                DispatchOutcome::Started { job_id } => Some(job_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["job_002".to_string()]);
    }

    #[test]
    fn concurrent_drain_is_a_noop() {
        let (_dir, cfg) = cfg();
        push_entry(&cfg, "job_001", Priority::Normal, 5);
        let tracker = LockTracker::new();
        let _held = lock::try_acquire(&cfg, &tracker, LockName::QueueDrain).unwrap().unwrap();

        let other_tracker = LockTracker::new();
        let inv = GpuInventory { total_ids: vec![] };
        let outcomes = drain_once(&cfg, &other_tracker, &inv, |_, _| Ok(())).unwrap();
        assert!(outcomes.is_empty());
    }
}
