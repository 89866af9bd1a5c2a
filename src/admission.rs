// src/admission.rs
//
// =============================================================================
// WJM: ADMISSION CONTROLLER (v 0.1)
// =============================================================================
//
// Decides, under the `Scheduler` lock, whether a job may start running now
// or must be queued (§4.6). Capacity checks: MAX_CONCURRENT_JOBS,
// MAX_TOTAL_WEIGHT, MAX_TOTAL_JOBS, GPU exclusivity (`any` wants the whole
// board; concrete ids must all be free), queue-specific limits, and
// dependency readiness. Refusal is not an error — it's a `Decision::Queue`
// that the caller turns into a queued submission.

use crate::config::{Config, QueueLimits};
use crate::directive::{GpuSpec, JobSpec};
use crate::error::Result;
use crate::lock::{self, LockName, LockTracker};
use crate::record::JobStatus;
use crate::resources::{self, GpuInventory};
use crate::store;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit {
        resolved_gpus: Vec<u32>,
    },
    Queue {
        reason: String,
    },
}

/// Evaluates admission for `spec`, optionally under a queue name (for
/// per-queue limits) and a GPU inventory snapshot. `from_queue` callers
/// (the Queue Processor) have already acquired `Scheduler`; a fresh
/// submission has not, so this function acquires it itself unless told not
/// to (§4.6 "from_queue flag to skip reacquisition" — avoids self-deadlock
/// since locks here never nest with themselves).
///
/// `on_admit` runs *before* the `Scheduler` guard is released, with the
/// resolved GPU ids, only on the `Decision::Admit` path — callers use it to
/// materialize the job record there, so the decision and the write that
/// makes it visible to the next `evaluate` call are atomic with respect to
/// other submitters (§4.2/§4.6 lock discipline).
pub fn evaluate<F>(
    config: &Config,
    tracker: &LockTracker,
    spec: &JobSpec,
    queue_name: Option<&str>,
    gpu_inventory: &GpuInventory,
    from_queue: bool,
    on_admit: F,
) -> Result<Decision>
where
    F: FnOnce(&[u32]) -> Result<()>,
{
    let _guard = if from_queue {
        None
    } else {
        Some(lock::acquire(config, tracker, LockName::Scheduler, lock::SCHEDULER_TIMEOUT)?)
    };

    let commitment = resources::derive_commitment(config)?;

    if let Some(reason) = dependency_block_reason(config, &spec.dependencies)? {
        return Ok(Decision::Queue { reason });
    }

    if config.max_concurrent_jobs > 0 && commitment.running_jobs >= config.max_concurrent_jobs {
        return Ok(Decision::Queue {
            reason: format!(
                "at concurrency limit ({} of {} running)",
                commitment.running_jobs, config.max_concurrent_jobs
            ),
        });
    }

    if config.max_total_weight > 0 && commitment.total_weight + spec.weight > config.max_total_weight {
        return Ok(Decision::Queue {
            reason: format!(
                "weight {}+{}={} exceeds limit {}",
                commitment.total_weight,
                spec.weight,
                commitment.total_weight + spec.weight,
                config.max_total_weight
            ),
        });
    }

    if config.max_total_jobs > 0 {
        let total_known = store::list_job_ids(config)?.len() as u32;
        if total_known >= config.max_total_jobs {
            return Ok(Decision::Queue {
                reason: format!("at total job limit ({total_known} of {})", config.max_total_jobs),
            });
        }
    }

    if let Some(name) = queue_name {
        if let Some(limits) = config.queues.get(name) {
            if let Some(reason) = queue_limit_block_reason(limits, &commitment, spec) {
                return Ok(Decision::Queue { reason });
            }
        }
    }

    match resolve_gpu(&spec.gpu_spec, &commitment, gpu_inventory) {
        GpuResolution::Ready(ids) => {
            on_admit(&ids)?;
            Ok(Decision::Admit { resolved_gpus: ids })
        }
        GpuResolution::Blocked(reason) => Ok(Decision::Queue { reason }),
    }
}

fn dependency_block_reason(config: &Config, dependencies: &BTreeSet<String>) -> Result<Option<String>> {
    if !config.dependencies_enabled || dependencies.is_empty() {
        return Ok(None);
    }
    for dep in dependencies {
        let dir = store::job_dir(config, dep);
        if !dir.join("job.info").exists() {
            return Ok(Some(format!("dependency {dep} has no record")));
        }
        let rec = crate::record::read_record(&dir)?;
        match rec.status {
            JobStatus::Completed => continue,
            JobStatus::Failed | JobStatus::Killed => {
                return Ok(Some(format!("dependency {dep} did not complete successfully")))
            }
            _ => return Ok(Some(format!("waiting on dependency {dep} ({})", rec.status))),
        }
    }
    Ok(None)
}

fn queue_limit_block_reason(limits: &QueueLimits, commitment: &crate::resources::Commitment, spec: &JobSpec) -> Option<String> {
    if let Some(max_jobs) = limits.max_jobs {
        if commitment.running_jobs >= max_jobs {
            return Some(format!("queue at job limit ({max_jobs})"));
        }
    }
    if let Some(max_weight) = limits.max_weight {
        if commitment.total_weight + spec.weight > max_weight {
            return Some(format!("queue at weight limit ({max_weight})"));
        }
    }
    if limits.requires_gpu && matches!(spec.gpu_spec, GpuSpec::NotApplicable) {
        return Some("queue requires a GPU spec".to_string());
    }
    None
}

enum GpuResolution {
    Ready(Vec<u32>),
    Blocked(String),
}

fn resolve_gpu(spec: &GpuSpec, commitment: &crate::resources::Commitment, inventory: &GpuInventory) -> GpuResolution {
    match spec {
        GpuSpec::NotApplicable => GpuResolution::Ready(vec![]),
        GpuSpec::List(ids) => {
            if let Some(holder) = &commitment.gpu_exclusive_holder {
                return GpuResolution::Blocked(format!("GPU board held exclusively by {holder}"));
            }
            let busy: Vec<u32> = ids
                .iter()
                .copied()
                .filter(|id| commitment.allocated_gpus.contains(id))
                .collect();
            if busy.is_empty() {
                GpuResolution::Ready(ids.clone())
            } else {
                GpuResolution::Blocked(format!(
                    "requested GPU(s) busy: {}",
                    busy.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
                ))
            }
        }
        GpuSpec::Any => {
            if commitment.gpu_exclusive_holder.is_some() || !commitment.allocated_gpus.is_empty() {
                GpuResolution::Blocked("GPU board not fully free for exclusive use".to_string())
            } else {
                GpuResolution::Ready(inventory.total_ids.clone())
            }
        }
        GpuSpec::Auto => resolve_auto(1, commitment, inventory),
        GpuSpec::AutoCount(k) => resolve_auto(*k, commitment, inventory),
    }
}

fn resolve_auto(k: u32, commitment: &crate::resources::Commitment, inventory: &GpuInventory) -> GpuResolution {
    if commitment.gpu_exclusive_holder.is_some() {
        return GpuResolution::Blocked("GPU board held exclusively by another job".to_string());
    }
    let free = commitment.free_gpus(inventory);
    if free.len() as u32 >= k {
        GpuResolution::Ready(free.into_iter().take(k as usize).collect())
    } else {
        GpuResolution::Blocked(format!(
            "requested {k} free GPU(s), only {} available",
            free.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::JobSpec;

    fn cfg() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::defaults_at(dir.path());
        cfg.ensure_dirs().unwrap();
        (dir, cfg)
    }

    #[test]
    fn admits_when_no_limits_configured() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let spec = JobSpec::default();
        let inv = GpuInventory { total_ids: vec![] };
        let decision = evaluate(&cfg, &tracker, &spec, None, &inv, false, |_| Ok(())).unwrap();
        assert_eq!(decision, Decision::Admit { resolved_gpus: vec![] });
    }

    #[test]
    fn queues_when_over_weight_limit() {
        let (_dir, mut cfg) = cfg();
        cfg.max_total_weight = 10;
        let tracker = LockTracker::new();
        let spec = JobSpec {
            weight: 20,
            ..JobSpec::default()
        };
        let inv = GpuInventory { total_ids: vec![] };
        let decision = evaluate(&cfg, &tracker, &spec, None, &inv, false, |_| Ok(())).unwrap();
        assert!(matches!(decision, Decision::Queue { .. }));
    }

    #[test]
    fn gpu_any_blocked_while_any_gpu_allocated() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let running_spec = JobSpec {
            gpu_spec: GpuSpec::List(vec![0]),
            ..JobSpec::default()
        };
        let rec = crate::record::JobRecord::new("job_001".into(), "alice".into(), &running_spec);
        let mut rec = rec;
        rec.status = JobStatus::Running;
        let dir = store::job_dir(&cfg, "job_001");
        std::fs::create_dir_all(&dir).unwrap();
        crate::record::write_record(&dir, &rec).unwrap();

        let spec = JobSpec {
            gpu_spec: GpuSpec::Any,
            ..JobSpec::default()
        };
        let inv = GpuInventory { total_ids: vec![0, 1] };
        let decision = evaluate(&cfg, &tracker, &spec, None, &inv, false, |_| Ok(())).unwrap();
        assert!(matches!(decision, Decision::Queue { .. }));
    }

    #[test]
    fn unresolved_dependency_queues() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let mut deps = BTreeSet::new();
        deps.insert("job_999".to_string());
        let spec = JobSpec {
            dependencies: deps,
            ..JobSpec::default()
        };
        let inv = GpuInventory { total_ids: vec![] };
        let decision = evaluate(&cfg, &tracker, &spec, None, &inv, false, |_| Ok(())).unwrap();
        assert!(matches!(decision, Decision::Queue { .. }));
    }
}
