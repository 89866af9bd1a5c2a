// src/resources.rs
//
// =============================================================================
// WJM: RESOURCE PROBE (v 0.1)
// =============================================================================
//
// Unlike the teacher's in-memory `ResourceLedger` bitmask (valid only inside
// one long-lived process), every CLI invocation here is its own process, so
// "what's free" can never live in memory between calls. GPU and weight
// allocation are *derived* each time from the RUNNING job records on disk
// (§4.5 "Resource accounting is derived, not cached"), the same way `ps`
// derives a snapshot instead of trusting a stale table.

use crate::config::Config;
use crate::directive::GpuSpec;
use crate::record::{self, JobStatus};
use crate::store;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct GpuInventory {
    pub total_ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct SystemSnapshot {
    pub logical_cpus: u32,
    pub physical_cpus: u32,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub hostname: String,
    pub gpus: GpuInventory,
}

/// Probes host CPU/memory via `sysinfo`/`num_cpus`, and GPU inventory by
/// honoring `WJM_GPU_IDS` if set (test/container override) or otherwise
/// shelling out to `nvidia-smi -L`, tolerating its absence (CPU-only hosts
/// are a supported configuration, §3 "GPU_SPEC: N/A").
pub fn probe_system() -> SystemSnapshot {
    use sysinfo::System;
    let mut sys = System::new_all();
    sys.refresh_memory();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());

    SystemSnapshot {
        logical_cpus: num_cpus::get() as u32,
        physical_cpus: num_cpus::get_physical() as u32,
        total_memory_bytes: sys.total_memory(),
        available_memory_bytes: sys.available_memory(),
        hostname,
        gpus: probe_gpus(),
    }
}

fn probe_gpus() -> GpuInventory {
    if let Ok(raw) = std::env::var("WJM_GPU_IDS") {
        let ids: Vec<u32> = raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        return GpuInventory { total_ids: ids };
    }

    let output = std::process::Command::new("nvidia-smi").arg("-L").output();
    match output {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            let ids: Vec<u32> = text
                .lines()
                .filter_map(|line| line.strip_prefix("GPU "))
                .filter_map(|rest| rest.split(':').next())
                .filter_map(|n| n.trim().parse().ok())
                .collect();
            GpuInventory { total_ids: ids }
        }
        _ => GpuInventory { total_ids: vec![] },
    }
}

/// A point-in-time view of what's committed across every RUNNING (and, for
/// GPUs, PAUSED — a paused job still holds its device, §4.5) job record.
#[derive(Debug, Clone, Default)]
pub struct Commitment {
    pub running_jobs: u32,
    pub total_weight: u32,
    pub allocated_gpus: BTreeSet<u32>,
    pub gpu_exclusive_holder: Option<String>,
}

impl Commitment {
    pub fn free_gpus(&self, inventory: &GpuInventory) -> Vec<u32> {
        inventory
            .total_ids
            .iter()
            .copied()
            .filter(|id| !self.allocated_gpus.contains(id))
            .collect()
    }
}

/// Walks every job directory and folds RUNNING/PAUSED records into a
/// `Commitment`. This is the single source of truth the Admission
/// Controller consults — never an in-process cache.
pub fn derive_commitment(config: &Config) -> crate::error::Result<Commitment> {
    let mut commitment = Commitment::default();
    for job_id in store::list_job_ids(config)? {
        let dir = store::job_dir(config, &job_id);
        let rec = match record::read_record(&dir) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if !matches!(rec.status, JobStatus::Running | JobStatus::Paused) {
            continue;
        }
        commitment.running_jobs += 1;
        commitment.total_weight += rec.weight;
        match &rec.gpu_spec {
            GpuSpec::Any => {
                commitment.gpu_exclusive_holder = Some(rec.job_id.clone());
            }
            GpuSpec::List(ids) => {
                commitment.allocated_gpus.extend(ids.iter().copied());
            }
            GpuSpec::Auto | GpuSpec::AutoCount(_) => {
                // Symbolic specs are resolved to a concrete `GpuSpec::List`
                // by the Admission Controller at grant time; a RUNNING
                // record should never still carry the symbolic form. If it
                // does (e.g. a record hand-edited out of band) we can't
                // attribute specific device ids, so we don't double count.
            }
            GpuSpec::NotApplicable => {}
        }
    }
    Ok(commitment)
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

    #[test]
    fn commitment_ignores_terminal_jobs() {
        let (_dir, cfg) = cfg();
        let spec = JobSpec {
            weight: 30,
            gpu_spec: GpuSpec::List(vec![0]),
            ..JobSpec::default()
        };
        let mut rec = JobRecord::new("job_001".into(), "alice".into(), &spec);
        rec.status = JobStatus::Completed;
        let dir = store::job_dir(&cfg, "job_001");
        std::fs::create_dir_all(&dir).unwrap();
        record::write_record(&dir, &rec).unwrap();

        let commitment = derive_commitment(&cfg).unwrap();
        assert_eq!(commitment.running_jobs, 0);
        assert!(commitment.allocated_gpus.is_empty());
    }

    #[test]
    fn commitment_sums_running_weight_and_gpus() {
        let (_dir, cfg) = cfg();
        let spec = JobSpec {
            weight: 30,
            gpu_spec: GpuSpec::List(vec![0, 1]),
            ..JobSpec::default()
        };
        let mut rec = JobRecord::new("job_001".into(), "alice".into(), &spec);
        rec.status = JobStatus::Running;
        let dir = store::job_dir(&cfg, "job_001");
        std::fs::create_dir_all(&dir).unwrap();
        record::write_record(&dir, &rec).unwrap();

        let commitment = derive_commitment(&cfg).unwrap();
        assert_eq!(commitment.running_jobs, 1);
        assert_eq!(commitment.total_weight, 30);
        assert_eq!(commitment.allocated_gpus, BTreeSet::from([0, 1]));
    }
}
