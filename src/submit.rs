// src/submit.rs
//
// =============================================================================
// WJM: SUBMISSION PATH (v 0.1)
// =============================================================================
//
// Wires directive parsing, array expansion, id allocation, admission and
// queueing together for `submit-now` / `submit-queued` (§4.6). A `submit`
// call always yields a record directory — either RUNNING (a detached
// supervisor was spawned) or nothing at all on disk but a queue entry
// (admission refused, id given back to the allocator).

use crate::admission::{self, Decision};
use crate::array::ArraySpec;
use crate::config::Config;
use crate::directive::{self, JobSpec};
use crate::error::Result;
use crate::idgen;
use crate::lock::LockTracker;
use crate::record::{self, JobRecord, JobStatus};
use crate::resources::{self, GpuInventory};
use crate::store::{self, QueueEntry};
use chrono::Utc;

pub struct SubmitRequest<'a> {
    pub raw_script: &'a str,
    pub script_basename: String,
    pub preset: Option<&'a str>,
    pub user: String,
    pub force_queue: bool,
    pub array: Option<&'a str>,
    pub overrides: SubmitOverrides,
}

/// CLI flags win over directives per §4.4 ordering; `None` means "let the
/// directive/preset stand."
#[derive(Debug, Default, Clone)]
pub struct SubmitOverrides {
    pub name: Option<String>,
    pub weight: Option<u32>,
    pub priority: Option<crate::directive::Priority>,
    pub gpu: Option<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub timeout: Option<String>,
    pub retry: Option<u32>,
    pub project: Option<String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Running { job_id: String },
    Queued { job_id: String, reason: String },
}

pub fn submit(config: &Config, tracker: &LockTracker, req: &SubmitRequest) -> Result<Vec<SubmitOutcome>> {
    let mut spec = directive::parse_script(req.raw_script, req.preset, config)?;
    spec.script_basename = req.script_basename.clone();
    apply_overrides(&mut spec, &req.overrides)?;

    let gpu_inventory = resources::probe_system().gpus;

    let mut jobs: Vec<(JobSpec, Vec<(String, String)>)> = match req.array {
        Some(array_raw) => {
            let array_spec = ArraySpec::parse(array_raw)?;
            crate::array::expand(&spec, &array_spec)
        }
        None => vec![(spec, vec![])],
    };

    // Array members share `group`, the array's own generating job id — that
    // id doesn't exist until allocated, so it's claimed up front and
    // stamped onto every member (including the one that will end up using
    // it as its own job id).
    let mut first_job_id = None;
    if req.array.is_some() && !jobs.is_empty() {
        let group_id = idgen::allocate(config, tracker)?;
        for (job_spec, markers) in &mut jobs {
            job_spec.group = Some(group_id.clone());
            if let Some(idx) = markers.iter().find(|(k, _)| k == "WJM_ARRAY_INDEX").map(|(_, v)| v.clone()) {
                markers.push(("WJM_ARRAY_ID".to_string(), format!("{group_id}_{idx}")));
            }
        }
        first_job_id = Some(group_id);
    }

    let mut outcomes = Vec::new();
    for (i, (job_spec, markers)) in jobs.into_iter().enumerate() {
        let preallocated = if i == 0 { first_job_id.take() } else { None };
        outcomes.push(submit_one(config, tracker, &job_spec, &markers, req, &gpu_inventory, preallocated)?);
    }
    Ok(outcomes)
}

fn apply_overrides(spec: &mut JobSpec, overrides: &SubmitOverrides) -> Result<()> {
    if let Some(name) = &overrides.name {
        spec.name = Some(name.clone());
    }
    if let Some(w) = overrides.weight {
        spec.weight = w;
    }
    if let Some(p) = overrides.priority {
        spec.priority = p;
    }
    if let Some(g) = &overrides.gpu {
        spec.gpu_spec = crate::directive::GpuSpec::parse(g)?;
    }
    if let Some(c) = &overrides.cpu {
        spec.cpu_spec = crate::directive::CpuSpec::parse(c)?;
    }
    if let Some(m) = &overrides.memory {
        spec.memory_spec = crate::directive::MemorySpec::parse(m)?;
    }
    if let Some(t) = &overrides.timeout {
        spec.timeout = Some(parse_cli_duration(t)?);
    }
    if let Some(r) = overrides.retry {
        spec.retry_max = r;
    }
    if let Some(p) = &overrides.project {
        spec.project = Some(p.clone());
    }
    for dep in &overrides.depends_on {
        spec.dependencies.insert(dep.clone());
    }
    Ok(())
}

fn parse_cli_duration(s: &str) -> Result<std::time::Duration> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    let n: u64 = digits.parse().map_err(|_| crate::error::SchedError::Validation {
        field: "--timeout".into(),
        reason: format!("invalid duration '{s}'"),
    })?;
    let mult = match s[digits.len()..].trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        other => {
            return Err(crate::error::SchedError::Validation {
                field: "--timeout".into(),
                reason: format!("unknown duration suffix '{other}'"),
            })
        }
    };
    Ok(std::time::Duration::from_secs(n * mult))
}

fn submit_one(
    config: &Config,
    tracker: &LockTracker,
    spec: &JobSpec,
    markers: &[(String, String)],
    req: &SubmitRequest,
    gpu_inventory: &GpuInventory,
    preallocated_id: Option<String>,
) -> Result<SubmitOutcome> {
    let job_id = match preallocated_id {
        Some(id) => id,
        None => idgen::allocate(config, tracker)?,
    };

    if req.force_queue {
        store::remove_empty_record_dir(config, &job_id)?;
        let reason = "submitted directly to queue".to_string();
        write_queue_and_return(config, &job_id, spec, markers, &reason)?;
        return Ok(SubmitOutcome::Queued { job_id, reason });
    }

    // The record write happens inside `on_admit`, which `evaluate` calls
    // while it still holds `Scheduler` — that's what keeps this decision
    // atomic with respect to a concurrent submitter's own `evaluate` call.
    let decision = admission::evaluate(config, tracker, spec, None, gpu_inventory, false, |resolved_gpus| {
        let mut resolved_spec = spec.clone();
        if !resolved_gpus.is_empty() {
            resolved_spec.gpu_spec = crate::directive::GpuSpec::List(resolved_gpus.to_vec());
        }
        let dir = store::job_dir(config, &job_id);
        let mut rec = JobRecord::new(job_id.clone(), req.user.clone(), &resolved_spec);
        rec.status = JobStatus::Running;
        for (k, v) in markers {
            rec.extra.insert(k.clone(), v.clone());
        }
        record::write_atomic(&store::command_run_path(&dir), &spec.script_body)?;
        record::write_record(&dir, &rec)?;
        Ok(())
    })?;
    match decision {
        Decision::Admit { .. } => Ok(SubmitOutcome::Running { job_id }),
        Decision::Queue { reason } => {
            store::remove_empty_record_dir(config, &job_id)?;
            write_queue_and_return(config, &job_id, spec, markers, &reason)?;
            Ok(SubmitOutcome::Queued { job_id, reason })
        }
    }
}

fn write_queue_and_return(
    config: &Config,
    job_id: &str,
    spec: &JobSpec,
    _markers: &[(String, String)],
    reason: &str,
) -> Result<()> {
    let entry = QueueEntry {
        job_id: job_id.to_string(),
        weight: spec.weight,
        gpu_spec: spec.gpu_spec.clone(),
        priority: spec.priority,
        dependencies: spec.dependencies.clone(),
        submit_time: Utc::now(),
        name: spec.name.clone(),
        queue_reason: reason.to_string(),
    };
    store::write_queue_entry(config, &entry, &spec.script_body)
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
    fn submit_with_capacity_runs_immediately() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let req = SubmitRequest {
            raw_script: "#!/bin/sh\necho hi\n",
            script_basename: "job.sh".into(),
            preset: None,
            user: "alice".into(),
            force_queue: false,
            array: None,
            overrides: SubmitOverrides::default(),
        };
        let outcomes = submit(&cfg, &tracker, &req).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], SubmitOutcome::Running { .. }));
    }

    #[test]
    fn forced_queue_bypasses_admission() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let req = SubmitRequest {
            raw_script: "#!/bin/sh\necho hi\n",
            script_basename: "job.sh".into(),
            preset: None,
            user: "alice".into(),
            force_queue: true,
            array: None,
            overrides: SubmitOverrides::default(),
        };
        let outcomes = submit(&cfg, &tracker, &req).unwrap();
        assert!(matches!(outcomes[0], SubmitOutcome::Queued { .. }));
    }

    #[test]
    fn array_submission_produces_multiple_outcomes() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let req = SubmitRequest {
            raw_script: "#!/bin/sh\necho hi\n",
            script_basename: "job.sh".into(),
            preset: None,
            user: "alice".into(),
            force_queue: false,
            array: Some("0-2"),
            overrides: SubmitOverrides::default(),
        };
        let outcomes = submit(&cfg, &tracker, &req).unwrap();
        assert_eq!(outcomes.len(), 3);
    }

    #[test]
    fn array_members_share_group_equal_to_first_job_id() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let req = SubmitRequest {
            raw_script: "#!/bin/sh\necho hi\n",
            script_basename: "job.sh".into(),
            preset: None,
            user: "alice".into(),
            force_queue: false,
            array: Some("0-2"),
            overrides: SubmitOverrides::default(),
        };
        let outcomes = submit(&cfg, &tracker, &req).unwrap();
        let first_id = match &outcomes[0] {
            SubmitOutcome::Running { job_id } => job_id.clone(),
            SubmitOutcome::Queued { job_id, .. } => job_id.clone(),
        };
        assert_eq!(first_id, "job_001");
        for outcome in &outcomes {
            let job_id = match outcome {
                SubmitOutcome::Running { job_id } => job_id,
                SubmitOutcome::Queued { job_id, .. } => job_id,
            };
            let dir = store::job_dir(&cfg, job_id);
            let rec = record::read_record(&dir).unwrap();
            assert_eq!(rec.group.as_deref(), Some(first_id.as_str()));
        }
    }
}
