// src/record.rs
//
// =============================================================================
// WJM: JOB RECORD CODEC (v 0.1)
// =============================================================================
//
// Design Notes §9: replace ad-hoc `grep | cut -d=` access with a typed
// record codec used by every reader and writer. `job.info` is a flat
// KEY=VALUE text file; unknown keys are preserved verbatim on round-trip
// (forward compatibility for the dashboard/analytics collaborators named
// in §1).

use crate::directive::{CpuSpec, GpuSpec, JobSpec, MemorySpec, Priority, RetryOn};
use crate::error::{Result, SchedError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Killed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Killed => "KILLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(JobStatus::Queued),
            "RUNNING" => Some(JobStatus::Running),
            "PAUSED" => Some(JobStatus::Paused),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "KILLED" => Some(JobStatus::Killed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A Job Record: one per job directory, stored as `job.info`.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub name: Option<String>,
    pub user: String,

    pub script_basename: String,

    pub weight: u32,
    pub gpu_spec: GpuSpec,
    pub cpu_spec: CpuSpec,
    pub memory_spec: MemorySpec,

    pub priority: Priority,
    pub timeout: Option<std::time::Duration>,
    pub dependencies: BTreeSet<String>,

    pub retry_max: u32,
    pub retry_delay_seconds: u64,
    pub retry_on: RetryOn,
    pub retry_count: u32,

    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
    pub on_fail: Option<String>,
    pub on_success: Option<String>,

    pub project: Option<String>,
    pub group: Option<String>,

    pub submit_time: DateTime<Utc>,
    pub queue_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub pid: Option<u32>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub fail_reason: Option<String>,

    /// Unrecognized KEY=VALUE lines, preserved verbatim for forward compat.
    pub extra: BTreeMap<String, String>,
}

impl JobRecord {
    pub fn new(job_id: String, user: String, spec: &JobSpec) -> Self {
        Self {
            job_id,
            name: spec.name.clone(),
            user,
            script_basename: spec.script_basename.clone(),
            weight: spec.weight,
            gpu_spec: spec.gpu_spec.clone(),
            cpu_spec: spec.cpu_spec.clone(),
            memory_spec: spec.memory_spec.clone(),
            priority: spec.priority,
            timeout: spec.timeout,
            dependencies: spec.dependencies.clone(),
            retry_max: spec.retry_max,
            retry_delay_seconds: spec.retry_delay_seconds,
            retry_on: spec.retry_on.clone(),
            retry_count: 0,
            pre_hook: spec.pre_hook.clone(),
            post_hook: spec.post_hook.clone(),
            on_fail: spec.on_fail.clone(),
            on_success: spec.on_success.clone(),
            project: spec.project.clone(),
            group: spec.group.clone(),
            submit_time: Utc::now(),
            queue_time: None,
            start_time: None,
            end_time: None,
            pid: None,
            status: JobStatus::Queued,
            exit_code: None,
            fail_reason: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn to_kv(&self) -> String {
        let mut out = String::new();
        macro_rules! kv {
            ($k:expr, $v:expr) => {
                out.push_str(&format!("{}={}\n", $k, $v));
            };
        }
        kv!("JOB_ID", self.job_id);
        kv!("NAME", self.name.clone().unwrap_or_else(|| "N/A".into()));
        kv!("USER", self.user);
        kv!("SCRIPT_BASENAME", self.script_basename);
        kv!("WEIGHT", self.weight);
        kv!("GPU_SPEC", self.gpu_spec.to_field());
        kv!("CPU_SPEC", self.cpu_spec.to_field());
        kv!("MEMORY_SPEC", self.memory_spec.to_field());
        kv!("PRIORITY", self.priority);
        kv!(
            "TIMEOUT",
            self.timeout.map(|d| d.as_secs().to_string()).unwrap_or_else(|| "N/A".into())
        );
        kv!(
            "DEPENDENCIES",
            if self.dependencies.is_empty() {
                "N/A".to_string()
            } else {
                self.dependencies.iter().cloned().collect::<Vec<_>>().join(",")
            }
        );
        kv!("RETRY_MAX", self.retry_max);
        kv!("RETRY_DELAY_SECONDS", self.retry_delay_seconds);
        kv!("RETRY_ON", self.retry_on.to_field());
        kv!("RETRY_COUNT", self.retry_count);
        kv!("PRE_HOOK", self.pre_hook.clone().unwrap_or_else(|| "N/A".into()));
        kv!("POST_HOOK", self.post_hook.clone().unwrap_or_else(|| "N/A".into()));
        kv!("ON_FAIL", self.on_fail.clone().unwrap_or_else(|| "N/A".into()));
        kv!("ON_SUCCESS", self.on_success.clone().unwrap_or_else(|| "N/A".into()));
        kv!("PROJECT", self.project.clone().unwrap_or_else(|| "N/A".into()));
        kv!("GROUP", self.group.clone().unwrap_or_else(|| "N/A".into()));
        kv!("SUBMIT_TIME", self.submit_time.to_rfc3339());
        kv!(
            "QUEUE_TIME",
            self.queue_time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "N/A".into())
        );
        kv!(
            "START_TIME",
            self.start_time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "N/A".into())
        );
        kv!(
            "END_TIME",
            self.end_time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "N/A".into())
        );
        kv!("PID", self.pid.map(|p| p.to_string()).unwrap_or_else(|| "N/A".into()));
        kv!("STATUS", self.status);
        kv!(
            "EXIT_CODE",
            self.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "N/A".into())
        );
        kv!("FAIL_REASON", self.fail_reason.clone().unwrap_or_else(|| "N/A".into()));
        for (k, v) in &self.extra {
            kv!(k, v);
        }
        out
    }

    pub fn from_kv(text: &str, path: &Path) -> Result<Self> {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            fields.insert(k.to_string(), v.to_string());
        }

        let err = |field: &str, why: &str| {
            SchedError::MalformedRecord(path.to_path_buf(), format!("{field}: {why}"))
        };
        let get = |fields: &BTreeMap<String, String>, k: &str| -> Result<String> {
            fields.get(k).cloned().ok_or_else(|| err(k, "missing"))
        };
        let opt = |fields: &BTreeMap<String, String>, k: &str| -> Option<String> {
            fields.get(k).filter(|v| v.as_str() != "N/A").cloned()
        };

        let job_id = get(&fields, "JOB_ID")?;
        let name = opt(&fields, "NAME");
        let user = get(&fields, "USER")?;
        let script_basename = get(&fields, "SCRIPT_BASENAME").unwrap_or_default();
        let weight: u32 = get(&fields, "WEIGHT")?
            .parse()
            .map_err(|_| err("WEIGHT", "not an integer"))?;
        let gpu_spec = GpuSpec::parse(&fields.get("GPU_SPEC").cloned().unwrap_or_else(|| "N/A".into()))
            .map_err(|_| err("GPU_SPEC", "unparsable"))?;
        let cpu_spec = CpuSpec::parse(&fields.get("CPU_SPEC").cloned().unwrap_or_else(|| "N/A".into()))
            .map_err(|_| err("CPU_SPEC", "unparsable"))?;
        let memory_spec =
            MemorySpec::parse(&fields.get("MEMORY_SPEC").cloned().unwrap_or_else(|| "N/A".into()))
                .map_err(|_| err("MEMORY_SPEC", "unparsable"))?;
        let priority = Priority::parse(&get(&fields, "PRIORITY")?).ok_or_else(|| err("PRIORITY", "unknown"))?;
        let timeout = opt(&fields, "TIMEOUT")
            .map(|v| v.parse::<u64>().map(std::time::Duration::from_secs))
            .transpose()
            .map_err(|_| err("TIMEOUT", "not an integer"))?;
        let dependencies: BTreeSet<String> = opt(&fields, "DEPENDENCIES")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        let retry_max: u32 = get(&fields, "RETRY_MAX")?
            .parse()
            .map_err(|_| err("RETRY_MAX", "not an integer"))?;
        let retry_delay_seconds: u64 = get(&fields, "RETRY_DELAY_SECONDS")?
            .parse()
            .map_err(|_| err("RETRY_DELAY_SECONDS", "not an integer"))?;
        let retry_on = RetryOn::parse(&fields.get("RETRY_ON").cloned().unwrap_or_else(|| "any".into()))
            .map_err(|_| err("RETRY_ON", "unparsable"))?;
        let retry_count: u32 = get(&fields, "RETRY_COUNT")?
            .parse()
            .map_err(|_| err("RETRY_COUNT", "not an integer"))?;
        let pre_hook = opt(&fields, "PRE_HOOK");
        let post_hook = opt(&fields, "POST_HOOK");
        let on_fail = opt(&fields, "ON_FAIL");
        let on_success = opt(&fields, "ON_SUCCESS");
        let project = opt(&fields, "PROJECT");
        let group = opt(&fields, "GROUP");
        let submit_time = DateTime::parse_from_rfc3339(&get(&fields, "SUBMIT_TIME")?)
            .map_err(|_| err("SUBMIT_TIME", "not RFC3339"))?
            .with_timezone(&Utc);
        let parse_opt_time = |fields: &BTreeMap<String, String>, k: &str| -> Result<Option<DateTime<Utc>>> {
            match opt(fields, k) {
                None => Ok(None),
                Some(v) => Ok(Some(
                    DateTime::parse_from_rfc3339(&v)
                        .map_err(|_| err(k, "not RFC3339"))?
                        .with_timezone(&Utc),
                )),
            }
        };
        let queue_time = parse_opt_time(&fields, "QUEUE_TIME")?;
        let start_time = parse_opt_time(&fields, "START_TIME")?;
        let end_time = parse_opt_time(&fields, "END_TIME")?;
        let pid = opt(&fields, "PID")
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|_| err("PID", "not an integer"))?;
        let status = JobStatus::parse(&get(&fields, "STATUS")?).ok_or_else(|| err("STATUS", "unknown"))?;
        let exit_code = opt(&fields, "EXIT_CODE")
            .map(|v| v.parse::<i32>())
            .transpose()
            .map_err(|_| err("EXIT_CODE", "not an integer"))?;
        let fail_reason = opt(&fields, "FAIL_REASON");

        const KNOWN: &[&str] = &[
            "JOB_ID", "NAME", "USER", "SCRIPT_BASENAME", "WEIGHT", "GPU_SPEC", "CPU_SPEC",
            "MEMORY_SPEC", "PRIORITY", "TIMEOUT", "DEPENDENCIES", "RETRY_MAX",
            "RETRY_DELAY_SECONDS", "RETRY_ON", "RETRY_COUNT", "PRE_HOOK", "POST_HOOK", "ON_FAIL",
            "ON_SUCCESS", "PROJECT", "GROUP", "SUBMIT_TIME", "QUEUE_TIME", "START_TIME",
            "END_TIME", "PID", "STATUS", "EXIT_CODE", "FAIL_REASON",
        ];
        let extra = fields
            .into_iter()
            .filter(|(k, _)| !KNOWN.contains(&k.as_str()))
            .collect();

        Ok(Self {
            job_id,
            name,
            user,
            script_basename,
            weight,
            gpu_spec,
            cpu_spec,
            memory_spec,
            priority,
            timeout,
            dependencies,
            retry_max,
            retry_delay_seconds,
            retry_on,
            retry_count,
            pre_hook,
            post_hook,
            on_fail,
            on_success,
            project,
            group,
            submit_time,
            queue_time,
            start_time,
            end_time,
            pid,
            status,
            exit_code,
            fail_reason,
            extra,
        })
    }
}

/// Atomically write `contents` to `path` via a sibling temp file + rename
/// (Design Notes / §4.1: "All writes to per-field files use
/// write-to-temp-then-rename").
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().ok_or_else(|| SchedError::Validation {
        field: "path".into(),
        reason: format!("{path:?} has no parent directory"),
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| SchedError::io(dir, e))?;
    tmp.write_all(contents.as_bytes()).map_err(|e| SchedError::io(path, e))?;
    tmp.flush().map_err(|e| SchedError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| SchedError::io(path, e.error))?;
    Ok(())
}

pub fn job_info_path(job_dir: &Path) -> PathBuf {
    job_dir.join("job.info")
}

pub fn read_record(job_dir: &Path) -> Result<JobRecord> {
    let path = job_info_path(job_dir);
    let text = std::fs::read_to_string(&path).map_err(|e| SchedError::io(&path, e))?;
    JobRecord::from_kv(&text, &path)
}

pub fn write_record(job_dir: &Path, record: &JobRecord) -> Result<()> {
    write_atomic(&job_info_path(job_dir), &record.to_kv())
}

/// Read the live `pid` iff present, self-healing (§7 "Stale") stale records
/// whose `job.pid` file is gone but whose status still claims RUNNING — the
/// caller decides what "self-heal" means for its own purposes; here we only
/// expose whether the process backing the record is actually alive.
pub fn pid_file_path(job_dir: &Path) -> PathBuf {
    job_dir.join("job.pid")
}

pub fn exit_code_path(job_dir: &Path) -> PathBuf {
    job_dir.join("exit.code")
}

pub fn command_run_path(job_dir: &Path) -> PathBuf {
    job_dir.join("command.run")
}

pub fn log_path(job_dir: &Path, job_id: &str) -> PathBuf {
    job_dir.join(format!("{job_id}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::JobSpec;

    #[test]
    fn round_trips_through_kv_including_unknown_keys() {
        let spec = JobSpec {
            weight: 42,
            ..JobSpec::default()
        };
        let mut record = JobRecord::new("job_001".into(), "alice".into(), &spec);
        record.extra.insert("FUTURE_FIELD".into(), "x".into());
        let kv = record.to_kv();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.info");
        std::fs::write(&path, &kv).unwrap();
        let restored = read_record(dir.path()).unwrap();

        assert_eq!(restored.job_id, "job_001");
        assert_eq!(restored.weight, 42);
        assert_eq!(restored.extra.get("FUTURE_FIELD"), Some(&"x".to_string()));
    }

    #[test]
    fn name_field_na_becomes_none() {
        let spec = JobSpec::default();
        let record = JobRecord::new("job_002".into(), "bob".into(), &spec);
        assert_eq!(record.name, None);
        let kv = record.to_kv();
        assert!(kv.contains("NAME=N/A"));
    }
}
