// src/idgen.rs
//
// =============================================================================
// WJM: ID ALLOCATOR (v 0.1)
// =============================================================================
//
// Job ids are `job_NNN` with N in 1..=999. The allocator scans existing
// record directories, takes `1 + max(existing)`, and claims the id by
// exclusive-creating its directory — the filesystem itself is the
// test-and-set (§4.3). On a losing race (`AlreadyExists`) it rescans and
// retries; under the `IdGen` lock this only happens if something outside
// the scheduler is also creating `job_*` directories, but the retry loop
// costs nothing and removes that assumption.

use crate::config::Config;
use crate::error::{Result, SchedError};
use crate::lock::{self, LockName, LockTracker};
use crate::store;
use std::time::Duration;

const MAX_JOB_NUM: u32 = 999;
const MAX_ATTEMPTS: u32 = 1000;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Allocates the next free job id and creates its (empty) record directory
/// as the claim. Callers that decide not to keep the id (admission refusal)
/// must call [`store::remove_empty_record_dir`] to give it back.
pub fn allocate(config: &Config, tracker: &LockTracker) -> Result<String> {
    let _guard = lock::acquire(config, tracker, LockName::IdGen, lock::IDGEN_TIMEOUT)?;

    for attempt in 0..MAX_ATTEMPTS {
        let existing = store::list_all_job_dirs(config)?;
        let mut max_n: u32 = 0;
        for id in &existing {
            if let Some(n) = store::numeric_suffix(id) {
                max_n = max_n.max(n);
            }
        }
        let next = max_n + 1;
        if next > MAX_JOB_NUM {
            return Err(SchedError::IdExhausted);
        }
        let job_id = store::format_job_id(next);
        let dir = store::job_dir(config, &job_id);

        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok(job_id),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if attempt + 1 == MAX_ATTEMPTS {
                    break;
                }
                std::thread::sleep(RETRY_DELAY);
                continue;
            }
            Err(e) => return Err(SchedError::io(&dir, e)),
        }
    }

    Err(SchedError::Other(anyhow::anyhow!(
        "could not allocate a job id after {MAX_ATTEMPTS} attempts"
    )))
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
    fn allocates_job_001_first() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let id = allocate(&cfg, &tracker).unwrap();
        assert_eq!(id, "job_001");
    }

    #[test]
    fn fills_gaps_via_max_plus_one() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        std::fs::create_dir_all(cfg.job_dir.join("job_001")).unwrap();
        std::fs::write(cfg.job_dir.join("job_001").join("job.info"), "x").unwrap();
        std::fs::create_dir_all(cfg.job_dir.join("job_003")).unwrap();
        std::fs::write(cfg.job_dir.join("job_003").join("job.info"), "x").unwrap();

        let id = allocate(&cfg, &tracker).unwrap();
        assert_eq!(id, "job_004");
    }

    #[test]
    fn exhaustion_past_999_is_reported() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        std::fs::create_dir_all(cfg.job_dir.join("job_999")).unwrap();
        std::fs::write(cfg.job_dir.join("job_999").join("job.info"), "x").unwrap();

        let err = allocate(&cfg, &tracker).unwrap_err();
        assert!(matches!(err, SchedError::IdExhausted));
    }

    #[test]
    fn allocated_dir_exists_and_is_empty_until_record_written() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let id = allocate(&cfg, &tracker).unwrap();
        let dir = store::job_dir(&cfg, &id);
        assert!(dir.is_dir());
        assert!(!dir.join("job.info").exists());
    }
}
