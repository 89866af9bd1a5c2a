// src/lock.rs
//
// =============================================================================
// WJM: LOCK MANAGER (v 0.1)
// =============================================================================
//
// Three named exclusive locks guard the critical sections that matter when
// several short-lived CLI invocations race each other on the same state
// directory: `Scheduler` (admission decisions), `IdGen` (job id allocation)
// and `QueueDrain` (queue processing). Locks are advisory file-range locks
// via `fs2`; if the lock file itself can't be opened (read-only mount,
// missing parent) we fall back to an exclusive-create directory as a
// test-and-set, the same trick the ID Allocator uses for ids (§4.2, §4.3).
//
// Ordering is fixed and enforced at runtime: Scheduler > IdGen > QueueDrain.
// A caller holding IdGen may not then acquire Scheduler; it must release
// first. Locks never nest with themselves.

use crate::config::Config;
use crate::error::{Result, SchedError};
use fs2::FileExt;
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockName {
    QueueDrain,
    IdGen,
    Scheduler,
}

impl LockName {
    fn file_name(self) -> &'static str {
        match self {
            LockName::QueueDrain => "queue_drain.lock",
            LockName::IdGen => "idgen.lock",
            LockName::Scheduler => "scheduler.lock",
        }
    }

    fn label(self) -> &'static str {
        match self {
            LockName::QueueDrain => "QueueDrain",
            LockName::IdGen => "IdGen",
            LockName::Scheduler => "Scheduler",
        }
    }

    /// Ordering rank: a held lock with a lower-or-equal rank blocks
    /// acquisition of `self` (Scheduler > IdGen > QueueDrain).
    fn rank(self) -> u8 {
        match self {
            LockName::Scheduler => 2,
            LockName::IdGen => 1,
            LockName::QueueDrain => 0,
        }
    }
}

/// Tracks locks held by the current process so acquisition order can be
/// enforced without a global registry. Cheaply cloneable (shared interior
/// state) so both the caller and any outstanding [`LockGuard`]s can see
/// the same held-set.
#[derive(Debug, Clone, Default)]
pub struct LockTracker {
    held_ranks: Rc<RefCell<Vec<u8>>>,
}

impl LockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_order(&self, name: LockName) -> Result<()> {
        if self.held_ranks.borrow().iter().any(|r| *r <= name.rank()) {
            return Err(SchedError::Other(anyhow::anyhow!(
                "lock ordering violation: cannot acquire {} while holding a lower-ranked lock",
                name.label()
            )));
        }
        Ok(())
    }

    fn push(&self, rank: u8) {
        self.held_ranks.borrow_mut().push(rank);
    }

    fn pop(&self, rank: u8) {
        let mut held = self.held_ranks.borrow_mut();
        if let Some(pos) = held.iter().rposition(|r| *r == rank) {
            held.remove(pos);
        }
    }
}

enum Backend {
    File(File),
    /// Directory used as a test-and-set sentinel when the lock file itself
    /// could not be opened (e.g. read-only mount).
    Dir(PathBuf),
}

/// An acquired lock; dropping it releases the underlying primitive.
pub struct LockGuard {
    name: LockName,
    backend: Backend,
    tracker: LockTracker,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.backend {
            Backend::File(f) => {
                let _ = FileExt::unlock(f);
            }
            Backend::Dir(p) => {
                let _ = std::fs::remove_dir(p);
            }
        }
        self.tracker.pop(self.name.rank());
    }
}

fn lock_path(config: &Config, name: LockName) -> PathBuf {
    config.state_dir().join(name.file_name())
}

fn open_lock_file(path: &PathBuf) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}

/// Blocking acquire with a timeout. `QueueDrain` callers should use
/// [`try_acquire`] instead (§4.2: queue processing yields rather than waits).
pub fn acquire(
    config: &Config,
    tracker: &LockTracker,
    name: LockName,
    timeout: Duration,
) -> Result<LockGuard> {
    tracker.check_order(name)?;
    let path = lock_path(config, name);
    let deadline = Instant::now() + timeout;

    match open_lock_file(&path) {
        Ok(file) => loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracker.push(name.rank());
                    return Ok(LockGuard {
                        name,
                        backend: Backend::File(file),
                        tracker: tracker.clone(),
                    });
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return Err(SchedError::LockTimeout(name.label(), timeout)),
            }
        },
        Err(_) => acquire_via_directory(tracker, name, &path, deadline, timeout),
    }
}

/// Non-blocking acquire; returns `Ok(None)` immediately if already held.
pub fn try_acquire(config: &Config, tracker: &LockTracker, name: LockName) -> Result<Option<LockGuard>> {
    tracker.check_order(name)?;
    let path = lock_path(config, name);

    match open_lock_file(&path) {
        Ok(file) => match file.try_lock_exclusive() {
            Ok(()) => {
                tracker.push(name.rank());
                Ok(Some(LockGuard {
                    name,
                    backend: Backend::File(file),
                    tracker: tracker.clone(),
                }))
            }
            Err(_) => Ok(None),
        },
        Err(_) => {
            let sentinel = path.with_extension("dir");
            match std::fs::create_dir(&sentinel) {
                Ok(()) => {
                    tracker.push(name.rank());
                    Ok(Some(LockGuard {
                        name,
                        backend: Backend::Dir(sentinel),
                        tracker: tracker.clone(),
                    }))
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
                Err(e) => Err(SchedError::io(&sentinel, e)),
            }
        }
    }
}

fn acquire_via_directory(
    tracker: &LockTracker,
    name: LockName,
    path: &PathBuf,
    deadline: Instant,
    timeout: Duration,
) -> Result<LockGuard> {
    let sentinel = path.with_extension("dir");
    loop {
        match std::fs::create_dir(&sentinel) {
            Ok(()) => {
                tracker.push(name.rank());
                return Ok(LockGuard {
                    name,
                    backend: Backend::Dir(sentinel),
                    tracker: tracker.clone(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return Err(SchedError::LockTimeout(name.label(), timeout));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(SchedError::io(&sentinel, e)),
        }
    }
}

pub const SCHEDULER_TIMEOUT: Duration = Duration::from_secs(30);
pub const IDGEN_TIMEOUT: Duration = Duration::from_secs(30);

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
    fn same_lock_cannot_be_acquired_twice_concurrently() {
        let (_dir, cfg) = cfg();
        let t1 = LockTracker::new();
        let _g1 = acquire(&cfg, &t1, LockName::Scheduler, Duration::from_millis(200)).unwrap();

        let t2 = LockTracker::new();
        let second = try_acquire(&cfg, &t2, LockName::Scheduler).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let (_dir, cfg) = cfg();
        {
            let t1 = LockTracker::new();
            let _g1 = acquire(&cfg, &t1, LockName::IdGen, Duration::from_millis(200)).unwrap();
        }
        let t2 = LockTracker::new();
        let second = try_acquire(&cfg, &t2, LockName::IdGen).unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn acquiring_out_of_order_is_rejected() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let _idgen = acquire(&cfg, &tracker, LockName::IdGen, Duration::from_millis(200)).unwrap();
        let scheduler = acquire(&cfg, &tracker, LockName::Scheduler, Duration::from_millis(200));
        assert!(scheduler.is_err());
    }

    #[test]
    fn scheduler_then_idgen_is_allowed() {
        let (_dir, cfg) = cfg();
        let tracker = LockTracker::new();
        let _sched = acquire(&cfg, &tracker, LockName::Scheduler, Duration::from_millis(200)).unwrap();
        let idgen = acquire(&cfg, &tracker, LockName::IdGen, Duration::from_millis(200));
        assert!(idgen.is_ok());
    }
}
