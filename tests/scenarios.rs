// Integration tests for the literal scenarios (S1-S6).
//
// These exercise the library surface directly rather than the `wjm`
// binary, since most of the scenarios are about on-disk state transitions
// that don't need a real detached supervisor process. S3's timeout
// escalation is the exception: it runs the real supervisor against a
// script that ignores SIGTERM, so it genuinely takes a little over 10
// seconds (the supervisor's kill grace) to finish.

use std::collections::BTreeSet;
use std::sync::Mutex;
use wjm::config::Config;
use wjm::lock::LockTracker;
use wjm::queue::{self, DispatchOutcome};
use wjm::record::{self, JobStatus};
use wjm::resources::GpuInventory;
use wjm::store;
use wjm::submit::{self, SubmitOutcome, SubmitOverrides, SubmitRequest};

/// `WJM_GPU_IDS` is read by `resources::probe_system`; serialize the one
/// test that sets it so it can't race another test's view of the env.
static GPU_ENV_LOCK: Mutex<()> = Mutex::new(());

fn cfg() -> (tempfile::TempDir, Config) {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::defaults_at(dir.path());
    cfg.ensure_dirs().unwrap();
    (dir, cfg)
}

fn submit_req<'a>(raw: &'a str, overrides: SubmitOverrides) -> SubmitRequest<'a> {
    SubmitRequest {
        raw_script: raw,
        script_basename: "job.sh".to_string(),
        preset: None,
        user: "alice".to_string(),
        force_queue: false,
        array: None,
        overrides,
    }
}

fn mark_terminal(cfg: &Config, job_id: &str, status: JobStatus) {
    let dir = store::job_dir(cfg, job_id);
    let mut rec = record::read_record(&dir).unwrap();
    rec.status = status;
    rec.end_time = Some(chrono::Utc::now());
    record::write_record(&dir, &rec).unwrap();
}

// S1 - Basic admission and terminal state.
#[test]
fn s1_basic_admission_and_backfill() {
    let (_dir, mut cfg) = cfg();
    cfg.max_total_weight = 100;
    let tracker = LockTracker::new();

    let script = "#!/bin/sh\n# WEIGHT: 40\necho hi\n";
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let req = submit_req(script, SubmitOverrides::default());
        outcomes.extend(submit::submit(&cfg, &tracker, &req).unwrap());
    }

    let running: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, SubmitOutcome::Running { .. }))
        .collect();
    let queued: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            SubmitOutcome::Queued { job_id, reason } => Some((job_id.clone(), reason.clone())),
            _ => None,
        })
        .collect();

    assert_eq!(running.len(), 2, "expected two jobs admitted under the weight cap");
    assert_eq!(queued.len(), 1, "the third job should queue");
    assert!(
        queued[0].1.contains("40") && queued[0].1.contains("100"),
        "queue reason should mention the weight math: {}",
        queued[0].1
    );

    // Job 1 completes; a drain tick should promote the queued job.
    mark_terminal(&cfg, "job_001", JobStatus::Completed);
    let inv = GpuInventory { total_ids: vec![] };
    let dispatched = queue::drain_once(&cfg, &tracker, &inv, |_, _| Ok(())).unwrap();
    assert!(matches!(dispatched.as_slice(), [DispatchOutcome::Started { job_id }] if job_id == &queued[0].0));

    mark_terminal(&cfg, "job_002", JobStatus::Completed);
    mark_terminal(&cfg, &queued[0].0, JobStatus::Completed);
    for id in ["job_001", "job_002", &queued[0].0] {
        let rec = record::read_record(&store::job_dir(&cfg, id)).unwrap();
        assert_eq!(rec.status, JobStatus::Completed);
    }
}

// S2 - GPU exclusivity.
#[test]
fn s2_gpu_exclusivity() {
    let _env_guard = GPU_ENV_LOCK.lock().unwrap();
    std::env::set_var("WJM_GPU_IDS", "0,1");

    let (_dir, cfg) = cfg();
    let tracker = LockTracker::new();

    let script_a = "#!/bin/sh\n# GPU: 0\necho a\n";
    let req_a = submit_req(script_a, SubmitOverrides::default());
    let outcome_a = submit::submit(&cfg, &tracker, &req_a).unwrap();
    assert!(matches!(outcome_a[0], SubmitOutcome::Running { .. }));

    let script_b = "#!/bin/sh\n# GPU: 0,1\necho b\n";
    let req_b = submit_req(script_b, SubmitOverrides::default());
    let outcome_b = submit::submit(&cfg, &tracker, &req_b).unwrap();
    match &outcome_b[0] {
        SubmitOutcome::Queued { reason, .. } => {
            assert!(reason.contains('0'), "reason should name GPU 0: {reason}");
        }
        other => panic!("expected job B to queue, got {other:?}"),
    }

    // Killing A frees GPU 0; B should now be admissible.
    mark_terminal(&cfg, "job_001", JobStatus::Killed);
    let inv = GpuInventory { total_ids: vec![0, 1] };
    let dispatched = queue::drain_once(&cfg, &tracker, &inv, |_, _| Ok(())).unwrap();
    assert!(matches!(dispatched.as_slice(), [DispatchOutcome::Started { job_id }] if job_id == "job_002"));

    std::env::remove_var("WJM_GPU_IDS");
}

// S3 - Timeout escalation (runs the real supervisor; ignores SIGTERM so the
// full kill-grace window elapses, ~10s).
#[tokio::test(flavor = "multi_thread")]
async fn s3_timeout_escalates_to_sigkill() {
    let (_dir, cfg) = cfg();
    let tracker = LockTracker::new();

    let script = "#!/bin/sh\ntrap '' TERM\n# TIMEOUT: 1s\nsleep 30\n";
    let req = submit_req(script, SubmitOverrides::default());
    let outcomes = submit::submit(&cfg, &tracker, &req).unwrap();
    let job_id = match &outcomes[0] {
        SubmitOutcome::Running { job_id } => job_id.clone(),
        other => panic!("expected job to run immediately, got {other:?}"),
    };

    let started = std::time::Instant::now();
    wjm::supervisor::run(&cfg, &job_id).await.unwrap();
    let elapsed = started.elapsed();

    let rec = record::read_record(&store::job_dir(&cfg, &job_id)).unwrap();
    assert_eq!(rec.status, JobStatus::Failed);
    assert_eq!(rec.fail_reason.as_deref(), Some("timeout"));
    // The script traps TERM away, so SIGTERM alone never reaps it within
    // KILL_GRACE and SIGKILL is required — exit code must reflect that.
    assert_eq!(rec.exit_code, Some(137));
    assert!(
        elapsed.as_secs() >= 10,
        "expected the full SIGTERM+grace window to elapse, got {elapsed:?}"
    );
}

// S4 - Retry on matching exit code.
#[tokio::test(flavor = "multi_thread")]
async fn s4_retry_on_matching_exit_code_exhausts_then_fails() {
    let (_dir, cfg) = cfg();
    let tracker = LockTracker::new();

    let script = "#!/bin/sh\n# RETRY: 3\n# RETRY_DELAY: 1\n# RETRY_ON: 2\nexit 2\n";
    let req = submit_req(script, SubmitOverrides::default());
    let outcomes = submit::submit(&cfg, &tracker, &req).unwrap();
    let job_id = match &outcomes[0] {
        SubmitOutcome::Running { job_id } => job_id.clone(),
        other => panic!("expected job to run immediately, got {other:?}"),
    };

    wjm::supervisor::run(&cfg, &job_id).await.unwrap();

    let rec = record::read_record(&store::job_dir(&cfg, &job_id)).unwrap();
    assert_eq!(rec.status, JobStatus::Failed);
    assert_eq!(rec.retry_count, 3);
    assert_eq!(rec.exit_code, Some(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_retry_on_non_matching_exit_code_fails_after_one_attempt() {
    let (_dir, cfg) = cfg();
    let tracker = LockTracker::new();

    let script = "#!/bin/sh\n# RETRY: 3\n# RETRY_DELAY: 1\n# RETRY_ON: 5\nexit 2\n";
    let req = submit_req(script, SubmitOverrides::default());
    let outcomes = submit::submit(&cfg, &tracker, &req).unwrap();
    let job_id = match &outcomes[0] {
        SubmitOutcome::Running { job_id } => job_id.clone(),
        other => panic!("expected job to run immediately, got {other:?}"),
    };

    wjm::supervisor::run(&cfg, &job_id).await.unwrap();

    let rec = record::read_record(&store::job_dir(&cfg, &job_id)).unwrap();
    assert_eq!(rec.status, JobStatus::Failed);
    assert_eq!(rec.retry_count, 0, "exit code 2 does not match RETRY_ON: 5");
    assert_eq!(rec.exit_code, Some(2));
}

// S5 - Concurrent submission race.
#[test]
fn s5_concurrent_submitters_get_distinct_ids_with_no_orphans() {
    let (_dir, cfg) = cfg();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let cfg = cfg.clone();
            std::thread::spawn(move || {
                let tracker = LockTracker::new();
                let script = "#!/bin/sh\necho racer\n";
                let req = submit_req(script, SubmitOverrides::default());
                submit::submit(&cfg, &tracker, &req).unwrap()
            })
        })
        .collect();

    let mut ids = BTreeSet::new();
    for h in handles {
        for outcome in h.join().unwrap() {
            match outcome {
                SubmitOutcome::Running { job_id } | SubmitOutcome::Queued { job_id, .. } => {
                    ids.insert(job_id);
                }
            }
        }
    }

    assert_eq!(ids.len(), 5, "expected five distinct job ids, got {ids:?}");
    let expected: BTreeSet<String> = (1..=5).map(|n| format!("job_{n:03}")).collect();
    assert_eq!(ids, expected);

    // No leftover temp files from the atomic-write staging.
    for entry in std::fs::read_dir(&cfg.job_dir).unwrap() {
        let path = entry.unwrap().path();
        assert!(path.join("job.info").exists(), "{path:?} is an orphan record dir");
    }
}

// S6 - Dependency gate.
#[test]
fn s6_dependency_gate_blocks_until_completion() {
    let (_dir, cfg) = cfg();
    let tracker = LockTracker::new();

    let script_a = "#!/bin/sh\nsleep 3\nexit 0\n";
    let req_a = submit_req(script_a, SubmitOverrides::default());
    let outcome_a = submit::submit(&cfg, &tracker, &req_a).unwrap();
    assert!(matches!(outcome_a[0], SubmitOutcome::Running { .. }));

    let script_b = "#!/bin/sh\necho b\n";
    let overrides_b = SubmitOverrides {
        depends_on: vec!["job_001".to_string()],
        ..Default::default()
    };
    let req_b = submit_req(script_b, overrides_b);
    let outcome_b = submit::submit(&cfg, &tracker, &req_b).unwrap();
    match &outcome_b[0] {
        SubmitOutcome::Queued { reason, .. } => assert!(reason.contains("job_001")),
        other => panic!("expected job B to queue on its dependency, got {other:?}"),
    }

    let inv = GpuInventory { total_ids: vec![] };
    let dispatched = queue::drain_once(&cfg, &tracker, &inv, |_, _| Ok(())).unwrap();
    assert!(dispatched.is_empty(), "A hasn't completed yet; B must stay queued");

    mark_terminal(&cfg, "job_001", JobStatus::Completed);
    let dispatched = queue::drain_once(&cfg, &tracker, &inv, |_, _| Ok(())).unwrap();
    assert!(matches!(dispatched.as_slice(), [DispatchOutcome::Started { job_id }] if job_id == "job_002"));
}

#[test]
fn s6_dependency_gate_never_resolves_if_dependency_is_killed() {
    let (_dir, cfg) = cfg();
    let tracker = LockTracker::new();

    let script_a = "#!/bin/sh\nsleep 3\nexit 0\n";
    let req_a = submit_req(script_a, SubmitOverrides::default());
    submit::submit(&cfg, &tracker, &req_a).unwrap();
    mark_terminal(&cfg, "job_001", JobStatus::Killed);

    let script_b = "#!/bin/sh\necho b\n";
    let overrides_b = SubmitOverrides {
        depends_on: vec!["job_001".to_string()],
        ..Default::default()
    };
    let req_b = submit_req(script_b, overrides_b);
    let outcome_b = submit::submit(&cfg, &tracker, &req_b).unwrap();
    assert!(matches!(&outcome_b[0], SubmitOutcome::Queued { .. }));

    let inv = GpuInventory { total_ids: vec![] };
    let dispatched = queue::drain_once(&cfg, &tracker, &inv, |_, _| Ok(())).unwrap();
    assert!(dispatched.is_empty(), "a killed dependency never satisfies the gate");

    assert!(
        wjm::store::queue_script_path(&cfg, "job_002").exists(),
        "job_002 should remain a queue entry, never promoted to a record"
    );
}
