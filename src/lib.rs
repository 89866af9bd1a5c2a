// src/lib.rs
//
// =============================================================================
// WJM: SINGLE-WORKSTATION JOB SCHEDULER
// =============================================================================
//
// There is no scheduler daemon: every command below is a short-lived
// process that reads the on-disk state, makes one decision, and exits. The
// only long-lived process per job is its own Supervisor (`src/supervisor.rs`),
// spawned detached by the submission path and outliving the CLI invocation
// that created it.
//
// Module map:
//   error       — the `SchedError` taxonomy and its exit-code mapping
//   config      — the `Config` value threaded through every call
//   directive   — script header directive parsing (`# NAME: VALUE`)
//   record      — the `job.info` KEY=VALUE codec
//   store       — on-disk layout: job dirs, queue sidecars, archive batches
//   lock        — the three named locks (Scheduler, IdGen, QueueDrain)
//   idgen       — job id allocation
//   resources   — CPU/memory/GPU probing and derived commitment accounting
//   admission   — capacity/dependency/GPU admission decisions
//   queue       — priority-with-backfill queue draining
//   array       — `--array` submission-time job expansion
//   submit      — ties directive/array/idgen/admission/queue together
//   supervisor  — per-job process lifecycle: hooks, timeout, retry, signals
//   lifecycle   — archive/clean/doctor/validate-config/resources/version

pub mod admission;
pub mod array;
pub mod config;
pub mod directive;
pub mod error;
pub mod idgen;
pub mod lifecycle;
pub mod lock;
pub mod queue;
pub mod record;
pub mod resources;
pub mod store;
pub mod submit;
pub mod supervisor;

pub use config::Config;
pub use error::{Result, SchedError};
