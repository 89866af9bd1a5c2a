// src/array.rs
//
// =============================================================================
// WJM: ARRAY JOB EXPANSION (v 0.1)
// =============================================================================
//
// `--array <spec>` is a submission-time factory: it turns one script into N
// independent `JobSpec`s, each carrying its own `WJM_ARRAY_INDEX`/
// `WJM_ARRAY_SIZE` via the record's `extra` bucket. The core engine
// (admission, queueing, supervision) never learns array semantics exist —
// it only ever sees ordinary JobSpecs (Design Notes: "keep the core engine
// ignorant of array semantics").
//
// `group` (shared across all members, equal to the array's own generating
// job id) and `WJM_ARRAY_ID` aren't stamped here: the generating job id
// doesn't exist yet at expansion time, so `submit::submit` allocates it and
// patches every member afterward.
//
// Spec grammar: `START-END` or `START-END:STEP`, e.g. `1-10` or `0-99:10`.

use crate::directive::JobSpec;
use crate::error::{Result, SchedError};

/// A parsed `--array` spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySpec {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl ArraySpec {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || SchedError::Validation {
            field: "--array".into(),
            reason: format!("expected START-END or START-END:STEP, got '{s}'"),
        };
        let (range_part, step) = match s.split_once(':') {
            Some((r, step_s)) => (r, step_s.trim().parse::<i64>().map_err(|_| invalid())?),
            None => (s, 1),
        };
        let (start_s, end_s) = range_part.split_once('-').ok_or_else(invalid)?;
        let start: i64 = start_s.trim().parse().map_err(|_| invalid())?;
        let end: i64 = end_s.trim().parse().map_err(|_| invalid())?;
        if step <= 0 || start > end {
            return Err(invalid());
        }
        Ok(Self { start, end, step })
    }

    pub fn indices(&self) -> Vec<i64> {
        let mut out = Vec::new();
        let mut i = self.start;
        while i <= self.end {
            out.push(i);
            i += self.step;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.indices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expands `base` into one `JobSpec` per array index, stamping
/// `WJM_ARRAY_INDEX`/`WJM_ARRAY_SIZE` markers that `JobRecord::new` will
/// carry into the `extra` bucket via the caller (the submission path copies
/// them onto the record after construction, since `JobSpec` itself has no
/// `extra` field — only records do). `group` and `WJM_ARRAY_ID` are added
/// by the caller once the generating job id is known.
pub fn expand(base: &JobSpec, spec: &ArraySpec) -> Vec<(JobSpec, Vec<(String, String)>)> {
    let indices = spec.indices();
    let size = indices.len();

    indices
        .into_iter()
        .map(|idx| {
            let mut job = base.clone();
            if let Some(name) = &base.name {
                job.name = Some(format!("{name}[{idx}]"));
            }
            let markers = vec![
                ("WJM_ARRAY_INDEX".to_string(), idx.to_string()),
                ("WJM_ARRAY_SIZE".to_string(), size.to_string()),
            ];
            (job, markers)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_range() {
        let spec = ArraySpec::parse("1-5").unwrap();
        assert_eq!(spec.indices(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn parses_range_with_step() {
        let spec = ArraySpec::parse("0-9:3").unwrap();
        assert_eq!(spec.indices(), vec![0, 3, 6, 9]);
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(ArraySpec::parse("10-1").is_err());
    }

    #[test]
    fn expand_produces_one_job_per_index_with_index_markers() {
        let base = JobSpec {
            name: Some("train".into()),
            ..JobSpec::default()
        };
        let spec = ArraySpec::parse("0-2").unwrap();
        let expanded = expand(&base, &spec);
        assert_eq!(expanded.len(), 3);
        assert_eq!(expanded[0].0.name.as_deref(), Some("train[0]"));
        assert_eq!(expanded[1].1, vec![
            ("WJM_ARRAY_INDEX".to_string(), "1".to_string()),
            ("WJM_ARRAY_SIZE".to_string(), "3".to_string()),
        ]);
    }
}
