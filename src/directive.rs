// src/directive.rs
//
// =============================================================================
// WJM: DIRECTIVE PARSER (v 0.1)
// =============================================================================
//
// Reads script header lines until the first non-directive, non-empty,
// non-shebang comment (§4.4). Recognized directives are case-sensitive
// `#<space><NAME>:<space><VALUE>` comments. CLI flags override directives;
// presets supply defaults before directives are applied.

use crate::config::Config;
use crate::error::{Result, SchedError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn value(self) -> i32 {
        match self {
            Priority::Urgent => 40,
            Priority::High => 30,
            Priority::Normal => 20,
            Priority::Low => 10,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => Some(Priority::Urgent),
            "high" => Some(Priority::High),
            "normal" => Some(Priority::Normal),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GpuSpec {
    NotApplicable,
    List(Vec<u32>),
    Auto,
    AutoCount(u32),
    Any,
}

impl GpuSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("n/a") {
            return Ok(GpuSpec::NotApplicable);
        }
        if s.eq_ignore_ascii_case("any") {
            return Ok(GpuSpec::Any);
        }
        if s.eq_ignore_ascii_case("auto") {
            return Ok(GpuSpec::Auto);
        }
        if let Some(rest) = s.strip_prefix("auto:").or_else(|| s.strip_prefix("auto :")) {
            let k: u32 = rest.trim().parse().map_err(|_| SchedError::Validation {
                field: "GPU".into(),
                reason: format!("invalid auto:K count in '{s}'"),
            })?;
            return Ok(GpuSpec::AutoCount(k));
        }
        let mut ids = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let id: u32 = part.parse().map_err(|_| SchedError::Validation {
                field: "GPU".into(),
                reason: format!("invalid GPU id '{part}' in '{s}'"),
            })?;
            ids.push(id);
        }
        if ids.is_empty() {
            return Err(SchedError::Validation {
                field: "GPU".into(),
                reason: format!("could not parse GPU spec '{s}'"),
            });
        }
        Ok(GpuSpec::List(ids))
    }

    pub fn to_field(&self) -> String {
        match self {
            GpuSpec::NotApplicable => "N/A".to_string(),
            GpuSpec::Any => "any".to_string(),
            GpuSpec::Auto => "auto".to_string(),
            GpuSpec::AutoCount(k) => format!("auto:{k}"),
            GpuSpec::List(ids) => ids
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, GpuSpec::Auto | GpuSpec::AutoCount(_) | GpuSpec::Any)
    }

    pub fn requested_count(&self) -> u32 {
        match self {
            GpuSpec::NotApplicable => 0,
            GpuSpec::List(ids) => ids.len() as u32,
            GpuSpec::Auto => 1,
            GpuSpec::AutoCount(k) => *k,
            GpuSpec::Any => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CpuSpec {
    NotApplicable,
    Count(u32),
    Range(u32, u32),
    List(Vec<u32>),
}

impl CpuSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("n/a") {
            return Ok(CpuSpec::NotApplicable);
        }
        if let Some((a, b)) = s.split_once('-') {
            let a: u32 = a.trim().parse().map_err(|_| invalid_cpu(s))?;
            let b: u32 = b.trim().parse().map_err(|_| invalid_cpu(s))?;
            if a > b {
                return Err(invalid_cpu(s));
            }
            return Ok(CpuSpec::Range(a, b));
        }
        if s.contains(',') {
            let ids: Result<Vec<u32>> = s
                .split(',')
                .map(|p| p.trim().parse::<u32>().map_err(|_| invalid_cpu(s)))
                .collect();
            return Ok(CpuSpec::List(ids?));
        }
        let count: u32 = s.parse().map_err(|_| invalid_cpu(s))?;
        Ok(CpuSpec::Count(count))
    }

    pub fn to_field(&self) -> String {
        match self {
            CpuSpec::NotApplicable => "N/A".to_string(),
            CpuSpec::Count(n) => n.to_string(),
            CpuSpec::Range(a, b) => format!("{a}-{b}"),
            CpuSpec::List(ids) => ids
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Resolve to a concrete list of core ids (bare count means `0..count-1`, §4.8).
    pub fn resolve_ids(&self) -> Vec<u32> {
        match self {
            CpuSpec::NotApplicable => vec![],
            CpuSpec::Count(n) => (0..*n).collect(),
            CpuSpec::Range(a, b) => (*a..=*b).collect(),
            CpuSpec::List(ids) => ids.clone(),
        }
    }
}

fn invalid_cpu(s: &str) -> SchedError {
    SchedError::Validation {
        field: "CPU".into(),
        reason: format!("invalid CPU spec '{s}'"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemorySpec {
    NotApplicable,
    Bytes(u64),
    Percent(f64),
}

impl MemorySpec {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("n/a") {
            return Ok(MemorySpec::NotApplicable);
        }
        let invalid = || SchedError::Validation {
            field: "MEMORY".into(),
            reason: format!("invalid memory spec '{s}'"),
        };
        if let Some(pct) = s.strip_suffix('%') {
            let v: f64 = pct.trim().parse().map_err(|_| invalid())?;
            if !(0.0..=100.0).contains(&v) {
                return Err(invalid());
            }
            return Ok(MemorySpec::Percent(v));
        }
        let s = s.strip_suffix('B').unwrap_or(s);
        let (num_part, mult) = match s.chars().last() {
            Some(c @ ('K' | 'M' | 'G' | 'T')) => (
                &s[..s.len() - 1],
                match c {
                    'K' => 1024u64,
                    'M' => 1024 * 1024,
                    'G' => 1024 * 1024 * 1024,
                    'T' => 1024u64 * 1024 * 1024 * 1024,
                    _ => unreachable!(),
                },
            ),
            _ => (s, 1u64),
        };
        let n: u64 = num_part.trim().parse().map_err(|_| invalid())?;
        Ok(MemorySpec::Bytes(n * mult))
    }

    pub fn to_field(&self) -> String {
        match self {
            MemorySpec::NotApplicable => "N/A".to_string(),
            MemorySpec::Bytes(b) => format!("{b}B"),
            MemorySpec::Percent(p) => format!("{p}%"),
        }
    }

    /// Resolve to a byte ceiling given total system memory (for `%` specs).
    pub fn resolve_bytes(&self, total_mem_bytes: u64) -> Option<u64> {
        match self {
            MemorySpec::NotApplicable => None,
            MemorySpec::Bytes(b) => Some(*b),
            MemorySpec::Percent(p) => Some(((total_mem_bytes as f64) * p / 100.0) as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryOn {
    Any,
    Codes(BTreeSet<i32>),
}

impl RetryOn {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("any") {
            return Ok(RetryOn::Any);
        }
        let mut codes = BTreeSet::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let code: i32 = part.parse().map_err(|_| SchedError::Validation {
                field: "RETRY_ON".into(),
                reason: format!("invalid exit code '{part}' in '{s}'"),
            })?;
            codes.insert(code);
        }
        Ok(RetryOn::Codes(codes))
    }

    pub fn to_field(&self) -> String {
        match self {
            RetryOn::Any => "any".to_string(),
            RetryOn::Codes(codes) => codes
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn matches(&self, exit_code: i32) -> bool {
        match self {
            RetryOn::Any => exit_code != 0,
            RetryOn::Codes(codes) => codes.is_empty() || codes.contains(&exit_code),
        }
    }
}

/// A fully resolved submission, after preset defaults, directive parsing
/// and CLI overrides have all been layered (§4.4 ordering).
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: Option<String>,
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
    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
    pub on_fail: Option<String>,
    pub on_success: Option<String>,
    pub project: Option<String>,
    pub group: Option<String>,
    pub script_body: String,
    pub script_basename: String,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            name: None,
            weight: 10,
            gpu_spec: GpuSpec::NotApplicable,
            cpu_spec: CpuSpec::NotApplicable,
            memory_spec: MemorySpec::NotApplicable,
            priority: Priority::Normal,
            timeout: None,
            dependencies: BTreeSet::new(),
            retry_max: 0,
            retry_delay_seconds: 60,
            retry_on: RetryOn::Any,
            pre_hook: None,
            post_hook: None,
            on_fail: None,
            on_success: None,
            project: None,
            group: None,
            script_body: String::new(),
            script_basename: String::new(),
        }
    }
}

fn parse_duration(s: &str) -> Result<std::time::Duration> {
    let s = s.trim();
    let invalid = || SchedError::Validation {
        field: "TIMEOUT".into(),
        reason: format!("invalid duration '{s}'"),
    };
    let (num_part, mult) = match s.chars().last() {
        Some('s') => (&s[..s.len() - 1], 1u64),
        Some('m') => (&s[..s.len() - 1], 60),
        Some('h') => (&s[..s.len() - 1], 3600),
        Some('d') => (&s[..s.len() - 1], 86400),
        _ => (s, 1),
    };
    let n: u64 = num_part.trim().parse().map_err(|_| invalid())?;
    Ok(std::time::Duration::from_secs(n * mult))
}

fn validate_identifier(field: &str, s: &str) -> Result<()> {
    if s.len() > 50 || s.chars().any(|c| c == '/' || c == '=' || c.is_control()) {
        return Err(SchedError::Validation {
            field: field.into(),
            reason: format!("'{s}' must be <=50 chars with no '/', '=', or control characters"),
        });
    }
    Ok(())
}

/// Parses header directives out of a script body, applying preset defaults
/// first and stopping at the first non-directive, non-empty, non-shebang
/// comment line (the remainder becomes the script body).
pub fn parse_script(raw: &str, preset: Option<&str>, config: &Config) -> Result<JobSpec> {
    let mut spec = JobSpec {
        weight: config.default_job_weight,
        priority: config.default_job_priority,
        ..JobSpec::default()
    };

    if let Some(preset_name) = preset {
        let defaults = config.presets.get(preset_name).ok_or_else(|| SchedError::Validation {
            field: "--preset".into(),
            reason: format!("unknown preset '{preset_name}'"),
        })?;
        if let Some(w) = defaults.weight {
            spec.weight = w;
        }
        if let Some(p) = defaults.priority {
            spec.priority = p;
        }
        if let Some(g) = &defaults.gpu {
            spec.gpu_spec = GpuSpec::parse(g)?;
        }
    }

    let mut lines = raw.lines().peekable();
    let mut body_start = 0usize;
    let mut consumed = 0usize;

    if let Some(first) = lines.peek() {
        if first.starts_with("#!") {
            consumed += first.len() + 1;
            lines.next();
        }
    }

    for line in lines.by_ref() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            consumed += line.len() + 1;
            continue;
        }
        if !trimmed.starts_with('#') {
            break;
        }
        let comment = trimmed.trim_start_matches('#');
        let Some((name, rest)) = comment.split_once(':') else {
            break;
        };
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
            break;
        }
        let value = rest.trim();
        if !apply_directive(&mut spec, name, value)? {
            break;
        }
        consumed += line.len() + 1;
    }
    body_start = consumed;

    spec.script_body = if body_start >= raw.len() {
        String::new()
    } else {
        raw[body_start..].to_string()
    };

    if let Some(g) = &spec.group {
        validate_identifier("GROUP", g)?;
    }
    if let Some(p) = &spec.project {
        validate_identifier("PROJECT", p)?;
    }
    if spec.weight == 0 || spec.weight > 1000 {
        return Err(SchedError::Validation {
            field: "WEIGHT".into(),
            reason: "must be in 1..=1000".into(),
        });
    }
    if spec.retry_max > 10 {
        return Err(SchedError::Validation {
            field: "RETRY".into(),
            reason: "must be 0..=10".into(),
        });
    }

    Ok(spec)
}

/// Returns `Ok(true)` if the directive was recognized and applied, `Ok(false)`
/// if `name` isn't a recognized directive (parsing should stop there).
fn apply_directive(spec: &mut JobSpec, name: &str, value: &str) -> Result<bool> {
    match name {
        "WEIGHT" => spec.weight = value.parse().map_err(|_| SchedError::Validation {
            field: "WEIGHT".into(),
            reason: format!("expected integer 1..=1000, got '{value}'"),
        })?,
        "GPU" => spec.gpu_spec = GpuSpec::parse(value)?,
        "PRIORITY" => {
            spec.priority = Priority::parse(value).ok_or_else(|| SchedError::Validation {
                field: "PRIORITY".into(),
                reason: format!("unknown priority '{value}'"),
            })?
        }
        "TIMEOUT" => spec.timeout = Some(parse_duration(value)?),
        "RETRY" => spec.retry_max = value.parse().map_err(|_| SchedError::Validation {
            field: "RETRY".into(),
            reason: format!("expected integer 0..=10, got '{value}'"),
        })?,
        "RETRY_DELAY" => {
            spec.retry_delay_seconds = value.parse().map_err(|_| SchedError::Validation {
                field: "RETRY_DELAY".into(),
                reason: format!("expected non-negative seconds, got '{value}'"),
            })?
        }
        "RETRY_ON" => spec.retry_on = RetryOn::parse(value)?,
        "CPU" | "CORES" => spec.cpu_spec = CpuSpec::parse(value)?,
        "MEMORY" => spec.memory_spec = MemorySpec::parse(value)?,
        "PROJECT" => spec.project = Some(value.to_string()),
        "GROUP" => spec.group = Some(value.to_string()),
        "PRE_HOOK" => spec.pre_hook = Some(value.to_string()),
        "POST_HOOK" => spec.post_hook = Some(value.to_string()),
        "ON_FAIL" => spec.on_fail = Some(value.to_string()),
        "ON_SUCCESS" => spec.on_success = Some(value.to_string()),
        "NAME" => spec.name = Some(value.to_string()),
        _ => return Ok(false),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_directives_and_stops_at_body() {
        let cfg = Config::default();
        let script = "#!/bin/bash\n# WEIGHT: 40\n# PRIORITY: high\n# this is just a comment\necho hi\n";
        let spec = parse_script(script, None, &cfg).unwrap();
        assert_eq!(spec.weight, 40);
        assert_eq!(spec.priority, Priority::High);
        assert!(spec.script_body.contains("this is just a comment"));
        assert!(spec.script_body.contains("echo hi"));
    }

    #[test]
    fn preset_supplies_defaults_overridden_by_directive() {
        let cfg = Config::default();
        let script = "#!/bin/bash\n# WEIGHT: 999\necho hi\n";
        let spec = parse_script(script, Some("small"), &cfg).unwrap();
        assert_eq!(spec.weight, 999);
        assert_eq!(spec.priority, Priority::Low);
    }

    #[test]
    fn rejects_out_of_range_weight() {
        let cfg = Config::default();
        let script = "# WEIGHT: 5000\necho hi\n";
        assert!(parse_script(script, None, &cfg).is_err());
    }

    #[test]
    fn gpu_spec_round_trips() {
        assert_eq!(GpuSpec::parse("auto:2").unwrap(), GpuSpec::AutoCount(2));
        assert_eq!(GpuSpec::parse("0,1").unwrap(), GpuSpec::List(vec![0, 1]));
        assert_eq!(GpuSpec::parse("N/A").unwrap(), GpuSpec::NotApplicable);
    }

    #[test]
    fn cpu_spec_resolves_bare_count_to_zero_based_range() {
        let spec = CpuSpec::parse("4").unwrap();
        assert_eq!(spec.resolve_ids(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn retry_on_empty_means_any_nonzero() {
        let r = RetryOn::parse("").unwrap();
        assert!(r.matches(1));
        assert!(!r.matches(0));
    }

    #[test]
    fn memory_spec_percent_resolves_against_total() {
        let spec = MemorySpec::parse("50%").unwrap();
        assert_eq!(spec.resolve_bytes(1000), Some(500));
    }
}
