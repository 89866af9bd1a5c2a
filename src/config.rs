// src/config.rs
//
// =============================================================================
// WJM: CONFIGURATION (v 0.1)
// =============================================================================
//
// A single explicit `Config` value threaded through the call tree (Design
// Notes §9: "model as an explicit Config value... not as side-effectful
// variable mutations"). Loaded from a KEY=VALUE text file; every key has a
// default so a missing config file is never fatal.

use crate::directive::Priority;
use crate::error::{Result, SchedError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PresetDefaults {
    pub weight: Option<u32>,
    pub priority: Option<Priority>,
    pub gpu: Option<String>,
    pub devices: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub max_jobs: Option<u32>,
    pub max_weight: Option<u32>,
    pub requires_gpu: bool,
    pub priority_boost: i32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub job_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub log_dir: PathBuf,

    pub max_concurrent_jobs: u32,
    pub max_total_weight: u32,
    pub max_total_jobs: u32,

    pub default_job_weight: u32,
    pub default_job_priority: Priority,
    pub priority_queue_enabled: bool,

    pub archive_threshold: u32,
    pub max_archive_batches: u32,

    pub log_file_name: String,
    pub watch_refresh_interval_ms: u64,
    pub max_log_size_mb: u64,
    pub log_rotation_count: u32,
    pub log_cleanup_days: u32,
    pub log_compression_enabled: bool,

    pub dependencies_enabled: bool,

    pub presets: BTreeMap<String, PresetDefaults>,
    pub queues: BTreeMap<String, QueueLimits>,

    /// Root directory this config was resolved relative to (for `resources`/`doctor` display).
    pub root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let root = PathBuf::from(".");
        Self {
            job_dir: root.join("jobs"),
            queue_dir: root.join("queue"),
            archive_dir: root.join("archive"),
            log_dir: root.join("logs"),
            max_concurrent_jobs: 0,
            max_total_weight: 0,
            max_total_jobs: 0,
            default_job_weight: 10,
            default_job_priority: Priority::Normal,
            priority_queue_enabled: true,
            archive_threshold: 100,
            max_archive_batches: 0,
            log_file_name: "jobXXX.log".to_string(),
            watch_refresh_interval_ms: 1000,
            max_log_size_mb: 100,
            log_rotation_count: 3,
            log_cleanup_days: 30,
            log_compression_enabled: true,
            dependencies_enabled: true,
            presets: default_presets(),
            queues: BTreeMap::new(),
            root,
        }
    }
}

fn default_presets() -> BTreeMap<String, PresetDefaults> {
    let mut m = BTreeMap::new();
    m.insert(
        "small".into(),
        PresetDefaults {
            weight: Some(5),
            priority: Some(Priority::Low),
            gpu: None,
            devices: None,
        },
    );
    m.insert(
        "medium".into(),
        PresetDefaults {
            weight: Some(20),
            priority: Some(Priority::Normal),
            gpu: None,
            devices: None,
        },
    );
    m.insert(
        "large".into(),
        PresetDefaults {
            weight: Some(50),
            priority: Some(Priority::Normal),
            gpu: None,
            devices: None,
        },
    );
    m.insert(
        "gpu".into(),
        PresetDefaults {
            weight: Some(30),
            priority: Some(Priority::High),
            gpu: Some("auto:1".into()),
            devices: None,
        },
    );
    m.insert(
        "urgent".into(),
        PresetDefaults {
            weight: Some(10),
            priority: Some(Priority::Urgent),
            gpu: None,
            devices: None,
        },
    );
    m
}

impl Config {
    /// Load a config file if it exists, merging recognized keys over the
    /// defaults. Unknown keys are ignored (forward-compatible, mirrors the
    /// record codec's own tolerance policy). `root` becomes the base for
    /// any directory key left unset.
    pub fn load(path: impl AsRef<Path>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut cfg = Self::defaults_at(&root);

        let path = path.as_ref();
        if !path.exists() {
            return Ok(cfg);
        }

        let text = std::fs::read_to_string(path).map_err(|e| SchedError::io(path, e))?;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            cfg.apply_key(key, value, lineno + 1)?;
        }
        Ok(cfg)
    }

    pub fn defaults_at(root: &Path) -> Self {
        let mut cfg = Self::default();
        cfg.root = root.to_path_buf();
        cfg.job_dir = root.join("jobs");
        cfg.queue_dir = root.join("queue");
        cfg.archive_dir = root.join("archive");
        cfg.log_dir = root.join("logs");
        cfg
    }

    fn apply_key(&mut self, key: &str, value: &str, lineno: usize) -> Result<()> {
        let parse_u32 = |v: &str| -> Result<u32> {
            v.parse::<u32>().map_err(|_| SchedError::Validation {
                field: format!("config line {lineno}"),
                reason: format!("expected non-negative integer, got '{v}'"),
            })
        };
        let parse_bool = |v: &str| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");

        if let Some(queue_name) = key
            .strip_prefix("QUEUE_")
            .and_then(|rest| rest.split('_').next())
        {
            self.apply_queue_key(queue_name, key, value)?;
            return Ok(());
        }
        if let Some(preset_name) = key
            .strip_prefix("PRESET_")
            .and_then(|rest| rest.rsplit_once('_').map(|(name, _)| name))
        {
            self.apply_preset_key(&preset_name.to_ascii_lowercase(), key, value)?;
            return Ok(());
        }

        match key {
            "JOB_DIR" => self.job_dir = self.root.join(value),
            "QUEUE_DIR" => self.queue_dir = self.root.join(value),
            "ARCHIVE_DIR" => self.archive_dir = self.root.join(value),
            "LOG_DIR" => self.log_dir = self.root.join(value),
            "MAX_CONCURRENT_JOBS" => self.max_concurrent_jobs = parse_u32(value)?,
            "MAX_TOTAL_WEIGHT" => self.max_total_weight = parse_u32(value)?,
            "MAX_TOTAL_JOBS" => self.max_total_jobs = parse_u32(value)?,
            "DEFAULT_JOB_WEIGHT" => self.default_job_weight = parse_u32(value)?,
            "DEFAULT_JOB_PRIORITY" => {
                self.default_job_priority =
                    Priority::parse(value).ok_or_else(|| SchedError::Validation {
                        field: "DEFAULT_JOB_PRIORITY".into(),
                        reason: format!("unknown priority '{value}'"),
                    })?
            }
            "PRIORITY_QUEUE_ENABLED" => self.priority_queue_enabled = parse_bool(value),
            "ARCHIVE_THRESHOLD" => self.archive_threshold = parse_u32(value)?,
            "MAX_ARCHIVE_BATCHES" => self.max_archive_batches = parse_u32(value)?,
            "LOG_FILE_NAME" => {
                if !value.contains("XXX") {
                    return Err(SchedError::Validation {
                        field: "LOG_FILE_NAME".into(),
                        reason: "must contain the XXX placeholder".into(),
                    });
                }
                self.log_file_name = value.to_string();
            }
            "WATCH_REFRESH_INTERVAL" => self.watch_refresh_interval_ms = parse_u32(value)? as u64,
            "MAX_LOG_SIZE_MB" => self.max_log_size_mb = parse_u32(value)? as u64,
            "LOG_ROTATION_COUNT" => self.log_rotation_count = parse_u32(value)?,
            "LOG_CLEANUP_DAYS" => self.log_cleanup_days = parse_u32(value)?,
            "LOG_COMPRESSION_ENABLED" => self.log_compression_enabled = parse_bool(value),
            "DEPENDENCIES_ENABLED" => self.dependencies_enabled = parse_bool(value),
            _ => { /* unknown key: forward-compatible, ignore */ }
        }
        Ok(())
    }

    fn apply_preset_key(&mut self, name: &str, key: &str, value: &str) -> Result<()> {
        let entry = self.presets.entry(name.to_string()).or_insert(PresetDefaults {
            weight: None,
            priority: None,
            gpu: None,
            devices: None,
        });
        if key.ends_with("_WEIGHT") {
            entry.weight = Some(value.parse().map_err(|_| SchedError::Validation {
                field: key.to_string(),
                reason: format!("expected integer, got '{value}'"),
            })?);
        } else if key.ends_with("_PRIORITY") {
            entry.priority = Priority::parse(value);
        } else if key.ends_with("_GPU") {
            entry.gpu = Some(value.to_string());
        } else if key.ends_with("_DEVICES") {
            entry.devices = Some(value.to_string());
        }
        Ok(())
    }

    fn apply_queue_key(&mut self, name: &str, key: &str, value: &str) -> Result<()> {
        let entry = self.queues.entry(name.to_string()).or_insert(QueueLimits {
            max_jobs: None,
            max_weight: None,
            requires_gpu: false,
            priority_boost: 0,
        });
        if key.ends_with("_MAX_JOBS") {
            entry.max_jobs = Some(value.parse().unwrap_or(0));
        } else if key.ends_with("_MAX_WEIGHT") {
            entry.max_weight = Some(value.parse().unwrap_or(0));
        } else if key.ends_with("_REQUIRES_GPU") {
            entry.requires_gpu = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        } else if key.ends_with("_PRIORITY_BOOST") {
            entry.priority_boost = value.parse().unwrap_or(0);
        }
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.job_dir, &self.queue_dir, &self.archive_dir, &self.log_dir] {
            std::fs::create_dir_all(dir).map_err(|e| SchedError::io(dir, e))?;
        }
        std::fs::create_dir_all(self.state_dir()).map_err(|e| SchedError::io(self.state_dir(), e))?;
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".scheduler_state")
    }

    pub fn managed_pids_path(&self) -> PathBuf {
        self.state_dir().join("managed_pids.txt")
    }

    /// Report every key we don't recognize, for `validate-config`.
    pub fn validate_unknown_keys(path: impl AsRef<Path>) -> Result<Vec<String>> {
        const KNOWN_PREFIXES: &[&str] = &["PRESET_", "QUEUE_"];
        const KNOWN_EXACT: &[&str] = &[
            "JOB_DIR",
            "QUEUE_DIR",
            "ARCHIVE_DIR",
            "LOG_DIR",
            "MAX_CONCURRENT_JOBS",
            "MAX_TOTAL_WEIGHT",
            "MAX_TOTAL_JOBS",
            "DEFAULT_JOB_WEIGHT",
            "DEFAULT_JOB_PRIORITY",
            "PRIORITY_QUEUE_ENABLED",
            "ARCHIVE_THRESHOLD",
            "MAX_ARCHIVE_BATCHES",
            "LOG_FILE_NAME",
            "WATCH_REFRESH_INTERVAL",
            "MAX_LOG_SIZE_MB",
            "LOG_ROTATION_COUNT",
            "LOG_CLEANUP_DAYS",
            "LOG_COMPRESSION_ENABLED",
            "DEPENDENCIES_ENABLED",
        ];
        let path = path.as_ref();
        if !path.exists() {
            return Ok(vec![]);
        }
        let text = std::fs::read_to_string(path).map_err(|e| SchedError::io(path, e))?;
        let mut unknown = vec![];
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, _)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if KNOWN_EXACT.contains(&key) || KNOWN_PREFIXES.iter().any(|p| key.starts_with(p)) {
                continue;
            }
            unknown.push(key.to_string());
        }
        Ok(unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_sane_dirs() {
        let cfg = Config::default();
        assert_eq!(cfg.max_concurrent_jobs, 0);
        assert_eq!(cfg.default_job_priority, Priority::Normal);
    }

    #[test]
    fn load_applies_known_keys_and_ignores_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("wjm.conf");
        std::fs::write(
            &cfg_path,
            "MAX_CONCURRENT_JOBS=4\nMAX_TOTAL_WEIGHT=100\nTOTALLY_UNKNOWN=1\nQUEUE_gpu_MAX_JOBS=2\n",
        )
        .unwrap();
        let cfg = Config::load(&cfg_path, dir.path()).unwrap();
        assert_eq!(cfg.max_concurrent_jobs, 4);
        assert_eq!(cfg.max_total_weight, 100);
        assert_eq!(cfg.queues.get("gpu").unwrap().max_jobs, Some(2));
    }

    #[test]
    fn log_file_name_requires_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("wjm.conf");
        std::fs::write(&cfg_path, "LOG_FILE_NAME=job.log\n").unwrap();
        assert!(Config::load(&cfg_path, dir.path()).is_err());
    }

    #[test]
    fn validate_unknown_keys_reports_only_unrecognized() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("wjm.conf");
        std::fs::write(&cfg_path, "MAX_CONCURRENT_JOBS=4\nBOGUS_KEY=1\n").unwrap();
        let unknown = Config::validate_unknown_keys(&cfg_path).unwrap();
        assert_eq!(unknown, vec!["BOGUS_KEY".to_string()]);
    }
}
