use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional sync jobs, executed in list order.
    #[serde(default)]
    pub sync_jobs: Vec<SyncJobEntry>,
    /// Free-space requirements checked before and during the run.
    #[serde(default)]
    pub disk_space_monitor: DiskSpaceMonitorConfig,
    /// Snapshot settings.
    pub btrfs_snapshots: BtrfsSnapshotsConfig,
    /// Grace periods and command limits.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Directory for the source lock file.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One entry of the ordered sync job list.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SyncJobEntry {
    /// Registered job name.
    pub name: String,
    /// Disabled entries are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Job-specific configuration, checked by the job itself.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DiskSpaceMonitorConfig {
    /// Free space required before the run starts.
    #[serde(default = "default_preflight")]
    #[schemars(with = "String")]
    pub preflight_minimum: Threshold,
    /// Free space below which the running session aborts.
    #[serde(default = "default_runtime")]
    #[schemars(with = "String")]
    pub runtime_minimum: Threshold,
    /// Free space below which a warning is logged.
    #[serde(default = "default_warning")]
    #[schemars(with = "String")]
    pub warning_threshold: Threshold,
    /// Interval between checks.
    #[serde(default = "default_check_interval", with = "duration_str")]
    #[schemars(with = "String")]
    pub check_interval: Duration,
    /// Mount point whose filesystem is measured.
    #[serde(default = "default_monitor_path")]
    pub path: String,
}

impl Default for DiskSpaceMonitorConfig {
    fn default() -> Self {
        Self {
            preflight_minimum: default_preflight(),
            runtime_minimum: default_runtime(),
            warning_threshold: default_warning(),
            check_interval: default_check_interval(),
            path: default_monitor_path(),
        }
    }
}

fn default_preflight() -> Threshold {
    Threshold::Percent(20.0)
}

fn default_runtime() -> Threshold {
    Threshold::Percent(15.0)
}

fn default_warning() -> Threshold {
    Threshold::Percent(25.0)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_monitor_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BtrfsSnapshotsConfig {
    /// Top-level subvolume names, e.g. `@` and `@home`.
    pub subvolumes: Vec<String>,
    /// Subvolume holding all snapshots.
    #[serde(default = "default_snapshot_root")]
    pub snapshot_root: String,
    /// Sessions always kept by retention cleanup.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Sessions older than this are removed by retention cleanup.
    #[serde(default = "default_max_age", with = "duration_str")]
    #[schemars(with = "String")]
    pub max_age: Duration,
}

fn default_snapshot_root() -> String {
    "/.snapshots".to_string()
}

fn default_keep_recent() -> usize {
    3
}

fn default_max_age() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Timeouts {
    /// How long an interrupted job gets to unwind before its processes are killed.
    #[serde(default = "default_job_stop", with = "duration_str")]
    #[schemars(with = "String")]
    pub job_stop: Duration,
    /// How long the disk monitor gets to stop.
    #[serde(default = "default_monitor_stop", with = "duration_str")]
    #[schemars(with = "String")]
    pub monitor_stop: Duration,
    /// Upper bound for one-shot commands.
    #[serde(default = "default_command", with = "duration_str")]
    #[schemars(with = "String")]
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            job_stop: default_job_stop(),
            monitor_stop: default_monitor_stop(),
            command: default_command(),
        }
    }
}

fn default_job_stop() -> Duration {
    Duration::from_secs(5)
}

fn default_monitor_stop() -> Duration {
    Duration::from_secs(2)
}

fn default_command() -> Duration {
    Duration::from_secs(600)
}

/// Free-space threshold: a share of the filesystem or an absolute size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Threshold {
    Percent(f64),
    Bytes(u64),
}

impl Threshold {
    /// Bytes that must remain free on a filesystem of `total` bytes.
    pub fn required_bytes(&self, total: u64) -> u64 {
        match *self {
            Threshold::Percent(p) => ((total as f64) * p / 100.0).ceil() as u64,
            Threshold::Bytes(b) => b,
        }
    }

    pub fn is_met(&self, available: u64, total: u64) -> bool {
        available >= self.required_bytes(total)
    }
}

impl FromStr for Threshold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let value: f64 = pct
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentage: {s}"))?;
            if !(0.0..=100.0).contains(&value) {
                return Err(format!("percentage out of range: {s}"));
            }
            return Ok(Threshold::Percent(value));
        }
        bytesize::ByteSize::from_str(s)
            .map(|b| Threshold::Bytes(b.as_u64()))
            .map_err(|e| format!("invalid size '{s}': {e}"))
    }
}

impl TryFrom<String> for Threshold {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Threshold> for String {
    fn from(value: Threshold) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Percent(p) => write!(f, "{p}%"),
            Threshold::Bytes(b) => write!(f, "{}", bytesize::ByteSize::b(*b)),
        }
    }
}

/// Serde adapter for humantime durations ("30s", "7days").
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl Config {
    /// Check cross-field rules. Returns every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let snaps = &self.btrfs_snapshots;
        if snaps.subvolumes.is_empty() {
            errors.push("btrfs_snapshots.subvolumes must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for sub in &snaps.subvolumes {
            if sub.is_empty() || sub.contains('/') {
                errors.push(format!(
                    "btrfs_snapshots.subvolumes: '{sub}' must be a top-level subvolume name"
                ));
            }
            if !seen.insert(sub) {
                errors.push(format!("btrfs_snapshots.subvolumes: duplicate '{sub}'"));
            }
        }
        if !snaps.snapshot_root.starts_with('/') {
            errors.push("btrfs_snapshots.snapshot_root must be an absolute path".to_string());
        }
        if snaps.keep_recent == 0 {
            errors.push("btrfs_snapshots.keep_recent must be at least 1".to_string());
        }
        let disk = &self.disk_space_monitor;
        if disk.check_interval.is_zero() {
            errors.push("disk_space_monitor.check_interval must be positive".to_string());
        }
        if let (Threshold::Percent(runtime), Threshold::Percent(preflight)) =
            (disk.runtime_minimum, disk.preflight_minimum)
            && runtime > preflight
        {
            errors.push(
                "disk_space_monitor.runtime_minimum must not exceed preflight_minimum".to_string(),
            );
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            errors.push(format!("logging.level: invalid filter '{}'", self.logging.level));
        }
        errors
    }
}

/// Default location: `$XDG_CONFIG_HOME/snapsync/config.json`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/etc"));
    base.join("snapsync").join("config.json")
}

/// Generate JSON Schema for the Config type.
pub fn generate_schema() -> String {
    let schema = schemars::schema_for!(Config);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// Load a Config from a JSON file.
pub fn load_config(path: &Path) -> Result<Config> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open config {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Create a Config from a JSON string.
pub fn from_json(json: &str) -> Result<Config> {
    let config = serde_json::from_str(json)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal() -> Config {
        from_json(r#"{ "btrfs_snapshots": { "subvolumes": ["@", "@home"] } }"#).unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let config = minimal();
        assert_eq!(config.btrfs_snapshots.snapshot_root, "/.snapshots");
        assert_eq!(config.btrfs_snapshots.keep_recent, 3);
        assert_eq!(config.timeouts.job_stop, Duration::from_secs(5));
        assert_eq!(config.disk_space_monitor.runtime_minimum, Threshold::Percent(15.0));
        assert!(config.sync_jobs.is_empty());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn thresholds_parse_percent_and_size() {
        assert_eq!("15%".parse::<Threshold>().unwrap(), Threshold::Percent(15.0));
        assert_eq!(
            "1 KiB".parse::<Threshold>().unwrap(),
            Threshold::Bytes(1024)
        );
        assert!("150%".parse::<Threshold>().is_err());
        assert!("lots".parse::<Threshold>().is_err());

        assert_eq!(Threshold::Percent(10.0).required_bytes(1000), 100);
        assert!(Threshold::Bytes(500).is_met(500, 1000));
        assert!(!Threshold::Percent(50.0).is_met(499, 1000));
    }

    #[test]
    fn validate_collects_every_problem() {
        let config = from_json(
            r#"{
                "btrfs_snapshots": { "subvolumes": ["@", "@", "a/b"], "snapshot_root": "rel", "keep_recent": 0 },
                "disk_space_monitor": { "runtime_minimum": "30%", "preflight_minimum": "20%", "check_interval": "0s" }
            }"#,
        )
        .unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 6, "{errors:#?}");
    }

    #[test]
    fn sync_jobs_keep_declared_order() {
        let config = from_json(
            r#"{
                "btrfs_snapshots": { "subvolumes": ["@"] },
                "sync_jobs": [
                    { "name": "dummy_fail" },
                    { "name": "dummy_success", "enabled": false, "config": { "duration": "1s" } }
                ]
            }"#,
        )
        .unwrap();
        let names: Vec<_> = config.sync_jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["dummy_fail", "dummy_success"]);
        assert!(config.sync_jobs[0].enabled);
        assert!(!config.sync_jobs[1].enabled);
    }

    #[test]
    fn schema_mentions_sections() {
        let schema = generate_schema();
        assert!(schema.contains("btrfs_snapshots"));
        assert!(schema.contains("sync_jobs"));
    }
}
