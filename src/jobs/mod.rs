//! The job contract and the built-in jobs.
//!
//! A job is a unit of work with a configuration schema, a read-only
//! pre-flight check and an execute step. Whether it can be disabled and
//! whether it runs in the sequential pipeline or alongside it are two flags
//! on the job, not separate job types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::events::{Event, EventSink, LogLevel, ProgressUpdate};
use crate::remote::{Executor, Machine};

pub mod disk_monitor;
pub mod dummy;
pub mod file_sync;
pub mod snapshot;

pub use disk_monitor::DiskSpaceMonitorJob;
pub use dummy::{DummyFailJob, DummySuccessJob};
pub use file_sync::FileSyncJob;
pub use snapshot::SnapshotJob;

/// Where a job runs relative to the sequential pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    Sequential,
    Background,
}

/// Problem with a job's configuration, found without any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub job: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.job, self.message)
    }
}

/// Problem found by a job's pre-flight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub job: String,
    pub host: Option<Machine>,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(host) => write!(f, "{} ({host}): {}", self.job, self.message),
            None => write!(f, "{}: {}", self.job, self.message),
        }
    }
}

/// Execution environment of one job instance.
#[derive(Clone)]
pub struct JobContext {
    pub job: String,
    pub config: Value,
    pub source: Arc<dyn Executor>,
    pub target: Arc<dyn Executor>,
    pub session_id: String,
    pub source_hostname: String,
    pub target_hostname: String,
    /// Cooperative stop signal for this job.
    pub cancel: CancellationToken,
    sink: Arc<dyn EventSink>,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: &str,
        config: Value,
        source: Arc<dyn Executor>,
        target: Arc<dyn Executor>,
        session_id: &str,
        source_hostname: &str,
        target_hostname: &str,
        cancel: CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            job: job.to_string(),
            config,
            source,
            target,
            session_id: session_id.to_string(),
            source_hostname: source_hostname.to_string(),
            target_hostname: target_hostname.to_string(),
            cancel,
            sink,
        }
    }

    /// Typed view of this job's configuration.
    pub fn config<C: DeserializeOwned>(&self) -> Result<C> {
        Ok(serde_json::from_value(self.config.clone())?)
    }

    pub fn executor(&self, machine: Machine) -> &Arc<dyn Executor> {
        match machine {
            Machine::Source => &self.source,
            Machine::Target => &self.target,
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.publish(Event::log(level, Some(&self.job), message));
    }

    pub fn log_on(&self, host: Machine, level: LogLevel, message: impl Into<String>) {
        self.sink.publish(Event::Log {
            ts: chrono::Utc::now(),
            level,
            job: Some(self.job.clone()),
            host: Some(host),
            message: message.into(),
        });
    }

    pub fn progress(&self, update: ProgressUpdate) {
        self.sink.publish(Event::Progress {
            ts: chrono::Utc::now(),
            job: self.job.clone(),
            update,
        });
    }

    pub fn publish(&self, event: Event) {
        self.sink.publish(event);
    }

    /// `Err(SyncError::Cancelled)` once a stop was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled.into());
        }
        Ok(())
    }

    /// Sleep that ends early with `SyncError::Cancelled` on a stop request.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled.into()),
        }
    }
}

/// A unit of sync work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Required jobs cannot be disabled through configuration.
    fn required(&self) -> bool {
        false
    }

    fn mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::Sequential
    }

    /// JSON Schema of the job's configuration.
    fn config_schema(&self) -> Value;

    /// Check `raw` against the schema. Pure: no I/O.
    fn validate_config(&self, raw: &Value) -> Vec<ConfigError>;

    /// Read-only pre-flight checks. Reports every problem found.
    async fn validate(&self, ctx: &JobContext) -> Vec<ValidationError>;

    /// Do the work. On cancellation, release what was started and return
    /// `SyncError::Cancelled`.
    async fn execute(&self, ctx: &JobContext) -> Result<()>;
}

/// Schema of `C` as JSON.
pub fn schema_of<C: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(C)).unwrap_or_default()
}

/// Deserialize `raw` into `C`, reporting failure as a config error of `job`.
pub fn parse_config<C: DeserializeOwned>(job: &str, raw: &Value) -> Result<C, Vec<ConfigError>> {
    let raw = if raw.is_null() {
        Value::Object(Default::default())
    } else {
        raw.clone()
    };
    serde_json::from_value(raw).map_err(|e| {
        vec![ConfigError {
            job: job.to_string(),
            message: e.to_string(),
        }]
    })
}

/// Every built-in job, required ones included.
pub fn registry() -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(SnapshotJob),
        Arc::new(DiskSpaceMonitorJob),
        Arc::new(FileSyncJob),
        Arc::new(DummySuccessJob),
        Arc::new(DummyFailJob),
    ]
}

/// Look up a built-in job by name.
pub fn lookup(name: &str) -> Option<Arc<dyn Job>> {
    registry().into_iter().find(|job| job.name() == name)
}

/// Names of the jobs that may appear in `sync_jobs`.
pub fn optional_job_names() -> Vec<String> {
    registry()
        .iter()
        .filter(|job| !job.required())
        .map(|job| job.name().to_string())
        .collect()
}

/// A job together with the configuration it will run with.
#[derive(Clone)]
pub struct PlannedJob {
    pub job: Arc<dyn Job>,
    pub config: Value,
}

impl PlannedJob {
    pub fn new(job: Arc<dyn Job>, config: Value) -> Self {
        Self { job, config }
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }
}

impl fmt::Debug for PlannedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannedJob")
            .field("name", &self.job.name())
            .field("required", &self.job.required())
            .field("mode", &self.job.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_flags() {
        assert_eq!(
            optional_job_names(),
            vec!["file_sync", "dummy_success", "dummy_fail"]
        );
        for name in optional_job_names() {
            let job = lookup(&name).unwrap();
            assert_eq!(job.mode(), ConcurrencyMode::Sequential);
        }
        let monitor = lookup("disk_space_monitor").unwrap();
        assert!(monitor.required());
        assert_eq!(monitor.mode(), ConcurrencyMode::Background);
        assert!(lookup("btrfs_snapshots").unwrap().required());
        assert!(lookup("rsync_everything").is_none());
    }

    #[test]
    fn every_job_publishes_a_schema() {
        for job in registry() {
            let schema = job.config_schema();
            assert!(schema.is_object(), "{} has no schema", job.name());
        }
        let file_sync = lookup("file_sync").unwrap().config_schema();
        assert!(file_sync["properties"].get("paths").is_some());
    }

    #[test]
    fn parse_config_reports_job_name() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Cfg {
            count: u32,
        }
        let errors = parse_config::<Cfg>("demo", &serde_json::json!({ "count": "x" })).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].job, "demo");
        assert!(errors[0].to_string().starts_with("demo: "));
    }
}
