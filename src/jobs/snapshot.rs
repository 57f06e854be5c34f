use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ConfigError, Job, JobContext, ValidationError, parse_config, schema_of};
use crate::events::{Event, LogLevel, ProgressUpdate};
use crate::remote::Machine;
use crate::snapshot::{Phase, SessionDir, SnapshotManager};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SnapshotJobConfig {
    pub phase: Phase,
    pub subvolumes: Vec<String>,
    pub snapshot_root: String,
    /// Session directory name, `<timestamp>-<session-id>`.
    pub session_dir: String,
}

/// Snapshots every configured subvolume on both machines. Runs twice per
/// session, before and after the sync jobs, and cannot be disabled.
pub struct SnapshotJob;

impl SnapshotJob {
    pub const NAME: &'static str = "btrfs_snapshots";
}

#[async_trait]
impl Job for SnapshotJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn required(&self) -> bool {
        true
    }

    fn config_schema(&self) -> Value {
        schema_of::<SnapshotJobConfig>()
    }

    fn validate_config(&self, raw: &Value) -> Vec<ConfigError> {
        let config: SnapshotJobConfig = match parse_config(Self::NAME, raw) {
            Ok(c) => c,
            Err(errors) => return errors,
        };
        let mut errors = Vec::new();
        let mut error = |message: String| {
            errors.push(ConfigError {
                job: Self::NAME.to_string(),
                message,
            })
        };
        if config.subvolumes.is_empty() {
            error("no subvolumes configured".to_string());
        }
        if !config.snapshot_root.starts_with('/') {
            error(format!("snapshot root '{}' is not absolute", config.snapshot_root));
        }
        if SessionDir::parse(&config.snapshot_root, &config.session_dir).is_none() {
            error(format!("invalid session directory '{}'", config.session_dir));
        }
        errors
    }

    async fn validate(&self, ctx: &JobContext) -> Vec<ValidationError> {
        let config: SnapshotJobConfig = match ctx.config() {
            Ok(c) => c,
            Err(e) => {
                return vec![ValidationError {
                    job: Self::NAME.to_string(),
                    host: None,
                    message: format!("{e:#}"),
                }];
            }
        };
        let mut errors = Vec::new();
        for machine in [Machine::Source, Machine::Target] {
            let manager = SnapshotManager::new(ctx.executor(machine).as_ref(), &config.snapshot_root);
            if let Err(e) = manager.check_prerequisites(&config.subvolumes).await {
                errors.push(ValidationError {
                    job: Self::NAME.to_string(),
                    host: Some(machine),
                    message: format!("{e:#}"),
                });
            }
        }
        errors
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        let config: SnapshotJobConfig = ctx.config()?;
        let machines = [Machine::Source, Machine::Target];
        for (done, machine) in machines.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let manager = SnapshotManager::new(ctx.executor(machine).as_ref(), &config.snapshot_root);
            let dir = SessionDir::parse(&manager.sessions_root(), &config.session_dir)
                .ok_or_else(|| anyhow::anyhow!("invalid session directory {}", config.session_dir))?;
            ctx.log_on(
                machine,
                LogLevel::Info,
                format!("creating {} snapshots of {}", config.phase, config.subvolumes.join(", ")),
            );
            let created = manager
                .create_snapshots(config.phase, &config.subvolumes, &dir)
                .await?;
            for snapshot in created {
                ctx.publish(Event::SnapshotCreated {
                    machine,
                    path: snapshot.path,
                });
            }
            ctx.progress(
                ProgressUpdate::count(done as u64 + 1, machines.len() as u64)
                    .with_item(machine.to_string()),
            );
        }
        Ok(())
    }
}
