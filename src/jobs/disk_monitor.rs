use anyhow::Result;
use async_trait::async_trait;
use bytesize::ByteSize;
use serde_json::Value;

use super::{
    ConcurrencyMode, ConfigError, Job, JobContext, ValidationError, parse_config, schema_of,
};
use crate::btrfs;
use crate::config::{DiskSpaceMonitorConfig, Threshold};
use crate::error::SyncError;
use crate::events::{LogLevel, ProgressUpdate};
use crate::remote::{Machine, run_checked};

/// Watches free space on both machines while the sync jobs run and fails
/// the session the moment it drops below the reserved minimum.
pub struct DiskSpaceMonitorJob;

impl DiskSpaceMonitorJob {
    pub const NAME: &'static str = "disk_space_monitor";

    async fn measure(ctx: &JobContext, machine: Machine, path: &str) -> Result<(u64, u64)> {
        let out = run_checked(ctx.executor(machine).as_ref(), &btrfs::free_space(path)).await?;
        btrfs::parse_free_space(&out.stdout)
    }
}

fn describe(available: u64, total: u64) -> String {
    let pct = if total == 0 {
        0.0
    } else {
        available as f64 * 100.0 / total as f64
    };
    format!("{} ({pct:.1}%)", ByteSize::b(available))
}

fn required(threshold: &Threshold, total: u64) -> String {
    format!("{threshold} ({})", ByteSize::b(threshold.required_bytes(total)))
}

#[async_trait]
impl Job for DiskSpaceMonitorJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn required(&self) -> bool {
        true
    }

    fn mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::Background
    }

    fn config_schema(&self) -> Value {
        schema_of::<DiskSpaceMonitorConfig>()
    }

    fn validate_config(&self, raw: &Value) -> Vec<ConfigError> {
        let config: DiskSpaceMonitorConfig = match parse_config(Self::NAME, raw) {
            Ok(c) => c,
            Err(errors) => return errors,
        };
        let mut errors = Vec::new();
        if config.check_interval.is_zero() {
            errors.push(ConfigError {
                job: Self::NAME.to_string(),
                message: "check_interval must be positive".to_string(),
            });
        }
        if !config.path.starts_with('/') {
            errors.push(ConfigError {
                job: Self::NAME.to_string(),
                message: format!("path '{}' is not absolute", config.path),
            });
        }
        errors
    }

    async fn validate(&self, ctx: &JobContext) -> Vec<ValidationError> {
        let config: DiskSpaceMonitorConfig = match ctx.config() {
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
            match Self::measure(ctx, machine, &config.path).await {
                Ok((total, available)) if !config.preflight_minimum.is_met(available, total) => {
                    errors.push(ValidationError {
                        job: Self::NAME.to_string(),
                        host: Some(machine),
                        message: format!(
                            "only {} free on {}, need {}",
                            describe(available, total),
                            config.path,
                            required(&config.preflight_minimum, total)
                        ),
                    });
                }
                Ok(_) => {}
                Err(e) => errors.push(ValidationError {
                    job: Self::NAME.to_string(),
                    host: Some(machine),
                    message: format!("cannot determine free space: {e:#}"),
                }),
            }
        }
        errors
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        let config: DiskSpaceMonitorConfig = ctx.config()?;
        let mut warned = [false, false];
        loop {
            for (i, machine) in [Machine::Source, Machine::Target].into_iter().enumerate() {
                let (total, available) = match Self::measure(ctx, machine, &config.path).await {
                    Ok(v) => v,
                    Err(e) => {
                        ctx.log_on(machine, LogLevel::Warning, format!("free space check failed: {e:#}"));
                        continue;
                    }
                };
                if !config.runtime_minimum.is_met(available, total) {
                    let err = SyncError::DiskSpace {
                        machine,
                        available: describe(available, total),
                        required: required(&config.runtime_minimum, total),
                    };
                    ctx.log_on(machine, LogLevel::Critical, err.to_string());
                    return Err(err.into());
                }
                if !config.warning_threshold.is_met(available, total) {
                    if !warned[i] {
                        ctx.log_on(
                            machine,
                            LogLevel::Warning,
                            format!("free space low: {}", describe(available, total)),
                        );
                        warned[i] = true;
                    }
                } else {
                    warned[i] = false;
                }
            }
            ctx.progress(ProgressUpdate::heartbeat());
            ctx.sleep(config.check_interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_defaults_are_valid() {
        assert!(DiskSpaceMonitorJob.validate_config(&Value::Null).is_empty());
        assert_eq!(DiskSpaceMonitorJob.mode(), ConcurrencyMode::Background);
    }

    #[test]
    fn config_rejects_bad_values() {
        let errors = DiskSpaceMonitorJob.validate_config(&json!({
            "check_interval": "0s",
            "path": "relative"
        }));
        assert_eq!(errors.len(), 2);
        let errors = DiskSpaceMonitorJob.validate_config(&json!({ "runtime_minimum": "lots" }));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn describes_amounts() {
        assert_eq!(describe(50, 200), format!("{} (25.0%)", ByteSize::b(50)));
        assert!(required(&Threshold::Percent(10.0), 1000).starts_with("10%"));
    }
}
