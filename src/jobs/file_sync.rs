use std::path::Path;

use anyhow::{Result, bail};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ConfigError, Job, JobContext, ValidationError, parse_config, schema_of};
use crate::error::SyncError;
use crate::events::{LogLevel, ProgressUpdate};
use crate::remote::{Machine, quote};

/// rsync exit code for "some files vanished before they could be transferred".
const RSYNC_VANISHED: i32 = 24;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FileSyncConfig {
    /// Absolute paths mirrored from source to target.
    pub paths: Vec<String>,
    /// Remove files on the target that no longer exist on the source.
    #[serde(default = "default_delete")]
    pub delete: bool,
    /// Patterns passed to rsync as `--exclude`.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_delete() -> bool {
    true
}

/// Mirrors directories to the target with rsync, one path at a time.
pub struct FileSyncJob;

impl FileSyncJob {
    pub const NAME: &'static str = "file_sync";

    /// Remote shell for rsync. With a control socket, rsync rides on the
    /// session's connection and dies with it.
    fn remote_shell(control_path: Option<&Path>) -> String {
        match control_path {
            Some(socket) => format!(
                "ssh -o BatchMode=yes -o ControlMaster=no -o ControlPath={}",
                quote(&socket.display().to_string())
            ),
            None => "ssh -o BatchMode=yes".to_string(),
        }
    }

    fn command(
        config: &FileSyncConfig,
        path: &str,
        target: &str,
        control_path: Option<&Path>,
    ) -> String {
        let mut args = vec![
            "rsync".to_string(),
            "-aAXH".to_string(),
            "--info=progress2".to_string(),
            "--no-inc-recursive".to_string(),
            "-e".to_string(),
            quote(&Self::remote_shell(control_path)),
        ];
        if config.delete {
            args.push("--delete".to_string());
        }
        for pattern in &config.exclude {
            args.push(format!("--exclude={}", quote(pattern)));
        }
        args.push(quote(path));
        args.push(quote(&format!("{target}:{path}")));
        // progress2 redraws with '\r'; split it into lines.
        format!(
            "bash -o pipefail -c {}",
            quote(&format!("{} | tr '\\r' '\\n'", args.join(" ")))
        )
    }
}

/// Percentage from an rsync `--info=progress2` line.
pub fn parse_progress(line: &str) -> Option<u8> {
    line.split_whitespace()
        .find_map(|word| word.strip_suffix('%')?.parse::<u8>().ok())
}

#[async_trait]
impl Job for FileSyncJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn config_schema(&self) -> Value {
        schema_of::<FileSyncConfig>()
    }

    fn validate_config(&self, raw: &Value) -> Vec<ConfigError> {
        let config: FileSyncConfig = match parse_config(Self::NAME, raw) {
            Ok(c) => c,
            Err(errors) => return errors,
        };
        let mut errors = Vec::new();
        if config.paths.is_empty() {
            errors.push(ConfigError {
                job: Self::NAME.to_string(),
                message: "no paths configured".to_string(),
            });
        }
        for path in &config.paths {
            if !path.starts_with('/') {
                errors.push(ConfigError {
                    job: Self::NAME.to_string(),
                    message: format!("path '{path}' is not absolute"),
                });
            }
        }
        errors
    }

    async fn validate(&self, ctx: &JobContext) -> Vec<ValidationError> {
        let config: FileSyncConfig = match ctx.config() {
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
            let found = ctx
                .executor(machine)
                .run("command -v rsync", None)
                .await
                .map(|r| r.success())
                .unwrap_or(false);
            if !found {
                errors.push(ValidationError {
                    job: Self::NAME.to_string(),
                    host: Some(machine),
                    message: "rsync is not installed".to_string(),
                });
            }
        }
        for path in &config.paths {
            let exists = ctx
                .source
                .run(&format!("test -e {}", quote(path)), None)
                .await
                .map(|r| r.success())
                .unwrap_or(false);
            if !exists {
                errors.push(ValidationError {
                    job: Self::NAME.to_string(),
                    host: Some(Machine::Source),
                    message: format!("{path} does not exist"),
                });
            }
        }
        errors
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        let config: FileSyncConfig = ctx.config()?;
        let total = config.paths.len() as u64;
        let control_path = ctx.target.control_path();
        for (i, path) in config.paths.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.log(LogLevel::Info, format!("syncing {path}"));
            let mut rsync = ctx
                .source
                .start_process(&Self::command(
                    &config,
                    path,
                    &ctx.target_hostname,
                    control_path.as_deref(),
                ))
                .await?;
            loop {
                tokio::select! {
                    line = rsync.next_line() => match line? {
                        Some(line) => {
                            if let Some(pct) = parse_progress(&line) {
                                ctx.progress(ProgressUpdate::percent(pct).with_item(path.clone()));
                            }
                        }
                        None => break,
                    },
                    _ = ctx.cancel.cancelled() => {
                        rsync.terminate().await.ok();
                        return Err(SyncError::Cancelled.into());
                    }
                }
            }
            let result = rsync.wait().await?;
            match result.code {
                0 => {}
                RSYNC_VANISHED => ctx.log(
                    LogLevel::Warning,
                    format!("some files under {path} vanished during transfer"),
                ),
                code => bail!("rsync of {path} exited with {code}: {}", result.stderr.trim()),
            }
            ctx.progress(ProgressUpdate::count(i as u64 + 1, total).with_item(path.clone()));
        }
        Ok(())
    }
}
