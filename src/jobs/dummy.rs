//! Jobs that only pretend to sync. They hold a process open on the target
//! and report progress, which makes the whole pipeline observable without
//! touching any data.

use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ConfigError, Job, JobContext, ValidationError, parse_config, schema_of};
use crate::config::duration_str;
use crate::events::{LogLevel, ProgressUpdate};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DummyConfig {
    /// Total run time.
    #[serde(default = "default_duration", with = "duration_str")]
    #[schemars(with = "String")]
    pub duration: Duration,
    /// Number of progress reports.
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Percentage at which `dummy_fail` raises.
    #[serde(default = "default_fail_at")]
    pub fail_at_percent: u8,
    /// Keep going after a stop request, to exercise forced termination.
    #[serde(default)]
    pub ignore_stop: bool,
}

fn default_duration() -> Duration {
    Duration::from_secs(2)
}

fn default_steps() -> u32 {
    10
}

fn default_fail_at() -> u8 {
    60
}

fn check(job: &str, raw: &Value) -> Vec<ConfigError> {
    let config: DummyConfig = match parse_config(job, raw) {
        Ok(c) => c,
        Err(errors) => return errors,
    };
    let mut errors = Vec::new();
    if config.steps == 0 {
        errors.push(ConfigError {
            job: job.to_string(),
            message: "steps must be at least 1".to_string(),
        });
    }
    if config.fail_at_percent > 100 {
        errors.push(ConfigError {
            job: job.to_string(),
            message: "fail_at_percent must be within 0-100".to_string(),
        });
    }
    errors
}

/// Percentage of `steps` covered after `done` of them, clamped to 100.
fn percent_done(done: u32, steps: u32) -> u8 {
    let pct = u64::from(done) * 100 / u64::from(steps.max(1));
    pct.min(100) as u8
}

/// Run the simulated work; `fail_at` makes it raise at that percentage.
async fn simulate(ctx: &JobContext, config: &DummyConfig, fail_at: Option<u8>) -> Result<()> {
    let mut remote = ctx
        .target
        .start_process(&format!("sleep {}", config.duration.as_secs().max(1)))
        .await?;
    let step = config.duration / config.steps;
    for i in 1..=config.steps {
        if config.ignore_stop {
            tokio::time::sleep(step).await;
        } else if let Err(stop) = ctx.sleep(step).await {
            ctx.log(LogLevel::Info, "stop requested, terminating remote work");
            remote.terminate().await.ok();
            return Err(stop);
        }
        let pct = percent_done(i, config.steps);
        ctx.progress(ProgressUpdate::percent(pct).with_item(format!("step {i}/{}", config.steps)));
        if let Some(fail_at) = fail_at
            && pct >= fail_at
        {
            bail!("simulated failure at {pct}%");
        }
    }
    remote.terminate().await?;
    ctx.log(LogLevel::Info, "done");
    Ok(())
}

pub struct DummySuccessJob;

impl DummySuccessJob {
    pub const NAME: &'static str = "dummy_success";
}

#[async_trait]
impl Job for DummySuccessJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn config_schema(&self) -> Value {
        schema_of::<DummyConfig>()
    }

    fn validate_config(&self, raw: &Value) -> Vec<ConfigError> {
        check(Self::NAME, raw)
    }

    async fn validate(&self, _ctx: &JobContext) -> Vec<ValidationError> {
        Vec::new()
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        let config: DummyConfig = ctx.config()?;
        simulate(ctx, &config, None).await
    }
}

pub struct DummyFailJob;

impl DummyFailJob {
    pub const NAME: &'static str = "dummy_fail";
}

#[async_trait]
impl Job for DummyFailJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn config_schema(&self) -> Value {
        schema_of::<DummyConfig>()
    }

    fn validate_config(&self, raw: &Value) -> Vec<ConfigError> {
        check(Self::NAME, raw)
    }

    async fn validate(&self, _ctx: &JobContext) -> Vec<ValidationError> {
        Vec::new()
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        let config: DummyConfig = ctx.config()?;
        simulate(ctx, &config, Some(config.fail_at_percent)).await
    }
}
