use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing_subscriber::EnvFilter;

use crate::cli::{CleanupArgs, Command, RollbackArgs, SchemaArgs, SyncArgs};
use crate::config::{self, Config};
use crate::error::SyncError;
use crate::events::{Event, EventSink, LogLevel};
use crate::exit_codes::{self, exit};
use crate::jobs;
use crate::lock;
use crate::orchestrator::{Orchestrator, signal_interrupts};
use crate::prompt::{Confirm, FixedAnswer, TerminalConfirm};
use crate::remote::{Executor, LocalExecutor, SshExecutor, local_hostname};
use crate::reporter::Reporter;
use crate::snapshot::{self, Phase, RollbackOutcome, SnapshotManager};

/// Dispatch a subcommand that needs the async runtime.
pub async fn run(command: Command) -> Result<i32> {
    match command {
        Command::Schema(args) => {
            println!("{}", schema(&args)?);
            Ok(exit::SUCCESS)
        }
        Command::Sync(args) => sync(args).await,
        Command::Rollback(args) => rollback(args).await,
        Command::CleanupSnapshots(args) => cleanup_snapshots(args).await,
    }
}

/// JSON Schema of the config file, or of one job's `config` block.
pub fn schema(args: &SchemaArgs) -> Result<String> {
    let Some(name) = &args.job else {
        return Ok(config::generate_schema());
    };
    let Some(job) = jobs::lookup(name) else {
        let known: Vec<_> = jobs::registry().iter().map(|j| j.name().to_string()).collect();
        bail!("unknown job '{name}' (known: {})", known.join(", "));
    };
    Ok(serde_json::to_string_pretty(&job.config_schema())?)
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // Ignored when a subscriber is already installed (tests).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn load(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(config::default_config_path);
    let config = config::load_config(&path).context("failed to load configuration")?;
    init_logging(&config.logging.level);
    Ok(config)
}

pub async fn sync(args: SyncArgs) -> Result<i32> {
    let config = load(args.config)?;
    let reporter = Arc::new(Reporter::new(args.json));
    let confirm: Arc<dyn Confirm> = if args.yes_rollback {
        Arc::new(FixedAnswer(true))
    } else if args.no_rollback {
        Arc::new(FixedAnswer(false))
    } else {
        Arc::new(TerminalConfirm)
    };

    let timeout = Some(config.timeouts.command);
    let source = Arc::new(LocalExecutor::new(timeout));
    let target = Arc::new(SshExecutor::new(
        args.target.clone(),
        &std::process::id().to_string(),
        timeout,
    ));

    let report = Orchestrator::new(config, args.target, source, target, reporter.clone(), confirm)
        .run(signal_interrupts())
        .await;
    if !args.json {
        eprintln!("session {}: {:?}", report.session_id, report.phase);
        eprintln!("{}", reporter.summary());
    }
    Ok(exit_codes::for_phase(report.phase))
}

pub async fn rollback(args: RollbackArgs) -> Result<i32> {
    let config = load(args.config)?;
    let reporter = Reporter::new(args.json);
    let source = LocalExecutor::new(Some(config.timeouts.command));
    let _lock = lock::acquire_source_lock(
        &lock::source_lock_path(config.lock_dir.as_deref()),
        &lock::holder_id(&local_hostname()),
    )?;

    let manager = SnapshotManager::new(&source, &config.btrfs_snapshots.snapshot_root);
    let Some(dir) = manager.find_session(&args.session).await? else {
        bail!(
            "no snapshot session '{}' under {}",
            args.session,
            manager.sessions_root()
        );
    };
    let subvolumes: Vec<String> = manager
        .session_snapshots(&dir)
        .await?
        .into_iter()
        .filter(|s| s.phase == Phase::Pre)
        .map(|s| s.subvolume)
        .collect();

    let confirm: Box<dyn Confirm> = if args.yes {
        Box::new(FixedAnswer(true))
    } else {
        Box::new(TerminalConfirm)
    };
    match snapshot::offer_rollback(&manager, &dir, &subvolumes, confirm.as_ref(), &reporter).await? {
        RollbackOutcome::NotApplicable => Err(SyncError::Rollback(format!(
            "session {} has no pre-sync snapshots",
            dir.name
        ))
        .into()),
        RollbackOutcome::Declined | RollbackOutcome::RolledBack(_) => Ok(exit::SUCCESS),
    }
}

async fn cleanup_on(
    exec: &dyn Executor,
    config: &Config,
    keep_recent: usize,
    max_age: std::time::Duration,
    reporter: &Reporter,
) -> Result<()> {
    let manager = SnapshotManager::new(exec, &config.btrfs_snapshots.snapshot_root);
    let deleted = manager.cleanup(keep_recent, max_age, Utc::now()).await?;
    let message = if deleted.is_empty() {
        format!("no snapshot sessions to delete on {}", exec.machine())
    } else {
        let names: Vec<_> = deleted.iter().map(|d| d.name.as_str()).collect();
        format!("deleted on {}: {}", exec.machine(), names.join(", "))
    };
    reporter.publish(Event::log(LogLevel::Info, None, message));
    Ok(())
}

pub async fn cleanup_snapshots(args: CleanupArgs) -> Result<i32> {
    let config = load(args.config)?;
    let reporter = Reporter::new(args.json);
    let keep_recent = args
        .keep_recent
        .unwrap_or(config.btrfs_snapshots.keep_recent);
    let max_age = args
        .older_than
        .map(Into::into)
        .unwrap_or(config.btrfs_snapshots.max_age);
    let timeout = Some(config.timeouts.command);

    let _lock = lock::acquire_source_lock(
        &lock::source_lock_path(config.lock_dir.as_deref()),
        &lock::holder_id(&local_hostname()),
    )?;
    cleanup_on(&LocalExecutor::new(timeout), &config, keep_recent, max_age, &reporter).await?;

    if let Some(host) = args.target {
        let target = SshExecutor::new(host.clone(), &std::process::id().to_string(), timeout);
        target
            .connect()
            .await
            .with_context(|| format!("cannot connect to {host}"))?;
        let result = cleanup_on(&target, &config, keep_recent, max_age, &reporter).await;
        target.close().await.ok();
        result?;
    }
    Ok(exit::SUCCESS)
}
