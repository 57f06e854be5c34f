use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Snapshot-guarded one-way sync of machine state.
#[derive(Parser)]
#[command(name = "snapsync", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print JSON Schema for the configuration file.
    Schema(SchemaArgs),
    /// Sync this machine's state to a target machine.
    Sync(SyncArgs),
    /// Restore subvolumes on this machine from a session's pre-sync snapshots.
    Rollback(RollbackArgs),
    /// Delete old snapshot sessions.
    CleanupSnapshots(CleanupArgs),
}

#[derive(Args)]
pub struct SchemaArgs {
    /// Print the schema of one job's `config` block instead.
    #[arg(long)]
    pub job: Option<String>,
}

#[derive(Args)]
pub struct SyncArgs {
    /// SSH destination of the target machine.
    pub target: String,

    /// Path to the configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output structured JSON events to stdout.
    #[arg(long)]
    pub json: bool,

    /// Roll back without asking if the session fails.
    #[arg(long, conflicts_with = "no_rollback")]
    pub yes_rollback: bool,

    /// Never roll back; keep the pre-sync snapshots.
    #[arg(long)]
    pub no_rollback: bool,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Session directory name (`<timestamp>-<id>`) or session id.
    #[arg(long, required = true)]
    pub session: String,

    /// Path to the configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Do not ask for confirmation.
    #[arg(long)]
    pub yes: bool,

    /// Output structured JSON events to stdout.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct CleanupArgs {
    /// Sessions to keep regardless of age (default from config).
    #[arg(long)]
    pub keep_recent: Option<usize>,

    /// Delete sessions older than this, e.g. `7days` (default from config).
    #[arg(long)]
    pub older_than: Option<humantime::Duration>,

    /// Also clean up on this target machine.
    #[arg(long)]
    pub target: Option<String>,

    /// Path to the configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output structured JSON events to stdout.
    #[arg(long)]
    pub json: bool,
}
