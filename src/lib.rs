//! `snapsync` - snapshot-guarded one-way sync of machine state.
//!
//! A session locks the source and the target, snapshots the configured
//! btrfs subvolumes on both, runs the configured sync jobs in order and
//! snapshots again. A failed session can be rolled back on the source from
//! its pre-sync snapshots.

pub mod btrfs;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod jobs;
pub mod lock;
pub mod orchestrator;
pub mod prompt;
pub mod remote;
pub mod reporter;
pub mod session;
pub mod snapshot;
pub mod version;

pub use error::SyncError;
pub use orchestrator::{Orchestrator, SessionReport};
pub use session::SessionPhase;
