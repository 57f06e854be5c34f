use thiserror::Error;

use crate::remote::Machine;

/// Errors the orchestration core distinguishes between.
///
/// Anything not listed here travels as a plain `anyhow::Error` and is treated
/// as an operational failure.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration invalid:\n  {}", .0.join("\n  "))]
    Config(Vec<String>),

    #[error("validation failed:\n  {}", .0.join("\n  "))]
    Validation(Vec<String>),

    #[error("{machine} lock is held by {holder}")]
    LockHeld { machine: Machine, holder: String },

    #[error("target runs snapsync {target_version}, which is newer than source {source_version}; refusing to downgrade")]
    TargetNewer {
        source_version: String,
        target_version: String,
    },

    #[error("subvolume '{subvolume}' not found at top level on {machine}")]
    SubvolumeMissing { machine: Machine, subvolume: String },

    #[error("root filesystem on {machine} is {fs_type}, not btrfs")]
    NotSnapshotCapable { machine: Machine, fs_type: String },

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("disk space on {machine} dropped to {available}, below the reserved {required}")]
    DiskSpace {
        machine: Machine,
        available: String,
        required: String,
    },

    #[error("command on {machine} exited with {code}: {command}: {stderr}")]
    Remote {
        machine: Machine,
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("rollback aborted: {0}")]
    Rollback(String),

    #[error("PARTIAL ROLLBACK, manual intervention required:\n  {}", .0.join("\n  "))]
    PartialRollback(Vec<String>),
}

impl SyncError {
    /// True when the error chain carries a cooperative cancellation.
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_held_names_holder() {
        let err = SyncError::LockHeld {
            machine: Machine::Target,
            holder: "hostA:4321".into(),
        };
        assert_eq!(err.to_string(), "target lock is held by hostA:4321");
    }

    #[test]
    fn cancelled_survives_context() {
        let err = anyhow::Error::from(SyncError::Cancelled).context("while running dummy_success");
        assert!(SyncError::is_cancelled(&err));
        let other = anyhow::anyhow!("boom");
        assert!(!SyncError::is_cancelled(&other));
    }
}
