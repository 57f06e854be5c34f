//! Per-machine mutual exclusion.
//!
//! Both locks are `flock(2)` advisory locks held through an open file
//! description, so they vanish with the process (source) or with the
//! connection-scoped remote shell (target) that holds them. Nothing here
//! depends on a lock file existing or not.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

use crate::error::SyncError;
use crate::remote::{Executor, Machine, ProcessHandle};

/// Lock file used on the target, relative paths expanded by the remote shell.
pub const TARGET_LOCK_PATH: &str = "${HOME}/.local/share/snapsync/target.lock";

/// Holder of the source lock. Unlocks on drop; the kernel unlocks on exit.
#[derive(Debug)]
pub struct SourceLock {
    file: File,
    path: PathBuf,
}

impl SourceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        // Best-effort unlock; the descriptor closing right after does the same.
        let _ = FileExt::unlock(&self.file);
    }
}

/// Source lock location: `<lock_dir>/sync.lock`, defaulting to
/// `$XDG_RUNTIME_DIR/snapsync` and then `/tmp/snapsync`.
pub fn source_lock_path(lock_dir: Option<&Path>) -> PathBuf {
    let dir = match lock_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::var_os("XDG_RUNTIME_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join("snapsync"),
    };
    dir.join("sync.lock")
}

/// `hostname:pid` of this process.
pub fn holder_id(hostname: &str) -> String {
    format!("{hostname}:{}", std::process::id())
}

/// Take the source lock without blocking.
///
/// Fails with [`SyncError::LockHeld`] naming the current holder when another
/// session owns it.
pub fn acquire_source_lock(path: &Path, holder: &str) -> Result<SourceLock> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create lock directory {}", parent.display()))?;
    }
    // No truncate here: the current holder's identity must survive a failed attempt.
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("cannot open lock file {}", path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            let mut current = String::new();
            file.read_to_string(&mut current).ok();
            let holder = match current.trim() {
                "" => "unknown".to_string(),
                h => h.to_string(),
            };
            return Err(SyncError::LockHeld {
                machine: Machine::Source,
                holder,
            }
            .into());
        }
        Err(e) => return Err(e).context("lock acquisition failed"),
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{holder}")?;
    file.sync_all()?;
    tracing::debug!(path = %path.display(), holder, "source lock acquired");
    Ok(SourceLock {
        file,
        path: path.to_path_buf(),
    })
}

/// Target lock held by a remote shell on the session's connection.
///
/// The shell keeps the lock descriptor open until its stdin closes or it is
/// killed, which happens at the latest when the connection goes away.
pub struct TargetLock {
    process: Box<dyn ProcessHandle>,
}

impl TargetLock {
    pub async fn release(mut self) -> Result<()> {
        self.process.terminate().await
    }
}

fn target_lock_script(lock_path: &str, holder: &str) -> String {
    format!(
        r#"lock="{lock_path}"; mkdir -p "$(dirname "$lock")" || exit 2
exec 9>>"$lock" || exit 2
if ! flock -n 9; then printf 'HELD:%s\n' "$(head -n1 "$lock")"; exit 1; fi
printf '%s\n' {holder} > "$lock"
echo ACQUIRED
read -r _ || true"#,
        holder = crate::remote::quote(holder),
    )
}

/// Take the target lock over `exec`'s connection without blocking.
pub async fn acquire_target_lock(
    exec: &dyn Executor,
    lock_path: &str,
    holder: &str,
) -> Result<TargetLock> {
    let mut process = exec
        .start_process(&target_lock_script(lock_path, holder))
        .await
        .context("failed to start target lock holder")?;

    match process.next_line().await? {
        Some(line) if line.trim() == "ACQUIRED" => {
            tracing::debug!(holder, "target lock acquired");
            Ok(TargetLock { process })
        }
        Some(line) if line.starts_with("HELD:") => {
            let holder = match line["HELD:".len()..].trim() {
                "" => "unknown".to_string(),
                h => h.to_string(),
            };
            process.wait().await.ok();
            Err(SyncError::LockHeld {
                machine: Machine::Target,
                holder,
            }
            .into())
        }
        other => {
            let result = process.wait().await?;
            bail!(
                "target lock helper failed (exit {}): {}{}",
                result.code,
                other.unwrap_or_default(),
                result.stderr.trim()
            )
        }
    }
}
