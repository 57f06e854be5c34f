//! Snapshot Manager: read-only btrfs snapshots grouped per session, their
//! retention, and restoring subvolumes from them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::btrfs;
use crate::error::SyncError;
use crate::events::{Event, EventSink, LogLevel};
use crate::prompt::Confirm;
use crate::remote::{Executor, Machine, quote, run_checked};

/// When a snapshot was taken relative to the mutating part of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pre,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pre => f.write_str("pre"),
            Phase::Post => f.write_str("post"),
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre" => Ok(Phase::Pre),
            "post" => Ok(Phase::Post),
            other => Err(format!("unknown snapshot phase '{other}'")),
        }
    }
}

/// One read-only snapshot of one subvolume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub machine: Machine,
    pub subvolume: String,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub path: String,
}

impl Snapshot {
    /// `<phase>-<subvolume>-<timestamp>`
    pub fn name(&self) -> String {
        snapshot_name(self.phase, &self.subvolume, self.timestamp)
    }
}

pub fn snapshot_name(phase: Phase, subvolume: &str, ts: DateTime<Utc>) -> String {
    format!("{phase}-{subvolume}-{}", btrfs::format_timestamp(ts))
}

/// Parse `<phase>-<subvolume>-<timestamp>`; subvolume names may contain `-`.
pub fn parse_snapshot_name(name: &str) -> Option<(Phase, String, DateTime<Utc>)> {
    let (phase, rest) = name.split_once('-')?;
    let (subvolume, ts) = rest.rsplit_once('-')?;
    if subvolume.is_empty() {
        return None;
    }
    Some((
        phase.parse().ok()?,
        subvolume.to_string(),
        btrfs::parse_timestamp(ts)?,
    ))
}

/// Session directory `<timestamp>-<session-id>` under the sessions root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDir {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub path: String,
}

impl SessionDir {
    pub fn parse(parent: &str, name: &str) -> Option<Self> {
        let (ts, id) = name.split_once('-')?;
        Some(Self {
            name: name.to_string(),
            timestamp: btrfs::parse_timestamp(ts)?,
            session_id: id.to_string(),
            path: format!("{parent}/{name}"),
        })
    }
}

/// Result of a completed rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub restored: Vec<String>,
    /// Moved-aside subvolumes that could not be deleted (still mounted).
    pub leftovers: Vec<String>,
}

/// What the rollback offer ended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    NotApplicable,
    Declined,
    RolledBack(RollbackReport),
}

/// Snapshot operations on one machine.
pub struct SnapshotManager<'a> {
    exec: &'a dyn Executor,
    root: String,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(exec: &'a dyn Executor, snapshot_root: &str) -> Self {
        Self {
            exec,
            root: snapshot_root.trim_end_matches('/').to_string(),
        }
    }

    pub fn machine(&self) -> Machine {
        self.exec.machine()
    }

    /// Directory holding one directory per session.
    pub fn sessions_root(&self) -> String {
        format!("{}/{}", self.root, btrfs::SESSIONS_DIR)
    }

    pub fn session_dir(&self, started: DateTime<Utc>, session_id: &str) -> SessionDir {
        let name = format!("{}-{session_id}", btrfs::format_timestamp(started));
        SessionDir {
            path: format!("{}/{name}", self.sessions_root()),
            name,
            timestamp: started,
            session_id: session_id.to_string(),
        }
    }

    async fn is_subvolume(&self, path: &str) -> Result<bool> {
        Ok(self.exec.run(&btrfs::show_subvolume(path), None).await?.success())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self
            .exec
            .run(&format!("sudo test -e {}", quote(path)), None)
            .await?
            .success())
    }

    /// Root filesystem must be btrfs and every subvolume must sit at top level.
    pub async fn check_prerequisites(&self, subvolumes: &[String]) -> Result<()> {
        let machine = self.machine();
        let fs_type = run_checked(self.exec, &btrfs::filesystem_type("/")).await?;
        let fs_type = fs_type.stdout.trim();
        if fs_type != "btrfs" {
            return Err(SyncError::NotSnapshotCapable {
                machine,
                fs_type: fs_type.to_string(),
            }
            .into());
        }
        let listing = run_checked(self.exec, &btrfs::list_subvolumes("/")).await?;
        let present = btrfs::parse_top_level_subvolumes(&listing.stdout);
        for sub in subvolumes {
            if !present.contains(sub) {
                return Err(SyncError::SubvolumeMissing {
                    machine,
                    subvolume: sub.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Create the snapshot root as a subvolume if absent. A plain directory
    /// in its place is refused: it would be captured by snapshots of `/`.
    pub async fn ensure_root(&self) -> Result<()> {
        if !self.is_subvolume(&self.root).await? {
            if self.exists(&self.root).await? {
                return Err(SyncError::Snapshot(format!(
                    "{} exists on {} but is not a subvolume",
                    self.root,
                    self.machine()
                ))
                .into());
            }
            run_checked(self.exec, &btrfs::create_subvolume(&self.root)).await?;
            tracing::info!(machine = %self.machine(), root = %self.root, "created snapshot root subvolume");
        }
        run_checked(self.exec, &format!("sudo mkdir -p {}", quote(&self.sessions_root()))).await?;
        Ok(())
    }

    /// Snapshot every subvolume read-only into `dir`. The first failure is fatal.
    pub async fn create_snapshots(
        &self,
        phase: Phase,
        subvolumes: &[String],
        dir: &SessionDir,
    ) -> Result<Vec<Snapshot>> {
        self.ensure_root().await?;
        run_checked(self.exec, &format!("sudo mkdir -p {}", quote(&dir.path))).await?;
        let ts = Utc::now();
        let mut created = Vec::with_capacity(subvolumes.len());
        for sub in subvolumes {
            let snapshot = Snapshot {
                machine: self.machine(),
                subvolume: sub.clone(),
                phase,
                timestamp: ts,
                session_id: dir.session_id.clone(),
                path: format!("{}/{}", dir.path, snapshot_name(phase, sub, ts)),
            };
            let cmd = btrfs::snapshot(&btrfs::mount_point(sub), &snapshot.path, true);
            let result = self.exec.run(&cmd, None).await?;
            if !result.success() {
                return Err(SyncError::Snapshot(format!(
                    "{phase} snapshot of {sub} on {}: {}",
                    self.machine(),
                    result.stderr.trim()
                ))
                .into());
            }
            created.push(snapshot);
        }
        Ok(created)
    }

    async fn ls(&self, dir: &str) -> Result<Vec<String>> {
        let test = self
            .exec
            .run(&format!("sudo test -d {}", quote(dir)), None)
            .await?;
        if !test.success() {
            return Ok(Vec::new());
        }
        let out = run_checked(self.exec, &format!("sudo ls -1 {}", quote(dir))).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Session directories, oldest first. Unrecognised entries are ignored.
    pub async fn list_sessions(&self) -> Result<Vec<SessionDir>> {
        let parent = self.sessions_root();
        let mut sessions: Vec<_> = self
            .ls(&parent)
            .await?
            .iter()
            .filter_map(|name| SessionDir::parse(&parent, name))
            .collect();
        sessions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.name.cmp(&b.name)));
        Ok(sessions)
    }

    pub async fn find_session(&self, session: &str) -> Result<Option<SessionDir>> {
        Ok(self
            .list_sessions()
            .await?
            .into_iter()
            .find(|s| s.name == session || s.session_id == session))
    }

    pub async fn session_snapshots(&self, dir: &SessionDir) -> Result<Vec<Snapshot>> {
        Ok(self
            .ls(&dir.path)
            .await?
            .iter()
            .filter_map(|name| {
                let (phase, subvolume, timestamp) = parse_snapshot_name(name)?;
                Some(Snapshot {
                    machine: self.machine(),
                    subvolume,
                    phase,
                    timestamp,
                    session_id: dir.session_id.clone(),
                    path: format!("{}/{name}", dir.path),
                })
            })
            .collect())
    }

    pub async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        run_checked(self.exec, &btrfs::delete_subvolume(&snapshot.path))
            .await
            .with_context(|| format!("failed to delete {}", snapshot.path))?;
        Ok(())
    }

    pub async fn delete_session(&self, dir: &SessionDir) -> Result<()> {
        for snapshot in self.session_snapshots(dir).await? {
            self.delete_snapshot(&snapshot).await?;
        }
        run_checked(self.exec, &format!("sudo rmdir {}", quote(&dir.path))).await?;
        Ok(())
    }

    /// Delete sessions older than `max_age`, always keeping the newest
    /// `keep_recent` regardless of age. Returns what was deleted.
    pub async fn cleanup(
        &self,
        keep_recent: usize,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionDir>> {
        let mut sessions = self.list_sessions().await?;
        sessions.reverse();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut deleted = Vec::new();
        for dir in sessions.into_iter().skip(keep_recent) {
            if now.signed_duration_since(dir.timestamp) > max_age {
                self.delete_session(&dir).await?;
                tracing::info!(machine = %self.machine(), session = %dir.name, "deleted old snapshots");
                deleted.push(dir);
            }
        }
        Ok(deleted)
    }

    /// Restore `subvolumes` from the pre-sync snapshots of `dir`.
    ///
    /// Every pre-sync snapshot is verified before anything is touched; a
    /// missing one aborts with no change. Restoration failures after that
    /// point are collected and reported as a partial rollback.
    pub async fn rollback(&self, dir: &SessionDir, subvolumes: &[String]) -> Result<RollbackReport> {
        let pre: Vec<_> = self
            .session_snapshots(dir)
            .await?
            .into_iter()
            .filter(|s| s.phase == Phase::Pre)
            .collect();
        let mut plan = Vec::new();
        for sub in subvolumes {
            let Some(snapshot) = pre.iter().find(|s| &s.subvolume == sub) else {
                return Err(SyncError::Rollback(format!("no pre-sync snapshot of {sub} in {}", dir.name)).into());
            };
            if !self.is_subvolume(&snapshot.path).await? {
                return Err(SyncError::Rollback(format!("pre-sync snapshot {} is gone", snapshot.path)).into());
            }
            plan.push(snapshot.clone());
        }

        let findmnt = run_checked(self.exec, "findmnt -n -o SOURCE /").await?;
        let device = btrfs::parse_root_device(&findmnt.stdout)?;
        let mnt = format!("/run/snapsync/toplevel-{}", dir.session_id);
        run_checked(self.exec, &format!("sudo mkdir -p {}", quote(&mnt))).await?;
        run_checked(
            self.exec,
            &format!("sudo mount -o subvolid=5 {} {}", quote(&device), quote(&mnt)),
        )
        .await?;

        let stamp = btrfs::format_timestamp(Utc::now());
        let mut report = RollbackReport::default();
        let mut failures = Vec::new();
        for snapshot in &plan {
            match self.restore_one(&mnt, snapshot, &stamp, &mut report).await {
                Ok(()) => report.restored.push(snapshot.subvolume.clone()),
                Err(e) => failures.push(format!("{}: {e:#}", snapshot.subvolume)),
            }
        }

        if let Err(e) = run_checked(self.exec, &format!("sudo umount {}", quote(&mnt))).await {
            tracing::warn!("failed to unmount {mnt}: {e:#}");
        }
        if !failures.is_empty() {
            return Err(SyncError::PartialRollback(failures).into());
        }
        Ok(report)
    }

    async fn restore_one(
        &self,
        mnt: &str,
        snapshot: &Snapshot,
        stamp: &str,
        report: &mut RollbackReport,
    ) -> Result<()> {
        let current = format!("{mnt}/{}", snapshot.subvolume);
        let aside = format!("{current}.rollback-{stamp}");
        run_checked(self.exec, &format!("sudo mv {} {}", quote(&current), quote(&aside))).await?;

        let restored = run_checked(self.exec, &btrfs::snapshot(&snapshot.path, &current, false)).await;
        if let Err(e) = restored {
            // Put the mutated subvolume back so the machine still boots.
            self.exec
                .run(&format!("sudo mv {} {}", quote(&aside), quote(&current)), None)
                .await
                .ok();
            return Err(e);
        }
        if !self.is_subvolume(&current).await? {
            bail!("{current} missing after restore");
        }

        let deleted = self.exec.run(&btrfs::delete_subvolume(&aside), None).await?;
        if !deleted.success() {
            tracing::warn!(path = %aside, "mutated subvolume still in use, remove it after reboot");
            report.leftovers.push(aside);
        }
        Ok(())
    }
}

/// Offer to roll `subvolumes` back to the pre-sync snapshots in `dir`.
///
/// Declining leaves everything as it is. On success the pre-sync snapshots
/// are kept and any post-sync snapshots of the session are deleted.
pub async fn offer_rollback(
    manager: &SnapshotManager<'_>,
    dir: &SessionDir,
    subvolumes: &[String],
    confirm: &dyn Confirm,
    sink: &dyn EventSink,
) -> Result<RollbackOutcome> {
    let snapshots = manager.session_snapshots(dir).await?;
    let pre: Vec<_> = snapshots.iter().filter(|s| s.phase == Phase::Pre).collect();
    if pre.is_empty() {
        return Ok(RollbackOutcome::NotApplicable);
    }

    let listing = pre
        .iter()
        .map(|s| format!("  {}", s.path))
        .collect::<Vec<_>>()
        .join("\n");
    sink.publish(Event::log(
        LogLevel::Info,
        None,
        format!("pre-sync snapshots available on {}:\n{listing}", manager.machine()),
    ));

    let question = format!(
        "Roll back {} on {} to the state before session {}?",
        subvolumes.join(", "),
        manager.machine(),
        dir.session_id
    );
    if !confirm.confirm(&question).await {
        sink.publish(Event::log(
            LogLevel::Info,
            None,
            format!("rollback declined; pre-sync snapshots retained in {}", dir.path),
        ));
        return Ok(RollbackOutcome::Declined);
    }

    let report = manager.rollback(dir, subvolumes).await?;
    for post in snapshots.iter().filter(|s| s.phase == Phase::Post) {
        if let Err(e) = manager.delete_snapshot(post).await {
            sink.publish(Event::log(LogLevel::Warning, None, format!("{e:#}")));
        }
    }
    sink.publish(Event::log(
        LogLevel::Info,
        None,
        format!(
            "rolled back {}; reboot to use the restored subvolumes",
            report.restored.join(", ")
        ),
    ));
    Ok(RollbackOutcome::RolledBack(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snapshot_names_round_trip() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let name = snapshot_name(Phase::Pre, "@home", ts);
        assert_eq!(name, "pre-@home-20250102T030405");
        assert_eq!(
            parse_snapshot_name(&name),
            Some((Phase::Pre, "@home".to_string(), ts))
        );
        assert_eq!(
            parse_snapshot_name("post-my-vol-20250102T030405"),
            Some((Phase::Post, "my-vol".to_string(), ts))
        );
        assert_eq!(parse_snapshot_name("pre--20250102T030405"), None);
        assert_eq!(parse_snapshot_name("mid-@-20250102T030405"), None);
    }

    #[test]
    fn session_dir_parses() {
        let dir = SessionDir::parse("/.snapshots/snapsync", "20250102T030405-ab12cd34").unwrap();
        assert_eq!(dir.session_id, "ab12cd34");
        assert_eq!(dir.path, "/.snapshots/snapsync/20250102T030405-ab12cd34");
        assert!(SessionDir::parse("/x", "notes.txt").is_none());
    }
}
