//! A fake machine for driving sessions without btrfs, sudo or ssh.
//!
//! `FakeMachine` interprets the command lines the crate issues against an
//! in-memory model: top-level subvolumes with a content marker, snapshot
//! subvolumes, plain directories, a top-level mount and the target lock.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use snapsync::btrfs;
use snapsync::remote::{CommandResult, Executor, Machine, ProcessHandle};

#[derive(Default)]
struct State {
    /// Top-level subvolumes by name, with a content marker.
    live: BTreeMap<String, String>,
    /// Snapshot subvolumes by absolute path.
    snaps: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    root_is_subvolume: bool,
    toplevel_mount: Option<String>,
    fs_type: String,
    version: Option<String>,
    total: u64,
    available: u64,
    rsync_installed: bool,
    /// Subvolumes whose moved-aside copy cannot be deleted ("in use").
    busy: BTreeSet<String>,
    lock_holder: Option<String>,
    lock_pgid: Option<u32>,
    next_pgid: u32,
    started: Vec<(u32, String)>,
    killed: Vec<(u32, String)>,
    terminated: Vec<u32>,
    exited: Vec<u32>,
    sent_files: Vec<String>,
    commands: Vec<String>,
    connected: bool,
    closed: bool,
}

#[derive(Clone)]
pub struct FakeMachine {
    machine: Machine,
    name: String,
    state: Arc<Mutex<State>>,
}

fn ok(stdout: impl Into<String>) -> CommandResult {
    CommandResult {
        code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(code: i32, stderr: impl Into<String>) -> CommandResult {
    CommandResult {
        code,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Split a command line into words, honouring single quotes.
fn words(cmd: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_word = false;
    let mut chars = cmd.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    out.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        out.push(current);
    }
    out
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "",
    }
}

impl State {
    /// Name of the top-level subvolume `path` refers to, if any.
    fn live_name(&self, path: &str) -> Option<String> {
        if let Some(mnt) = &self.toplevel_mount
            && let Some(rest) = path.strip_prefix(&format!("{mnt}/"))
        {
            return self.live.contains_key(rest).then(|| rest.to_string());
        }
        self.live
            .keys()
            .find(|name| btrfs::mount_point(name) == path)
            .cloned()
    }

    fn is_subvolume(&self, path: &str, root: &str) -> bool {
        self.live_name(path).is_some()
            || self.snaps.contains_key(path)
            || (path == root && self.root_is_subvolume)
    }

    fn content(&self, path: &str) -> Option<String> {
        match self.live_name(path) {
            Some(name) => self.live.get(&name).cloned(),
            None => self.snaps.get(path).cloned(),
        }
    }

    fn mkdir_p(&mut self, path: &str) {
        let mut p = path.trim_end_matches('/').to_string();
        while !p.is_empty() && p != "/" {
            self.dirs.insert(p.clone());
            p = parent(&p).to_string();
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut names = BTreeSet::new();
        for path in self.dirs.iter().chain(self.snaps.keys()) {
            if let Some(rest) = path.strip_prefix(&prefix)
                && !rest.is_empty()
                && !rest.contains('/')
            {
                names.insert(rest.to_string());
            }
        }
        names.into_iter().collect()
    }

    fn exists(&self, path: &str) -> bool {
        self.dirs.contains(path) || self.snaps.contains_key(path) || self.live_name(path).is_some()
    }

    fn btrfs(&mut self, args: &[String]) -> CommandResult {
        let root = "/.snapshots";
        match args {
            [list, path] if list == "list" && path == "/" => {
                let lines: Vec<_> = self
                    .live
                    .keys()
                    .enumerate()
                    .map(|(i, name)| format!("ID {} gen 10 top level 5 path {name}", 256 + i))
                    .collect();
                ok(lines.join("\n"))
            }
            [show, path] if show == "show" => {
                if self.is_subvolume(path, root) {
                    ok(format!("{path}\n\tName: {path}"))
                } else {
                    fail(1, format!("ERROR: not a subvolume: {path}"))
                }
            }
            [create, path] if create == "create" => {
                if path == root {
                    self.root_is_subvolume = true;
                } else {
                    self.snaps.insert(path.clone(), String::new());
                }
                ok("")
            }
            [snap, rest @ ..] if snap == "snapshot" => {
                let (src, dst) = match rest {
                    [flag, src, dst] if flag == "-r" => (src, dst),
                    [src, dst] => (src, dst),
                    _ => return fail(2, "bad snapshot args"),
                };
                let Some(content) = self.content(src) else {
                    return fail(1, format!("ERROR: cannot snapshot {src}"));
                };
                if let Some(mnt) = self.toplevel_mount.clone()
                    && let Some(name) = dst.strip_prefix(&format!("{mnt}/"))
                {
                    self.live.insert(name.to_string(), content);
                } else {
                    if !self.dirs.contains(parent(dst)) {
                        return fail(1, format!("ERROR: {} does not exist", parent(dst)));
                    }
                    self.snaps.insert(dst.clone(), content);
                }
                ok("")
            }
            [delete, path] if delete == "delete" => {
                if let Some(name) = self.live_name(path) {
                    if self.busy.iter().any(|b| name.starts_with(&format!("{b}.rollback-"))) {
                        return fail(1, "ERROR: Device or resource busy");
                    }
                    self.live.remove(&name);
                    ok("")
                } else if self.snaps.remove(path).is_some() {
                    ok("")
                } else {
                    fail(1, format!("ERROR: not a subvolume: {path}"))
                }
            }
            _ => fail(2, format!("unsupported btrfs invocation: {args:?}")),
        }
    }

    fn sudo(&mut self, args: &[String]) -> CommandResult {
        match args {
            [btrfs, sub, rest @ ..] if btrfs == "btrfs" && sub == "subvolume" => self.btrfs(rest),
            [test, flag, path] if test == "test" => {
                let hit = match flag.as_str() {
                    "-d" => self.dirs.contains(path.as_str()),
                    _ => self.exists(path),
                };
                if hit { ok("") } else { fail(1, "") }
            }
            [ls, _, dir] if ls == "ls" => ok(self.children(dir).join("\n")),
            [mkdir, _, dir] if mkdir == "mkdir" => {
                self.mkdir_p(dir);
                ok("")
            }
            [rmdir, dir] if rmdir == "rmdir" => {
                if self.children(dir).is_empty() {
                    self.dirs.remove(dir.as_str());
                    ok("")
                } else {
                    fail(1, format!("rmdir: {dir}: Directory not empty"))
                }
            }
            [mount, _, opt, _device, mnt] if mount == "mount" && opt == "subvolid=5" => {
                self.toplevel_mount = Some(mnt.clone());
                ok("")
            }
            [umount, _] if umount == "umount" => {
                self.toplevel_mount = None;
                ok("")
            }
            [mv, from, to] if mv == "mv" => {
                let (Some(mnt), Some(name)) = (self.toplevel_mount.clone(), self.live_name(from))
                else {
                    return fail(1, format!("mv: cannot move {from}"));
                };
                let Some(new_name) = to.strip_prefix(&format!("{mnt}/")) else {
                    return fail(1, format!("mv: cannot move to {to}"));
                };
                if let Some(content) = self.live.remove(&name) {
                    self.live.insert(new_name.to_string(), content);
                }
                ok("")
            }
            _ => fail(2, format!("unsupported sudo invocation: {args:?}")),
        }
    }

    fn run(&mut self, cmd: &str) -> CommandResult {
        self.commands.push(cmd.to_string());
        if cmd.contains("--version") {
            return match &self.version {
                Some(v) => ok(format!("snapsync {v}\n")),
                None => fail(127, "snapsync: not found"),
            };
        }
        if cmd.starts_with("chmod 755") {
            self.version = Some(snapsync::version::VERSION.to_string());
            return ok("");
        }
        let args = words(cmd);
        match args.as_slice() {
            [stat, ..] if stat == "stat" => ok(format!("{}\n", self.fs_type)),
            [df, ..] if df == "df" => ok(format!(
                "  1B-blocks      Avail\n{} {}\n",
                self.total, self.available
            )),
            [findmnt, ..] if findmnt == "findmnt" => ok("/dev/vda2[/@]\n"),
            [command, _, rsync] if command == "command" && rsync == "rsync" => {
                if self.rsync_installed { ok("/usr/bin/rsync") } else { fail(1, "") }
            }
            [test, _, path] if test == "test" => {
                if self.exists(path) { ok("") } else { fail(1, "") }
            }
            [mkdir, ..] if mkdir == "mkdir" => ok(""),
            [sudo, rest @ ..] if sudo == "sudo" => self.sudo(rest),
            _ => fail(127, format!("fake machine cannot run: {cmd}")),
        }
    }
}

/// Holder named on the `printf` line of the target lock script.
fn script_holder(script: &str) -> String {
    script
        .lines()
        .find_map(|l| {
            let rest = l.strip_prefix("printf '%s\\n' ")?;
            let holder = rest.split(" > ").next()?;
            Some(holder.trim_matches('\'').to_string())
        })
        .unwrap_or_default()
}

struct FakeProcess {
    pgid: u32,
    lines: VecDeque<String>,
    code: i32,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pgid(&self) -> Option<u32> {
        Some(self.pgid)
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.pop_front())
    }

    async fn wait(&mut self) -> Result<CommandResult> {
        self.state.lock().unwrap().exited.push(self.pgid);
        Ok(CommandResult {
            code: self.code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn terminate(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.terminated.push(self.pgid);
        if state.lock_pgid == Some(self.pgid) {
            state.lock_pgid = None;
            state.lock_holder = None;
        }
        Ok(())
    }
}

impl FakeMachine {
    fn new(machine: Machine, name: &str) -> Self {
        let state = State {
            live: [("@", "initial root"), ("@home", "initial home")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fs_type: "btrfs".to_string(),
            version: Some(snapsync::version::VERSION.to_string()),
            total: 1_000_000,
            available: 600_000,
            rsync_installed: true,
            next_pgid: if machine == Machine::Source { 1000 } else { 5000 },
            ..State::default()
        };
        Self {
            machine,
            name: name.to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn source(name: &str) -> Self {
        Self::new(Machine::Source, name)
    }

    pub fn target(name: &str) -> Self {
        Self::new(Machine::Target, name)
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn content(&self, subvolume: &str) -> Option<String> {
        self.with(|s| s.live.get(subvolume).cloned())
    }

    pub fn set_content(&self, subvolume: &str, content: &str) {
        self.with(|s| s.live.insert(subvolume.to_string(), content.to_string()));
    }

    pub fn subvolumes(&self) -> Vec<String> {
        self.with(|s| s.live.keys().cloned().collect())
    }

    pub fn remove_subvolume(&self, subvolume: &str) {
        self.with(|s| s.live.remove(subvolume));
    }

    /// Snapshot names (last path component), sorted.
    pub fn snapshot_names(&self) -> Vec<String> {
        self.with(|s| {
            s.snaps
                .keys()
                .filter_map(|p| p.rsplit('/').next().map(str::to_string))
                .collect()
        })
    }

    pub fn snapshot_paths(&self) -> Vec<String> {
        self.with(|s| s.snaps.keys().cloned().collect())
    }

    /// Seed a snapshot session as if an earlier run had left it behind.
    pub fn add_snapshot(&self, path: &str, content: &str) {
        self.with(|s| {
            s.root_is_subvolume = true;
            s.mkdir_p(parent(path));
            s.snaps.insert(path.to_string(), content.to_string());
        });
    }

    pub fn set_fs_type(&self, fs_type: &str) {
        self.with(|s| s.fs_type = fs_type.to_string());
    }

    pub fn set_version(&self, version: Option<&str>) {
        self.with(|s| s.version = version.map(str::to_string));
    }

    pub fn version(&self) -> Option<String> {
        self.with(|s| s.version.clone())
    }

    pub fn set_free_space(&self, total: u64, available: u64) {
        self.with(|s| {
            s.total = total;
            s.available = available;
        });
    }

    pub fn set_rsync_installed(&self, installed: bool) {
        self.with(|s| s.rsync_installed = installed);
    }

    pub fn mark_busy(&self, subvolume: &str) {
        self.with(|s| s.busy.insert(subvolume.to_string()));
    }

    /// Take the target lock as another session would.
    pub fn hold_lock(&self, holder: &str) {
        self.with(|s| {
            s.lock_holder = Some(holder.to_string());
            s.lock_pgid = None;
        });
    }

    pub fn lock_holder(&self) -> Option<String> {
        self.with(|s| s.lock_holder.clone())
    }

    pub fn started(&self) -> Vec<(u32, String)> {
        self.with(|s| s.started.clone())
    }

    pub fn killed(&self) -> Vec<(u32, String)> {
        self.with(|s| s.killed.clone())
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.with(|s| s.terminated.clone())
    }

    pub fn sent_files(&self) -> Vec<String> {
        self.with(|s| s.sent_files.clone())
    }

    pub fn commands(&self) -> Vec<String> {
        self.with(|s| s.commands.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.with(|s| s.closed)
    }
}

#[async_trait]
impl Executor for FakeMachine {
    fn machine(&self) -> Machine {
        self.machine
    }

    async fn hostname(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn connect(&self) -> Result<()> {
        self.with(|s| {
            s.connected = true;
            s.closed = false;
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.with(|s| {
            s.connected = false;
            s.closed = true;
            // Connection-scoped lock holder goes away with the connection.
            if s.lock_pgid.take().is_some() {
                s.lock_holder = None;
            }
        });
        Ok(())
    }

    async fn run(&self, cmd: &str, _timeout: Option<Duration>) -> Result<CommandResult> {
        Ok(self.with(|s| s.run(cmd)))
    }

    async fn start_process(&self, cmd: &str) -> Result<Box<dyn ProcessHandle>> {
        let (pgid, lines, code) = self.with(|s| {
            let pgid = s.next_pgid;
            s.next_pgid += 1;
            s.started.push((pgid, cmd.to_string()));
            if cmd.contains("flock -n 9") {
                if let Some(holder) = &s.lock_holder {
                    return (pgid, vec![format!("HELD:{holder}")], 1);
                }
                s.lock_holder = Some(script_holder(cmd));
                s.lock_pgid = Some(pgid);
                return (pgid, vec!["ACQUIRED".to_string()], 0);
            }
            if cmd.contains("rsync") {
                let lines = [25, 50, 100]
                    .iter()
                    .map(|p| format!("  {} {p}%  1.00MB/s  0:00:01", p * 1000))
                    .collect();
                return (pgid, lines, 0);
            }
            (pgid, Vec::new(), 0)
        });
        Ok(Box::new(FakeProcess {
            pgid,
            lines: lines.into(),
            code,
            state: self.state.clone(),
        }))
    }

    async fn send_file(&self, local: &Path, remote: &str) -> Result<()> {
        if !local.exists() {
            bail!("{} does not exist", local.display());
        }
        self.with(|s| s.sent_files.push(remote.to_string()));
        Ok(())
    }

    async fn kill_group(&self, pgid: u32) -> Result<bool> {
        Ok(self.with(|s| {
            if s.terminated.contains(&pgid) || s.exited.contains(&pgid) {
                return false;
            }
            let command = s
                .started
                .iter()
                .find(|(p, _)| *p == pgid)
                .map(|(_, c)| c.clone())
                .unwrap_or_default();
            s.killed.push((pgid, command));
            if s.lock_pgid == Some(pgid) {
                s.lock_pgid = None;
                s.lock_holder = None;
            }
            true
        }))
    }

    fn control_path(&self) -> Option<PathBuf> {
        match self.machine {
            Machine::Target => Some(PathBuf::from(format!("/tmp/snapsync-{}.ctl", self.name))),
            Machine::Source => None,
        }
    }
}
