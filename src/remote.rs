//! Command execution on the source and target machines.
//!
//! The orchestrator only ever talks to machines through [`Executor`]. The
//! local implementation shells out through `tokio::process`; the SSH
//! implementation multiplexes everything over a single OpenSSH control
//! master, so closing that master ends every remote process riding on it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::error::SyncError;

/// Which side of the sync a command runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Machine {
    Source,
    Target,
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Machine::Source => f.write_str("source"),
            Machine::Target => f.write_str("target"),
        }
    }
}

/// Outcome of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A long-running process started on a machine.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Process-group id on the machine the process runs on.
    fn pgid(&self) -> Option<u32>;

    /// Next line of stdout, `None` at end of stream.
    async fn next_line(&mut self) -> Result<Option<String>>;

    /// Drain remaining output and wait for exit.
    async fn wait(&mut self) -> Result<CommandResult>;

    /// Kill the whole process group.
    async fn terminate(&mut self) -> Result<()>;
}

/// Remote execution capability consumed by the core.
#[async_trait]
pub trait Executor: Send + Sync {
    fn machine(&self) -> Machine;

    async fn hostname(&self) -> Result<String>;

    /// Establish the underlying channel. No-op for the local machine.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Tear the channel down, ending every process still attached to it.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self, cmd: &str, timeout: Option<Duration>) -> Result<CommandResult>;

    async fn start_process(&self, cmd: &str) -> Result<Box<dyn ProcessHandle>>;

    async fn send_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Forcefully kill a process group previously reported by a handle.
    /// `Ok(false)` when no such group exists any more.
    async fn kill_group(&self, pgid: u32) -> Result<bool>;

    /// OpenSSH control socket other ssh clients can multiplex over.
    fn control_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Run `cmd` and turn a non-zero exit into [`SyncError::Remote`].
pub async fn run_checked(exec: &dyn Executor, cmd: &str) -> Result<CommandResult> {
    let result = exec.run(cmd, None).await?;
    if !result.success() {
        return Err(SyncError::Remote {
            machine: exec.machine(),
            command: cmd.to_string(),
            code: result.code,
            stderr: result.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(result)
}

/// Single-quote `s` for POSIX shells.
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%_-+=:,./".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

struct ChildProcess {
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Option<ChildStderr>,
}

impl ChildProcess {
    fn spawn(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().context("failed to spawn process")?;
        let stdout = child.stdout.take().context("stdout not captured")?;
        let stderr = child.stderr.take();
        Ok(Self {
            child,
            stdout: BufReader::new(stdout).lines(),
            stderr,
        })
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.stdout.next_line().await?)
    }

    async fn wait(&mut self) -> Result<CommandResult> {
        let mut stderr_pipe = self.stderr.take();
        let stdout_lines = &mut self.stdout;
        let read_stdout = async {
            let mut out = String::new();
            while let Some(line) = stdout_lines.next_line().await? {
                out.push_str(&line);
                out.push('\n');
            }
            Ok::<_, std::io::Error>(out)
        };
        let read_stderr = async {
            let mut err = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_string(&mut err).await?;
            }
            Ok::<_, std::io::Error>(err)
        };
        let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
        let status = self.child.wait().await?;
        Ok(CommandResult {
            code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn kill(&mut self) -> Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

async fn run_with_timeout(cmd: Command, timeout: Option<Duration>) -> Result<CommandResult> {
    let mut process = ChildProcess::spawn(cmd)?;
    // Close stdin so commands reading it see EOF.
    drop(process.child.stdin.take());
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, process.wait()).await {
            Ok(result) => result,
            Err(_) => {
                process.kill().await.ok();
                bail!("command timed out after {}", humantime::format_duration(limit))
            }
        },
        None => process.wait().await,
    }
}

fn kill_local_group(pgid: u32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to kill process group {pgid}")),
    }
}

/// Commands executed on the machine this process runs on.
pub struct LocalExecutor {
    default_timeout: Option<Duration>,
}

impl LocalExecutor {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    fn shell(cmd: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).process_group(0);
        command
    }
}

struct LocalProcess {
    inner: ChildProcess,
    pgid: Option<u32>,
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        self.inner.next_line().await
    }

    async fn wait(&mut self) -> Result<CommandResult> {
        self.inner.wait().await
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(pgid) = self.pgid {
            kill_local_group(pgid)?;
        }
        self.inner.kill().await
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn machine(&self) -> Machine {
        Machine::Source
    }

    async fn hostname(&self) -> Result<String> {
        Ok(local_hostname())
    }

    async fn run(&self, cmd: &str, timeout: Option<Duration>) -> Result<CommandResult> {
        tracing::debug!(machine = "source", cmd, "run");
        run_with_timeout(Self::shell(cmd), timeout.or(self.default_timeout)).await
    }

    async fn start_process(&self, cmd: &str) -> Result<Box<dyn ProcessHandle>> {
        tracing::debug!(machine = "source", cmd, "start process");
        let inner = ChildProcess::spawn(Self::shell(cmd))?;
        let pgid = inner.child.id();
        Ok(Box::new(LocalProcess { inner, pgid }))
    }

    async fn send_file(&self, local: &Path, remote: &str) -> Result<()> {
        tokio::fs::copy(local, remote)
            .await
            .with_context(|| format!("failed to copy {} to {remote}", local.display()))?;
        Ok(())
    }

    async fn kill_group(&self, pgid: u32) -> Result<bool> {
        kill_local_group(pgid)
    }
}

/// Hostname of the machine this process runs on.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

struct SshConnection {
    host: String,
    control_path: PathBuf,
}

impl SshConnection {
    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-o")
            .arg("BatchMode=yes");
        cmd
    }

    fn remote(&self, remote_cmd: &str) -> Command {
        let mut cmd = self.ssh();
        cmd.arg(&self.host).arg("--").arg(remote_cmd);
        cmd
    }

    async fn kill_group(&self, pgid: u32) -> Result<bool> {
        let cmd = format!("kill -KILL -- -{pgid} 2>/dev/null && echo killed || true");
        let result = run_with_timeout(self.remote(&cmd), Some(Duration::from_secs(10))).await?;
        Ok(result.stdout.trim() == "killed")
    }
}

/// Target machine reached over one multiplexed OpenSSH connection.
///
/// Keep-alives are enabled on the master so a vanished source is detected by
/// the target's sshd and every session (including the target lock holder)
/// is torn down with it.
pub struct SshExecutor {
    conn: Arc<SshConnection>,
    master: tokio::sync::Mutex<Option<Child>>,
    default_timeout: Option<Duration>,
    hostname: Mutex<Option<String>>,
}

impl SshExecutor {
    pub fn new(host: impl Into<String>, session_id: &str, default_timeout: Option<Duration>) -> Self {
        let control_path = std::env::temp_dir().join(format!("snapsync-{session_id}.ctl"));
        Self {
            conn: Arc::new(SshConnection {
                host: host.into(),
                control_path,
            }),
            master: tokio::sync::Mutex::new(None),
            default_timeout,
            hostname: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.conn.host
    }
}

struct SshProcess {
    inner: ChildProcess,
    pgid: Option<u32>,
    conn: Arc<SshConnection>,
}

#[async_trait]
impl ProcessHandle for SshProcess {
    fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        self.inner.next_line().await
    }

    async fn wait(&mut self) -> Result<CommandResult> {
        self.inner.wait().await
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(pgid) = self.pgid {
            self.conn.kill_group(pgid).await?;
        }
        self.inner.kill().await
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn machine(&self) -> Machine {
        Machine::Target
    }

    async fn hostname(&self) -> Result<String> {
        if let Some(name) = self.hostname.lock().ok().and_then(|h| h.clone()) {
            return Ok(name);
        }
        let result = run_checked(self, "hostname").await?;
        let name = result.stdout.trim().to_string();
        if let Ok(mut cached) = self.hostname.lock() {
            *cached = Some(name.clone());
        }
        Ok(name)
    }

    async fn connect(&self) -> Result<()> {
        let mut master = self.master.lock().await;
        if master.is_some() {
            return Ok(());
        }
        let mut cmd = Command::new("ssh");
        cmd.args(["-M", "-N", "-o", "BatchMode=yes", "-o", "ControlPersist=no"])
            .args(["-o", "ServerAliveInterval=15", "-o", "ServerAliveCountMax=3"])
            .arg("-o")
            .arg(format!("ControlPath={}", self.conn.control_path.display()))
            .arg(&self.conn.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start ssh to {}", self.conn.host))?;

        for _ in 0..50 {
            if let Some(status) = child.try_wait()? {
                let mut err = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    pipe.read_to_string(&mut err).await.ok();
                }
                bail!("ssh to {} exited with {status}: {}", self.conn.host, err.trim());
            }
            let mut check = self.conn.ssh();
            check.arg("-O").arg("check").arg(&self.conn.host);
            if run_with_timeout(check, Some(Duration::from_secs(5)))
                .await
                .is_ok_and(|r| r.success())
            {
                tracing::info!(host = %self.conn.host, "connected");
                *master = Some(child);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        child.kill().await.ok();
        bail!("timed out connecting to {}", self.conn.host)
    }

    async fn close(&self) -> Result<()> {
        let mut master = self.master.lock().await;
        if let Some(mut child) = master.take() {
            let mut exit = self.conn.ssh();
            exit.arg("-O").arg("exit").arg(&self.conn.host);
            run_with_timeout(exit, Some(Duration::from_secs(5))).await.ok();
            child.kill().await.ok();
            tracing::info!(host = %self.conn.host, "connection closed");
        }
        Ok(())
    }

    async fn run(&self, cmd: &str, timeout: Option<Duration>) -> Result<CommandResult> {
        tracing::debug!(machine = "target", cmd, "run");
        run_with_timeout(self.conn.remote(cmd), timeout.or(self.default_timeout)).await
    }

    async fn start_process(&self, cmd: &str) -> Result<Box<dyn ProcessHandle>> {
        tracing::debug!(machine = "target", cmd, "start process");
        // The first line printed is the process-group id of the new session.
        let wrapped = format!("setsid --wait sh -c {}", quote(&format!("echo $$; {cmd}")));
        let mut inner = ChildProcess::spawn(self.conn.remote(&wrapped))?;
        let pgid = match inner.next_line().await? {
            Some(line) => line.trim().parse::<u32>().ok(),
            None => None,
        };
        Ok(Box::new(SshProcess {
            inner,
            pgid,
            conn: self.conn.clone(),
        }))
    }

    async fn send_file(&self, local: &Path, remote: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.arg("-q")
            .arg("-o")
            .arg(format!("ControlPath={}", self.conn.control_path.display()))
            .arg(local)
            .arg(format!("{}:{remote}", self.conn.host));
        let result = run_with_timeout(cmd, self.default_timeout).await?;
        if !result.success() {
            bail!("scp of {} failed: {}", local.display(), result.stderr.trim());
        }
        Ok(())
    }

    async fn kill_group(&self, pgid: u32) -> Result<bool> {
        self.conn.kill_group(pgid).await
    }

    fn control_path(&self) -> Option<PathBuf> {
        Some(self.conn.control_path.clone())
    }
}

/// Process groups started on behalf of one job.
///
/// A group stays registered until its handle has seen it exit or terminated
/// it, so `terminate_all` only ever signals groups that may still be running.
#[derive(Clone, Default)]
pub struct ProcessTracker {
    groups: Arc<Mutex<Vec<TrackedGroup>>>,
}

#[derive(Clone)]
struct TrackedGroup {
    exec: Arc<dyn Executor>,
    pgid: u32,
    command: String,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, exec: Arc<dyn Executor>, pgid: u32, command: &str) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.push(TrackedGroup {
                exec,
                pgid,
                command: command.to_string(),
            });
        }
    }

    fn unregister(&self, machine: Machine, pgid: u32) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.retain(|g| !(g.pgid == pgid && g.exec.machine() == machine));
        }
    }

    pub fn len(&self) -> usize {
        self.groups.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every registered process group. Returns how many were still
    /// alive and got signalled.
    pub async fn terminate_all(&self) -> usize {
        let groups = match self.groups.lock() {
            Ok(mut groups) => std::mem::take(&mut *groups),
            Err(_) => return 0,
        };
        let mut killed = 0;
        for group in groups {
            match group.exec.kill_group(group.pgid).await {
                Ok(true) => {
                    killed += 1;
                    tracing::warn!(
                        machine = %group.exec.machine(),
                        pgid = group.pgid,
                        command = %group.command,
                        "force-terminated process group"
                    );
                }
                Ok(false) => tracing::debug!(pgid = group.pgid, "process group already gone"),
                Err(e) => tracing::warn!(pgid = group.pgid, "failed to terminate: {e:#}"),
            }
        }
        killed
    }
}

/// Handle that drops its group from the tracker once the group is done.
struct TrackedProcess {
    inner: Box<dyn ProcessHandle>,
    tracker: ProcessTracker,
    machine: Machine,
}

impl TrackedProcess {
    fn done(&self) {
        if let Some(pgid) = self.inner.pgid() {
            self.tracker.unregister(self.machine, pgid);
        }
    }
}

#[async_trait]
impl ProcessHandle for TrackedProcess {
    fn pgid(&self) -> Option<u32> {
        self.inner.pgid()
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        self.inner.next_line().await
    }

    async fn wait(&mut self) -> Result<CommandResult> {
        let result = self.inner.wait().await?;
        self.done();
        Ok(result)
    }

    async fn terminate(&mut self) -> Result<()> {
        self.inner.terminate().await?;
        self.done();
        Ok(())
    }
}

/// Executor handed to a job: every process it starts is registered on the
/// job's tracker so the orchestrator can kill it if the job does not unwind.
pub struct TrackedExecutor {
    inner: Arc<dyn Executor>,
    tracker: ProcessTracker,
}

impl TrackedExecutor {
    pub fn new(inner: Arc<dyn Executor>, tracker: ProcessTracker) -> Self {
        Self { inner, tracker }
    }
}

#[async_trait]
impl Executor for TrackedExecutor {
    fn machine(&self) -> Machine {
        self.inner.machine()
    }

    async fn hostname(&self) -> Result<String> {
        self.inner.hostname().await
    }

    async fn run(&self, cmd: &str, timeout: Option<Duration>) -> Result<CommandResult> {
        self.inner.run(cmd, timeout).await
    }

    async fn start_process(&self, cmd: &str) -> Result<Box<dyn ProcessHandle>> {
        let handle = self.inner.start_process(cmd).await?;
        if let Some(pgid) = handle.pgid() {
            self.tracker.register(self.inner.clone(), pgid, cmd);
        }
        Ok(Box::new(TrackedProcess {
            inner: handle,
            tracker: self.tracker.clone(),
            machine: self.inner.machine(),
        }))
    }

    async fn send_file(&self, local: &Path, remote: &str) -> Result<()> {
        self.inner.send_file(local, remote).await
    }

    async fn kill_group(&self, pgid: u32) -> Result<bool> {
        self.inner.kill_group(pgid).await
    }

    fn control_path(&self) -> Option<PathBuf> {
        self.inner.control_path()
    }
}
