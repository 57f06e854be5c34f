//! Drives one sync session through its phases.
//!
//! `INITIALIZING -> VALIDATING -> EXECUTING -> CLEANUP -> {COMPLETED | FAILED | ABORTED}`
//!
//! The orchestrator is the only writer of session state apart from the
//! background jobs (the disk monitor), which go through
//! [`SyncSession::request_abort`] and fire the session's abort token.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::btrfs;
use crate::config::Config;
use crate::error::SyncError;
use crate::events::{Event, EventSink, LogLevel};
use crate::jobs::{self, ConcurrencyMode, DiskSpaceMonitorJob, JobContext, PlannedJob, SnapshotJob};
use crate::lock::{self, SourceLock, TargetLock};
use crate::prompt::Confirm;
use crate::remote::{Executor, ProcessTracker, TrackedExecutor};
use crate::reporter::Reporter;
use crate::session::{AbortReason, SessionPhase, SyncSession};
use crate::snapshot::{self, Phase, RollbackOutcome, SessionDir, SnapshotManager};
use crate::version::{self, VersionAction};

/// Stream of user interrupts. Each message is one Ctrl+C (or SIGTERM).
pub type Interrupts = mpsc::UnboundedReceiver<()>;

/// Forward Ctrl+C and SIGTERM into an [`Interrupts`] stream.
pub fn signal_interrupts() -> Interrupts {
    use tokio::signal::unix::{SignalKind, signal};

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut term = signal(SignalKind::terminate()).ok();
        loop {
            let terminated = async {
                match term.as_mut() {
                    Some(t) => {
                        if t.recv().await.is_none() {
                            std::future::pending::<()>().await;
                        }
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                r = tokio::signal::ctrl_c() => if r.is_err() { break },
                _ = terminated => {}
            }
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Next interrupt; never resolves once every sender is gone.
async fn next_interrupt(interrupts: &mut Interrupts) {
    if interrupts.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}

/// The fixed job plan of a session, split by concurrency mode.
#[derive(Debug, Clone)]
pub struct Plan {
    pub session_dir: String,
    /// Jobs running alongside the pipeline for the whole of EXECUTING.
    pub background: Vec<PlannedJob>,
    /// Pre snapshot, enabled sync jobs in configured order, post snapshot.
    pub sequential: Vec<PlannedJob>,
}

impl Plan {
    /// Every job in plan order, background jobs first.
    pub fn jobs(&self) -> impl Iterator<Item = &PlannedJob> {
        self.background.iter().chain(self.sequential.iter())
    }
}

fn snapshot_job(config: &Config, phase: Phase, session_dir: &str) -> PlannedJob {
    let snaps = &config.btrfs_snapshots;
    PlannedJob::new(
        Arc::new(SnapshotJob),
        json!({
            "phase": phase,
            "subvolumes": snaps.subvolumes,
            "snapshot_root": snaps.snapshot_root,
            "session_dir": session_dir,
        }),
    )
}

/// Build the job plan and run every configuration check. All problems are
/// returned together as [`SyncError::Config`]; nothing here touches a machine.
pub fn build_plan(config: &Config, session_dir: &str) -> Result<Plan, SyncError> {
    let mut errors = config.validate();

    let monitor_config = serde_json::to_value(&config.disk_space_monitor).unwrap_or_default();
    let mut planned = vec![
        PlannedJob::new(Arc::new(DiskSpaceMonitorJob), monitor_config),
        snapshot_job(config, Phase::Pre, session_dir),
    ];
    for (i, entry) in config.sync_jobs.iter().enumerate() {
        let Some(job) = jobs::lookup(&entry.name) else {
            errors.push(format!(
                "sync_jobs[{i}]: unknown job '{}' (known: {})",
                entry.name,
                jobs::optional_job_names().join(", ")
            ));
            continue;
        };
        if job.required() {
            errors.push(format!(
                "sync_jobs[{i}]: '{}' is required, always runs and cannot be listed",
                entry.name
            ));
            continue;
        }
        if entry.enabled {
            planned.push(PlannedJob::new(job, entry.config.clone()));
        }
    }
    planned.push(snapshot_job(config, Phase::Post, session_dir));

    for job in &planned {
        errors.extend(
            job.job
                .validate_config(&job.config)
                .iter()
                .map(ToString::to_string),
        );
    }
    if !errors.is_empty() {
        return Err(SyncError::Config(errors));
    }

    let (background, sequential): (Vec<_>, Vec<_>) = planned
        .into_iter()
        .partition(|job| job.job.mode() == ConcurrencyMode::Background);
    Ok(Plan {
        session_dir: session_dir.to_string(),
        background,
        sequential,
    })
}

/// What a finished session looks like from the outside.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: String,
    pub session_dir: String,
    pub phase: SessionPhase,
    pub rollback: Option<RollbackOutcome>,
}

/// Locks and connection owned by the session while it runs.
#[derive(Default)]
struct Held {
    source_lock: Option<SourceLock>,
    target_lock: Option<TargetLock>,
    connected: bool,
}

/// A job executing as its own task.
struct RunningJob {
    name: String,
    handle: JoinHandle<Result<()>>,
    cancel: CancellationToken,
    tracker: ProcessTracker,
}

pub struct Orchestrator {
    config: Config,
    target_address: String,
    source: Arc<dyn Executor>,
    target: Arc<dyn Executor>,
    reporter: Arc<Reporter>,
    confirm: Arc<dyn Confirm>,
    binary: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        target_address: impl Into<String>,
        source: Arc<dyn Executor>,
        target: Arc<dyn Executor>,
        reporter: Arc<Reporter>,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        Self {
            config,
            target_address: target_address.into(),
            source,
            target,
            reporter,
            confirm,
            binary: None,
        }
    }

    /// Binary installed on the target when it is missing or outdated.
    /// Defaults to the running executable.
    pub fn with_binary(mut self, binary: PathBuf) -> Self {
        self.binary = Some(binary);
        self
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.reporter.publish(Event::log(level, None, message));
    }

    fn enter(&self, session: &SyncSession, next: SessionPhase) {
        let from = session.transition(next);
        self.reporter.publish(Event::PhaseChanged {
            session_id: session.id.clone(),
            from,
            to: session.phase(),
        });
    }

    /// Run one session to a terminal phase.
    pub async fn run(self, mut interrupts: Interrupts) -> SessionReport {
        let source_host = match self.source.hostname().await {
            Ok(name) => name,
            Err(_) => crate::remote::local_hostname(),
        };
        let session = Arc::new(SyncSession::new(source_host, self.target_address.clone()));
        let session_dir = format!("{}-{}", btrfs::format_timestamp(Utc::now()), session.id);
        self.log(
            LogLevel::Info,
            format!(
                "session {} started: {} -> {}",
                session.id, session.source_host, session.target_host
            ),
        );

        let mut report = SessionReport {
            session_id: session.id.clone(),
            session_dir: session_dir.clone(),
            phase: SessionPhase::Initializing,
            rollback: None,
        };

        let plan = match build_plan(&self.config, &session_dir) {
            Ok(plan) => plan,
            Err(e) => {
                self.log(LogLevel::Error, e.to_string());
                session.mark_error();
                report.phase = self.settle(&session, SessionPhase::Failed);
                return report;
            }
        };
        tracing::debug!(?plan, "job plan");

        // INITIALIZING
        let mut held = Held::default();
        let initialized = tokio::select! {
            r = self.initialize(&session, &mut held) => Some(r),
            _ = next_interrupt(&mut interrupts) => None,
        };
        match initialized {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                self.log(LogLevel::Error, format!("{e:#}"));
                session.request_abort(AbortReason::Error(e.to_string()));
                self.release(&mut held).await;
                report.phase = self.settle(&session, SessionPhase::Failed);
                return report;
            }
            None => {
                self.log(LogLevel::Warning, "interrupted during initialization");
                session.request_abort(AbortReason::Interrupted);
                self.release(&mut held).await;
                report.phase = self.settle(&session, SessionPhase::Aborted);
                return report;
            }
        }

        // VALIDATING
        self.enter(&session, SessionPhase::Validating);
        let validated = tokio::select! {
            r = self.validate(&session, &plan) => Some(r),
            _ = next_interrupt(&mut interrupts) => None,
        };
        match validated {
            None => {
                self.log(LogLevel::Warning, "interrupted during validation");
                session.request_abort(AbortReason::Interrupted);
                self.enter(&session, SessionPhase::Cleanup);
                self.release(&mut held).await;
                report.phase = self.settle(&session, SessionPhase::Aborted);
                return report;
            }
            Some(Err(e)) => {
                self.log(LogLevel::Error, e.to_string());
                session.mark_error();
                self.release(&mut held).await;
                report.phase = self.settle(&session, SessionPhase::Failed);
                return report;
            }
            Some(Ok(())) => {}
        }

        // EXECUTING
        self.enter(&session, SessionPhase::Executing);
        let errors_before = self.reporter.error_count();
        let abort = CancellationToken::new();
        let background: Vec<_> = plan
            .background
            .iter()
            .map(|job| self.spawn_background(&session, job, abort.clone()))
            .collect();
        let active = self
            .execute(&session, &plan, errors_before, &abort, &mut interrupts)
            .await;

        if self.reporter.error_count() > errors_before {
            session.mark_error();
        }
        if !session.abort_requested() && !session.has_error() {
            self.stop_background(background).await;
            self.enter(&session, SessionPhase::Completed);
            self.release(&mut held).await;
            report.phase = self.finish(&session);
            return report;
        }

        // CLEANUP
        self.enter(&session, SessionPhase::Cleanup);
        self.stop_background(background).await;
        if let Some(running) = active {
            self.stop_job(running, &mut interrupts).await;
        }
        self.release_target(&mut held).await;

        let interrupted = session.abort_reason() == Some(AbortReason::Interrupted);
        if !interrupted {
            report.rollback = self.offer_rollback(&plan.session_dir).await;
        }
        held.source_lock.take();

        let terminal = if interrupted {
            SessionPhase::Aborted
        } else {
            SessionPhase::Failed
        };
        report.phase = self.settle(&session, terminal);
        report
    }

    async fn initialize(&self, session: &SyncSession, held: &mut Held) -> Result<()> {
        let holder = lock::holder_id(&session.source_host);
        let lock_path = lock::source_lock_path(self.config.lock_dir.as_deref());
        held.source_lock = Some(lock::acquire_source_lock(&lock_path, &holder)?);

        self.target
            .connect()
            .await
            .with_context(|| format!("cannot connect to {}", session.target_host))?;
        held.connected = true;

        let binary = match &self.binary {
            Some(path) => path.clone(),
            None => std::env::current_exe().context("cannot locate the snapsync executable")?,
        };
        match version::ensure_target_version(self.target.as_ref(), &binary).await? {
            VersionAction::UpToDate => {}
            action => self.log(
                LogLevel::Info,
                format!("target brought to snapsync {} ({action:?})", version::VERSION),
            ),
        }

        let snaps = &self.config.btrfs_snapshots;
        for exec in [&self.source, &self.target] {
            SnapshotManager::new(exec.as_ref(), &snaps.snapshot_root)
                .check_prerequisites(&snaps.subvolumes)
                .await?;
        }

        held.target_lock =
            Some(lock::acquire_target_lock(self.target.as_ref(), lock::TARGET_LOCK_PATH, &holder).await?);
        Ok(())
    }

    fn context(
        &self,
        session: &SyncSession,
        planned: &PlannedJob,
        tracker: &ProcessTracker,
        cancel: CancellationToken,
    ) -> JobContext {
        JobContext::new(
            planned.name(),
            planned.config.clone(),
            Arc::new(TrackedExecutor::new(self.source.clone(), tracker.clone())),
            Arc::new(TrackedExecutor::new(self.target.clone(), tracker.clone())),
            &session.id,
            &session.source_host,
            &session.target_host,
            cancel,
            self.reporter.clone(),
        )
    }

    /// Run every job's pre-flight check in plan order, collecting all errors.
    async fn validate(&self, session: &SyncSession, plan: &Plan) -> Result<(), SyncError> {
        let mut errors = Vec::new();
        for planned in plan.jobs() {
            let ctx = self.context(
                session,
                planned,
                &ProcessTracker::new(),
                CancellationToken::new(),
            );
            errors.extend(planned.job.validate(&ctx).await.iter().map(ToString::to_string));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Validation(errors))
        }
    }

    fn spawn_job(&self, session: &SyncSession, planned: &PlannedJob) -> RunningJob {
        let tracker = ProcessTracker::new();
        let cancel = CancellationToken::new();
        let ctx = self.context(session, planned, &tracker, cancel.clone());
        let job = planned.job.clone();
        RunningJob {
            name: planned.name().to_string(),
            handle: tokio::spawn(async move { job.execute(&ctx).await }),
            cancel,
            tracker,
        }
    }

    /// Start a background job. A failure marks the session and fires
    /// `abort`, which breaks the sequential loop.
    fn spawn_background(
        &self,
        session: &Arc<SyncSession>,
        planned: &PlannedJob,
        abort: CancellationToken,
    ) -> RunningJob {
        let tracker = ProcessTracker::new();
        let cancel = CancellationToken::new();
        let ctx = self.context(session, planned, &tracker, cancel.clone());
        let job = planned.job.clone();
        let session = session.clone();
        let handle = tokio::spawn(async move {
            let result = job.execute(&ctx).await;
            if let Err(e) = &result
                && !SyncError::is_cancelled(e)
            {
                session.request_abort(AbortReason::Error(format!("{}: {e:#}", ctx.job)));
                abort.cancel();
            }
            result
        });
        RunningJob {
            name: planned.name().to_string(),
            handle,
            cancel,
            tracker,
        }
    }

    /// Run the sequential jobs in order. Returns the job that was in flight
    /// when the session started aborting, if any.
    ///
    /// Error-level events do not stop a running sync job, but a required job
    /// (the snapshots) only starts while none has been reported since
    /// `errors_before`.
    async fn execute(
        &self,
        session: &SyncSession,
        plan: &Plan,
        errors_before: usize,
        abort: &CancellationToken,
        interrupts: &mut Interrupts,
    ) -> Option<RunningJob> {
        enum Step {
            Finished(Result<()>),
            MonitorTripped,
            Interrupted,
        }

        for planned in &plan.sequential {
            if session.abort_requested() {
                return None;
            }
            if planned.job.required() && self.reporter.error_count() > errors_before {
                self.log(
                    LogLevel::Warning,
                    format!("errors were reported during the run, skipping {}", planned.name()),
                );
                session.mark_error();
                session.request_abort(AbortReason::Error(
                    "error-level events reported during the run".to_string(),
                ));
                return None;
            }
            let mut running = self.spawn_job(session, planned);
            self.reporter
                .publish(Event::log(LogLevel::Info, Some(&running.name), "started"));
            let step = tokio::select! {
                joined = &mut running.handle => Step::Finished(
                    joined.map_err(anyhow::Error::from).and_then(|r| r)
                ),
                _ = abort.cancelled() => Step::MonitorTripped,
                _ = next_interrupt(interrupts) => Step::Interrupted,
            };
            match step {
                Step::Finished(Ok(())) => {
                    self.reporter
                        .publish(Event::log(LogLevel::Info, Some(&running.name), "finished"));
                }
                Step::Finished(Err(e)) => {
                    self.reporter.publish(Event::log(
                        LogLevel::Error,
                        Some(&running.name),
                        format!("{e:#}"),
                    ));
                    session.request_abort(AbortReason::Error(format!("{}: {e:#}", running.name)));
                    return Some(running);
                }
                Step::MonitorTripped => {
                    let reason = match session.abort_reason() {
                        Some(AbortReason::Error(reason)) => reason,
                        _ => "background job failed".to_string(),
                    };
                    self.log(
                        LogLevel::Error,
                        format!("run stopped during {}: {reason}", running.name),
                    );
                    return Some(running);
                }
                Step::Interrupted => {
                    self.log(
                        LogLevel::Warning,
                        format!("interrupt received, stopping {}", running.name),
                    );
                    session.request_abort(AbortReason::Interrupted);
                    return Some(running);
                }
            }
        }
        None
    }

    async fn stop_background(&self, jobs: Vec<RunningJob>) {
        for job in &jobs {
            job.cancel.cancel();
        }
        let grace = self.config.timeouts.monitor_stop;
        for mut job in jobs {
            if tokio::time::timeout(grace, &mut job.handle).await.is_err() {
                tracing::warn!(job = %job.name, ?grace, "background job did not stop in time");
                job.handle.abort();
            }
            job.tracker.terminate_all().await;
        }
    }

    /// Ask the in-flight job to stop, wait for it up to `timeouts.job_stop`
    /// (or until the next interrupt) and kill whatever it left running.
    async fn stop_job(&self, mut running: RunningJob, interrupts: &mut Interrupts) {
        running.cancel.cancel();
        if !running.handle.is_finished() {
            let grace = self.config.timeouts.job_stop;
            let unwound = tokio::select! {
                r = tokio::time::timeout(grace, &mut running.handle) => r.is_ok(),
                _ = next_interrupt(interrupts) => {
                    self.log(LogLevel::Warning, "second interrupt, forcing termination");
                    false
                }
            };
            if !unwound {
                self.reporter.publish(Event::log(
                    LogLevel::Warning,
                    Some(&running.name),
                    "did not stop in time, terminating",
                ));
                running.handle.abort();
            }
        }
        let killed = running.tracker.terminate_all().await;
        if killed > 0 {
            self.reporter.publish(Event::log(
                LogLevel::Warning,
                Some(&running.name),
                format!("terminated {killed} leftover process group(s)"),
            ));
        }
    }

    async fn release_target(&self, held: &mut Held) {
        if let Some(lock) = held.target_lock.take()
            && let Err(e) = lock.release().await
        {
            tracing::warn!("target lock release: {e:#}");
        }
        if held.connected {
            held.connected = false;
            if let Err(e) = self.target.close().await {
                tracing::warn!("closing connection: {e:#}");
            }
        }
    }

    /// Drop the connection and both locks. Failures are logged only.
    async fn release(&self, held: &mut Held) {
        self.release_target(held).await;
        held.source_lock.take();
    }

    async fn offer_rollback(&self, session_dir: &str) -> Option<RollbackOutcome> {
        let snaps = &self.config.btrfs_snapshots;
        let manager = SnapshotManager::new(self.source.as_ref(), &snaps.snapshot_root);
        let dir = SessionDir::parse(&manager.sessions_root(), session_dir)?;
        match snapshot::offer_rollback(
            &manager,
            &dir,
            &snaps.subvolumes,
            self.confirm.as_ref(),
            self.reporter.as_ref(),
        )
        .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.log(LogLevel::Critical, format!("{e:#}"));
                None
            }
        }
    }

    fn settle(&self, session: &SyncSession, terminal: SessionPhase) -> SessionPhase {
        self.enter(session, terminal);
        self.finish(session)
    }

    fn finish(&self, session: &SyncSession) -> SessionPhase {
        let phase = session.phase();
        self.reporter.publish(Event::SessionFinished {
            session_id: session.id.clone(),
            phase,
        });
        tracing::info!(session = %session.id, ?phase, "{}", self.reporter.summary());
        phase
    }
}
