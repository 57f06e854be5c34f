use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::events::{Event, EventSink, LogLevel, ProgressUpdate};

/// Reporter aggregates events and produces human or JSON output.
///
/// It is also the place where error-level events are counted, which is what
/// turns a run whose jobs all "completed" into a FAILED one.
///
/// Progress is passed through but not recorded; only the latest update of
/// each job is kept.
pub struct Reporter {
    events: Mutex<Vec<Event>>,
    progress: Mutex<HashMap<String, ProgressUpdate>>,
    errors: AtomicUsize,
    json_mode: bool,
    #[cfg(feature = "cli")]
    bars: Mutex<std::collections::HashMap<String, indicatif::ProgressBar>>,
}

impl Reporter {
    pub fn new(json_mode: bool) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            progress: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
            json_mode,
            #[cfg(feature = "cli")]
            bars: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Number of events at `error` level or above seen so far.
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    /// Recorded events, progress excluded.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Most recent progress reported by `job`.
    pub fn last_progress(&self, job: &str) -> Option<ProgressUpdate> {
        self.progress.lock().ok()?.get(job).cloned()
    }

    pub fn summary(&self) -> String {
        let events = self.events();
        let snapshots = events
            .iter()
            .filter(|e| matches!(e, Event::SnapshotCreated { .. }))
            .count();
        let warnings = events
            .iter()
            .filter(|e| e.level() == Some(LogLevel::Warning))
            .count();
        format!(
            "{} events recorded, {} snapshots created, {} warnings, {} errors",
            events.len(),
            snapshots,
            warnings,
            self.error_count()
        )
    }

    fn trace(&self, event: &Event) {
        match event {
            Event::Log {
                level,
                job,
                host,
                message,
                ..
            } => {
                let job = job.as_deref().unwrap_or("orchestrator");
                let host = host.map(|h| h.to_string()).unwrap_or_default();
                match level {
                    LogLevel::Debug => tracing::debug!(job, host = %host, "{message}"),
                    LogLevel::Info => tracing::info!(job, host = %host, "{message}"),
                    LogLevel::Warning => tracing::warn!(job, host = %host, "{message}"),
                    LogLevel::Error | LogLevel::Critical => {
                        tracing::error!(job, host = %host, critical = *level == LogLevel::Critical, "{message}")
                    }
                }
            }
            Event::Progress { job, update, .. } => {
                #[cfg(feature = "cli")]
                self.render_progress(job, update);
                tracing::trace!(job = %job, percent = ?update.percent, item = ?update.item, "progress");
            }
            Event::PhaseChanged { from, to, .. } => {
                tracing::info!(?from, ?to, "session phase changed")
            }
            Event::SnapshotCreated { machine, path } => {
                tracing::info!(%machine, path = %path, "snapshot created")
            }
            Event::SessionFinished { session_id, phase } => {
                tracing::info!(session_id = %session_id, ?phase, "session finished")
            }
        }
    }

    #[cfg(feature = "cli")]
    fn render_progress(&self, job: &str, update: &ProgressUpdate) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        let bar = bars.entry(job.to_string()).or_insert_with(|| {
            let bar = indicatif::ProgressBar::new(100);
            bar.set_prefix(job.to_string());
            bar
        });
        if let Some(percent) = update.percent {
            bar.set_position(u64::from(percent));
        } else if let (Some(current), Some(total)) = (update.current, update.total) {
            bar.set_length(total);
            bar.set_position(current);
        } else {
            bar.tick();
        }
        if let Some(item) = &update.item {
            bar.set_message(item.clone());
        }
    }
}

impl EventSink for Reporter {
    fn publish(&self, event: Event) {
        if event.level().is_some_and(|l| l >= LogLevel::Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        if self.json_mode {
            // Emit JSON line to stdout
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        } else {
            self.trace(&event);
        }
        match event {
            Event::Progress { job, update, .. } => {
                if let Ok(mut progress) = self.progress.lock() {
                    progress.insert(job, update);
                }
            }
            event => {
                if let Ok(mut events) = self.events.lock() {
                    events.push(event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_error_and_critical_only() {
        let reporter = Reporter::new(false);
        reporter.publish(Event::log(LogLevel::Info, None, "hello"));
        reporter.publish(Event::log(LogLevel::Warning, Some("dummy"), "careful"));
        assert_eq!(reporter.error_count(), 0);
        reporter.publish(Event::log(LogLevel::Error, Some("dummy"), "bad"));
        reporter.publish(Event::log(LogLevel::Critical, None, "worse"));
        assert_eq!(reporter.error_count(), 2);
        assert!(reporter.summary().contains("1 warnings, 2 errors"));
    }

    #[test]
    fn progress_is_not_recorded() {
        let reporter = Reporter::new(false);
        for i in 0..10_000u64 {
            reporter.publish(Event::Progress {
                ts: chrono::Utc::now(),
                job: "file_sync".to_string(),
                update: ProgressUpdate::count(i + 1, 10_000),
            });
        }
        reporter.publish(Event::log(LogLevel::Info, Some("file_sync"), "done"));
        assert_eq!(reporter.events().len(), 1);
        let last = reporter.last_progress("file_sync").unwrap();
        assert_eq!(last.current, Some(10_000));
        assert!(reporter.last_progress("dummy_success").is_none());
    }
}
