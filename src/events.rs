use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::Machine;
use crate::session::SessionPhase;

/// Severity of a log event. Ordered so that `level >= LogLevel::Error`
/// selects the events that force a FAILED outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Reported completion state of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Percentage complete (0-100), when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    /// Items processed so far, when counting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    /// Total number of items, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Label of the item being processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    /// Liveness ping without measurable progress.
    #[serde(default)]
    pub heartbeat: bool,
}

impl ProgressUpdate {
    pub fn percent(percent: u8) -> Self {
        Self {
            percent: Some(percent.min(100)),
            ..Self::default()
        }
    }

    pub fn count(current: u64, total: u64) -> Self {
        Self {
            current: Some(current),
            total: Some(total),
            ..Self::default()
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            heartbeat: true,
            ..Self::default()
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.item = Some(item.into());
        self
    }
}

/// Structured event emitted during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Log {
        ts: DateTime<Utc>,
        level: LogLevel,
        /// Emitting job, `None` for the orchestrator itself.
        job: Option<String>,
        host: Option<Machine>,
        message: String,
    },
    Progress {
        ts: DateTime<Utc>,
        job: String,
        update: ProgressUpdate,
    },
    PhaseChanged {
        session_id: String,
        from: SessionPhase,
        to: SessionPhase,
    },
    SnapshotCreated {
        machine: Machine,
        path: String,
    },
    SessionFinished {
        session_id: String,
        phase: SessionPhase,
    },
}

impl Event {
    pub fn log(level: LogLevel, job: Option<&str>, message: impl Into<String>) -> Self {
        Event::Log {
            ts: Utc::now(),
            level,
            job: job.map(str::to_string),
            host: None,
            message: message.into(),
        }
    }

    /// Log level carried by this event, if it is a log event.
    pub fn level(&self) -> Option<LogLevel> {
        match self {
            Event::Log { level, .. } => Some(*level),
            _ => None,
        }
    }
}

/// Consumer of log and progress events. Nothing the core does depends on
/// what the sink does with them.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}
