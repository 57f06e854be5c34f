use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Phases of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Initializing,
    Validating,
    Executing,
    Cleanup,
    Completed,
    Failed,
    Aborted,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Failed | SessionPhase::Aborted
        )
    }

    /// Whether `self -> next` is an edge of the session state machine.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Initializing, Validating)
                | (Initializing, Cleanup)
                | (Initializing, Failed)
                | (Initializing, Aborted)
                | (Validating, Executing)
                | (Validating, Failed)
                | (Validating, Cleanup)
                | (Executing, Completed)
                | (Executing, Cleanup)
                | (Cleanup, Failed)
                | (Cleanup, Aborted)
        )
    }
}

/// Why a session stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The user pressed Ctrl+C (or the process got SIGTERM).
    Interrupted,
    /// A job raised, or the background monitor tripped.
    Error(String),
}

/// One end-to-end run. Owned by the orchestrator; the disk monitor is the
/// only other writer and goes through [`SyncSession::request_abort`].
pub struct SyncSession {
    pub id: String,
    pub source_host: String,
    pub target_host: String,
    phase: Mutex<SessionPhase>,
    has_error: AtomicBool,
    abort: Mutex<Option<AbortReason>>,
}

impl SyncSession {
    pub fn new(source_host: impl Into<String>, target_host: impl Into<String>) -> Self {
        Self {
            id: new_session_id(),
            source_host: source_host.into(),
            target_host: target_host.into(),
            phase: Mutex::new(SessionPhase::Initializing),
            has_error: AtomicBool::new(false),
            abort: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
            .lock()
            .map(|p| *p)
            .unwrap_or(SessionPhase::Failed)
    }

    /// Move to `next`, returning the previous phase. Illegal edges are
    /// refused and logged; the phase is left unchanged.
    pub fn transition(&self, next: SessionPhase) -> SessionPhase {
        let Ok(mut phase) = self.phase.lock() else {
            return SessionPhase::Failed;
        };
        let previous = *phase;
        if previous.can_transition_to(next) {
            *phase = next;
        } else {
            tracing::error!(?previous, ?next, "refusing illegal session transition");
        }
        previous
    }

    pub fn mark_error(&self) {
        self.has_error.store(true, Ordering::SeqCst);
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    /// Record the first abort reason; later requests are ignored except that
    /// an error always sets the error flag.
    pub fn request_abort(&self, reason: AbortReason) {
        if matches!(reason, AbortReason::Error(_)) {
            self.mark_error();
        }
        if let Ok(mut abort) = self.abort.lock()
            && abort.is_none()
        {
            *abort = Some(reason);
        }
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort.lock().ok().and_then(|a| a.clone())
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_reason().is_some()
    }
}

/// Short random session token: 8 hex characters.
pub fn new_session_id() -> String {
    hex::encode(&uuid::Uuid::new_v4().as_bytes()[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_short_hex() {
        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_session_id());
    }

    #[test]
    fn completed_only_reachable_from_executing() {
        let session = SyncSession::new("a", "b");
        session.transition(SessionPhase::Completed);
        assert_eq!(session.phase(), SessionPhase::Initializing);
        session.transition(SessionPhase::Validating);
        session.transition(SessionPhase::Executing);
        session.transition(SessionPhase::Completed);
        assert_eq!(session.phase(), SessionPhase::Completed);
        assert!(session.phase().is_terminal());
    }

    #[test]
    fn first_abort_reason_wins() {
        let session = SyncSession::new("a", "b");
        session.request_abort(AbortReason::Interrupted);
        session.request_abort(AbortReason::Error("disk full".into()));
        assert_eq!(session.abort_reason(), Some(AbortReason::Interrupted));
        assert!(session.has_error());
    }
}
