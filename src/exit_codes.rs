/// Process exit codes.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const INTERRUPTED: i32 = 130;
}

use crate::session::SessionPhase;

/// Map a terminal session phase to the process exit code.
pub fn for_phase(phase: SessionPhase) -> i32 {
    match phase {
        SessionPhase::Completed => exit::SUCCESS,
        SessionPhase::Aborted => exit::INTERRUPTED,
        _ => exit::FAILURE,
    }
}
