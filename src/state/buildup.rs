//! Buildup progress values and animation steps

use std::time::Duration;

use super::types::ConnectionBuildupState;

/// Progress shown when a state is entered
pub fn initial_progress(state: ConnectionBuildupState) -> u8 {
    use ConnectionBuildupState::*;
    match state {
        New | Push | ManualStart | Closed => 0,
        Connecting => 13,
        Waiting => 14,
        PeerHandshake => 15,
        Loading => 60,
        Done => 100,
    }
}

/// Tick period for states that animate their progress
pub fn tick_period(state: ConnectionBuildupState) -> Option<Duration> {
    use ConnectionBuildupState::*;
    match state {
        Push => Some(Duration::from_millis(800)),
        PeerHandshake | Loading => Some(Duration::from_millis(500)),
        _ => None,
    }
}

/// Next progress value, or `None` once the state's ceiling is reached
/// (the connection is then considered slow).
pub fn next_progress(state: ConnectionBuildupState, progress: u8) -> Option<u8> {
    use ConnectionBuildupState::*;
    match state {
        Push if progress < 12 => Some(progress + 1),
        PeerHandshake if progress < 40 => Some(progress + 5),
        PeerHandshake if progress < 55 => Some(progress + 3),
        PeerHandshake if progress < 60 => Some(progress + 1),
        Loading if progress < 80 => Some(progress + 5),
        Loading if progress < 90 => Some(progress + 2),
        Loading if progress < 99 => Some(progress + 1),
        _ => None,
    }
}
