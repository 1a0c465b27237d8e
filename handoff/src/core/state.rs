//! Run states reported by the process supervisor.

use std::fmt::{Display, Formatter};

/// Supervisor-reported state of one slot's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Registered with the supervisor, never started in this cycle.
    Dormant,
    /// Start issued, process not yet serving.
    Starting,
    Running,
    /// Suspended but holding a live OS process (warm standby).
    Paused,
    Stopped,
}

impl RunState {
    /// Whether a live-or-imminent OS process exists for this state.
    ///
    /// A paused slot still holds its process, so its directory must never be
    /// reclaimed; only dormant and stopped slots are candidates for
    /// recycling.
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Dormant => "dormant",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_states_cover_paused() {
        assert!(RunState::Starting.is_alive());
        assert!(RunState::Running.is_alive());
        assert!(RunState::Paused.is_alive());
        assert!(!RunState::Dormant.is_alive());
        assert!(!RunState::Stopped.is_alive());
    }
}
