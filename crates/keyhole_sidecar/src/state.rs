//! The sidecar state machine (§3, §4.8): `booting → (pending_unlock |
//! ready) → shutting_down`. `pending_unlock` only ever answers the
//! `__health__` pseudo-service over IPC and the parent's `unlock` control
//! message; every other request is refused by the handler, not by this
//! type — `Phase` only tracks which state we're in.

use keyhole_ipc::SidecarState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Booting,
    PendingUnlock,
    Ready,
    ShuttingDown,
}

impl Phase {
    /// The subset of phases meaningful to report over the `__health__`
    /// IPC endpoint. `Booting`/`ShuttingDown` never answer IPC at all (the
    /// socket isn't open yet, or is being torn down), so they have no
    /// corresponding wire state.
    pub fn as_wire_state(self) -> Option<SidecarState> {
        match self {
            Phase::PendingUnlock => Some(SidecarState::PendingUnlock),
            Phase::Ready => Some(SidecarState::Ready),
            Phase::Booting | Phase::ShuttingDown => None,
        }
    }

    pub fn can_unlock(self) -> bool {
        matches!(self, Phase::PendingUnlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_unlock_and_ready_expose_a_wire_state() {
        assert_eq!(Phase::PendingUnlock.as_wire_state(), Some(SidecarState::PendingUnlock));
        assert_eq!(Phase::Ready.as_wire_state(), Some(SidecarState::Ready));
        assert_eq!(Phase::Booting.as_wire_state(), None);
        assert_eq!(Phase::ShuttingDown.as_wire_state(), None);
    }
}
