use std::fmt;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    LocalReject,
    PeerRejected,
    PeerEnded,
    /// Incoming call rang out without a local decision
    Missed,
    MediaUnavailable(MediaError),
    NegotiationFailed,
    ConnectivityExhausted,
}

impl EndReason {
    /// Failures the user may recover from with an explicit retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EndReason::ConnectivityExhausted | EndReason::NegotiationFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing(Direction),
    Negotiating,
    Active,
    Ended(EndReason),
}

impl CallState {
    /// Whether a session in this state still holds (or may acquire) resources.
    pub fn is_live(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Ended(_))
    }

    pub fn can_transition_to(&self, next: &CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Idle, Ringing(_)) => true,
            (Ringing(_), Negotiating) => true,
            (Negotiating, Active) => true,
            // connectivity lost; a restart round re-enters negotiation
            (Active, Negotiating) => true,
            (Ended(_), Idle) => true,
            (from, Ended(_)) => from.is_live(),
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => f.write_str("idle"),
            CallState::Ringing(Direction::Outgoing) => f.write_str("ringing (outgoing)"),
            CallState::Ringing(Direction::Incoming) => f.write_str("ringing (incoming)"),
            CallState::Negotiating => f.write_str("negotiating"),
            CallState::Active => f.write_str("active"),
            CallState::Ended(reason) => write!(f, "ended ({reason:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_never_jumps_to_active() {
        assert!(!CallState::Idle.can_transition_to(&CallState::Active));
        assert!(!CallState::Idle.can_transition_to(&CallState::Negotiating));
        assert!(!CallState::Idle.can_transition_to(&CallState::Ended(EndReason::LocalHangup)));
    }

    #[test]
    fn ringing_must_negotiate_before_active() {
        for direction in [Direction::Outgoing, Direction::Incoming] {
            let ringing = CallState::Ringing(direction);
            assert!(ringing.can_transition_to(&CallState::Negotiating));
            assert!(!ringing.can_transition_to(&CallState::Active));
            assert!(ringing.can_transition_to(&CallState::Ended(EndReason::PeerEnded)));
        }
    }

    #[test]
    fn ended_only_releases_to_idle() {
        let ended = CallState::Ended(EndReason::PeerRejected);
        assert!(ended.can_transition_to(&CallState::Idle));
        assert!(!ended.can_transition_to(&CallState::Negotiating));
        assert!(!ended.can_transition_to(&CallState::Ringing(Direction::Incoming)));
        assert!(!ended.can_transition_to(&CallState::Ended(EndReason::LocalHangup)));
    }

    #[test]
    fn active_can_fall_back_to_negotiating() {
        assert!(CallState::Active.can_transition_to(&CallState::Negotiating));
        assert!(!CallState::Active.can_transition_to(&CallState::Ringing(Direction::Outgoing)));
    }
}
