use call_proto::{CallId, IceCandidate, ParticipantId, SessionDescription};
use tokio::time::Instant;

use crate::negotiator::SessionNegotiator;
use crate::state::CallState;

/// Which side of the offer/answer exchange this controller plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Placed the call; the only side that creates offers
    Initiator,
    /// Received the call; the only side that creates answers
    Responder,
}

/// The single call a controller is currently handling.
pub struct CallSession {
    call_id: CallId,
    initiator: ParticipantId,
    responder: ParticipantId,
    role: Role,
    pub(crate) state: CallState,
    pub(crate) negotiator: SessionNegotiator,
    /// Offer received while ringing or still preparing; applied once the transport exists
    pub(crate) stored_offer: Option<SessionDescription>,
    /// Round of the latest invite accepted from the caller; echoed in answers
    pub(crate) offer_round: u32,
    pub(crate) restarts_used: u32,
    pub(crate) deadline: Option<Instant>,
    /// Set once the peer has heard about this call from us
    pub(crate) peer_aware: bool,
}

impl CallSession {
    pub(crate) fn outgoing(
        call_id: CallId,
        local: ParticipantId,
        peer: ParticipantId,
        negotiator: SessionNegotiator,
    ) -> Self {
        Self {
            call_id,
            initiator: local,
            responder: peer,
            role: Role::Initiator,
            state: CallState::Idle,
            negotiator,
            stored_offer: None,
            offer_round: 0,
            restarts_used: 0,
            deadline: None,
            peer_aware: false,
        }
    }

    pub(crate) fn incoming(
        call_id: CallId,
        local: ParticipantId,
        peer: ParticipantId,
        round: u32,
        offer: SessionDescription,
        negotiator: SessionNegotiator,
    ) -> Self {
        Self {
            call_id,
            initiator: peer,
            responder: local,
            role: Role::Responder,
            state: CallState::Idle,
            negotiator,
            stored_offer: Some(offer),
            offer_round: round,
            restarts_used: 0,
            deadline: None,
            peer_aware: true,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn initiator(&self) -> &ParticipantId {
        &self.initiator
    }

    pub fn responder(&self) -> &ParticipantId {
        &self.responder
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// The other participant.
    pub fn peer(&self) -> &ParticipantId {
        match self.role {
            Role::Initiator => &self.responder,
            Role::Responder => &self.initiator,
        }
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.negotiator.local_description()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.negotiator.remote_description()
    }

    pub fn pending_remote_candidates(&self) -> Vec<IceCandidate> {
        self.negotiator.pending_remote_candidates().cloned().collect()
    }

    /// Whether a signal from `from` about `call_id` belongs to this session.
    pub(crate) fn matches(&self, from: &ParticipantId, call_id: &CallId) -> bool {
        &self.call_id == call_id && self.peer() == from
    }
}
