//! Shared wire definitions for call signaling between clients and the relay.
//! Kept in a dedicated crate so the relay can route envelopes without pulling
//! in the negotiation runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Routing key for a participant. Supplied by the identity provider and
/// treated as opaque everywhere in the signaling path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies one call attempt. Unique per attempt, not durable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session description produced and consumed by the media transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One possible network path, as emitted by the local ICE agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Invite,
    Answer,
    Candidate,
    Reject,
    End,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EnvelopeKind::Invite => "invite",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Candidate => "candidate",
            EnvelopeKind::Reject => "reject",
            EnvelopeKind::End => "end",
        };
        f.write_str(label)
    }
}

/// The unit the relay routes. `payload` is never inspected by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: ParticipantId,
    pub to: ParticipantId,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("failed to encode {kind} payload: {source}")]
    Encode {
        kind: EnvelopeKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed {kind} payload: {source}")]
    Decode {
        kind: EnvelopeKind,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct InvitePayload {
    call_id: CallId,
    #[serde(default)]
    round: u32,
    offer: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct AnswerPayload {
    call_id: CallId,
    #[serde(default)]
    round: u32,
    answer: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct CandidatePayload {
    call_id: CallId,
    candidate: IceCandidate,
}

#[derive(Serialize, Deserialize)]
struct CallOnlyPayload {
    call_id: CallId,
}

/// Typed view of an envelope payload, used by the call endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSignal {
    /// `round` numbers the caller's offers within one call; an ICE restart
    /// sends a new invite with the next round.
    Invite {
        call_id: CallId,
        round: u32,
        offer: SessionDescription,
    },
    /// Echoes the `round` of the invite being answered.
    Answer {
        call_id: CallId,
        round: u32,
        answer: SessionDescription,
    },
    Candidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    Reject {
        call_id: CallId,
    },
    End {
        call_id: CallId,
    },
}

impl CallSignal {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            CallSignal::Invite { .. } => EnvelopeKind::Invite,
            CallSignal::Answer { .. } => EnvelopeKind::Answer,
            CallSignal::Candidate { .. } => EnvelopeKind::Candidate,
            CallSignal::Reject { .. } => EnvelopeKind::Reject,
            CallSignal::End { .. } => EnvelopeKind::End,
        }
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            CallSignal::Invite { call_id, .. }
            | CallSignal::Answer { call_id, .. }
            | CallSignal::Candidate { call_id, .. }
            | CallSignal::Reject { call_id }
            | CallSignal::End { call_id } => call_id,
        }
    }

    pub fn into_envelope(
        self,
        from: ParticipantId,
        to: ParticipantId,
    ) -> Result<Envelope, ProtoError> {
        let kind = self.kind();
        let payload = match self {
            CallSignal::Invite {
                call_id,
                round,
                offer,
            } => serde_json::to_value(InvitePayload {
                call_id,
                round,
                offer,
            }),
            CallSignal::Answer {
                call_id,
                round,
                answer,
            } => serde_json::to_value(AnswerPayload {
                call_id,
                round,
                answer,
            }),
            CallSignal::Candidate { call_id, candidate } => {
                serde_json::to_value(CandidatePayload { call_id, candidate })
            }
            CallSignal::Reject { call_id } | CallSignal::End { call_id } => {
                serde_json::to_value(CallOnlyPayload { call_id })
            }
        }
        .map_err(|source| ProtoError::Encode { kind, source })?;
        Ok(Envelope {
            kind,
            from,
            to,
            payload,
        })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtoError> {
        let kind = envelope.kind;
        let payload = envelope.payload.clone();
        let decode = |source| ProtoError::Decode { kind, source };
        let signal = match kind {
            EnvelopeKind::Invite => {
                let p: InvitePayload = serde_json::from_value(payload).map_err(decode)?;
                CallSignal::Invite {
                    call_id: p.call_id,
                    round: p.round,
                    offer: p.offer,
                }
            }
            EnvelopeKind::Answer => {
                let p: AnswerPayload = serde_json::from_value(payload).map_err(decode)?;
                CallSignal::Answer {
                    call_id: p.call_id,
                    round: p.round,
                    answer: p.answer,
                }
            }
            EnvelopeKind::Candidate => {
                let p: CandidatePayload = serde_json::from_value(payload).map_err(decode)?;
                CallSignal::Candidate {
                    call_id: p.call_id,
                    candidate: p.candidate,
                }
            }
            EnvelopeKind::Reject => {
                let p: CallOnlyPayload = serde_json::from_value(payload).map_err(decode)?;
                CallSignal::Reject { call_id: p.call_id }
            }
            EnvelopeKind::End => {
                let p: CallOnlyPayload = serde_json::from_value(payload).map_err(decode)?;
                CallSignal::End { call_id: p.call_id }
            }
        };
        Ok(signal)
    }
}

/// Frames sent from a participant to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register presence under the authenticated participant id
    Join { participant_id: ParticipantId },
    /// Route an envelope to `envelope.to`
    Signal { envelope: Envelope },
    /// Heartbeat to keep the registration alive
    Ping,
}

/// Frames sent from the relay to a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined { participant_id: ParticipantId },
    Signal { envelope: Envelope },
    Pong,
    Error { message: String },
}
