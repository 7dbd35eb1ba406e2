use call_proto::ProtoError;
use thiserror::Error;

/// Failures acquiring local camera/microphone. Terminal for the call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to use media devices was denied")]
    PermissionDenied,
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("media device busy: {0}")]
    DeviceBusy(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("peer transport setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("{0}")]
    RoleViolation(String),
    #[error("peer transport not ready")]
    NotReady,
    #[error("peer transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("signaling join timed out")]
    JoinTimeout,
    #[error("failed to encode signal: {0}")]
    Encode(String),
    #[error("relay rejected frame: {0}")]
    Relay(String),
}

impl From<ProtoError> for SignalingError {
    fn from(err: ProtoError) -> Self {
        SignalingError::Encode(err.to_string())
    }
}

/// Everything the call controller can report. Cloned onto the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("{operation} is not allowed while {state}")]
    IllegalState {
        operation: &'static str,
        state: String,
    },
    #[error("cannot place a call to yourself")]
    SelfCall,
    #[error("nothing to retry")]
    NothingToRetry,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("malformed signal from {from}: {message}")]
    MalformedSignal { from: String, message: String },
    #[error("no connectivity after {restarts} ice restart(s)")]
    ConnectivityExhausted { restarts: u32 },
    #[error("call controller stopped")]
    ControllerClosed,
}
