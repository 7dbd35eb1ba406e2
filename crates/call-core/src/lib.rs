//! Peer-to-peer call setup: a per-participant call state machine, the
//! offer/answer/candidate negotiator it drives, and a client for the
//! beach-ring signaling relay.

pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod mock;
pub mod negotiator;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod state;

pub use call_proto;
pub use config::{CallConfig, IceServerConfig, SignalingConfig};
pub use controller::{CallController, CallDeps, CallEvent};
pub use error::{CallError, MediaError, NegotiationError, SignalingError};
pub use media::{LocalMedia, LocalTrack, MediaConstraints, MediaKind, MediaSource};
pub use peer::{Connectivity, PeerEvent, PeerEventSink, PeerTransport, PeerTransportFactory};
pub use rtc::{RtcPeerTransport, RtcTransportFactory};
pub use session::{CallSession, Role};
pub use signaling::{SignalSink, SignalingClient};
pub use state::{CallState, Direction, EndReason};
