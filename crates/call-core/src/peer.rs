use std::sync::Arc;

use async_trait::async_trait;
use call_proto::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::{LocalMedia, MediaKind};
use crate::negotiator::{NegotiatorEvent, NegotiatorEventKind};

/// Connectivity as reported by the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
    RemoteTrack(MediaKind),
}

/// Where a transport reports its asynchronous events. Every event is stamped
/// with the generation of the session that created the transport.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<NegotiatorEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<NegotiatorEvent>) -> Self {
        Self { generation, tx }
    }

    /// Sink whose events land on the returned receiver, for driving a
    /// transport outside a controller.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<NegotiatorEvent>();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let NegotiatorEventKind::Peer(peer) = event.kind {
                    if out_tx.send(peer).is_err() {
                        break;
                    }
                }
            }
        });
        (Self { generation: 0, tx }, out_rx)
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(NegotiatorEvent {
            generation: self.generation,
            kind: NegotiatorEventKind::Peer(event),
        });
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// One peer connection. Implementations must tolerate `close` being called
/// more than once.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError>;
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink)
    -> Result<Arc<dyn PeerTransport>, NegotiationError>;
}
