//! In-memory collaborators for driving call controllers without devices,
//! network, or a relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use call_proto::{Envelope, EnvelopeKind, IceCandidate, ParticipantId, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};

use crate::error::{MediaError, NegotiationError, SignalingError};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaKind, MediaSource};
use crate::peer::{Connectivity, PeerEvent, PeerEventSink, PeerTransport, PeerTransportFactory};
use crate::signaling::SignalSink;

pub struct MockTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
    enabled: AtomicBool,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        }
    }
}

impl LocalTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Holds a gated [`MockMediaSource`] until released, like a pending permission prompt.
pub struct MediaGate(Arc<Semaphore>);

impl MediaGate {
    pub fn release(&self) {
        self.0.add_permits(1);
    }
}

pub struct MockMediaSource {
    failure: Option<MediaError>,
    gate: Option<Arc<Semaphore>>,
    requests: AtomicUsize,
    acquired: Mutex<Vec<LocalMedia>>,
}

impl MockMediaSource {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            failure: None,
            gate: None,
            requests: AtomicUsize::new(0),
            acquired: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: MediaError) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(error),
            gate: None,
            requests: AtomicUsize::new(0),
            acquired: Mutex::new(Vec::new()),
        })
    }

    /// Every acquisition waits for one [`MediaGate::release`].
    pub fn gated() -> (Arc<Self>, MediaGate) {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(Self {
            failure: None,
            gate: Some(Arc::clone(&gate)),
            requests: AtomicUsize::new(0),
            acquired: Mutex::new(Vec::new()),
        });
        (source, MediaGate(gate))
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> Vec<LocalMedia> {
        self.acquired.lock().clone()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let request = self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| MediaError::DeviceUnavailable("gate closed".into()))?;
            permit.forget();
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let tracks = constraints
            .kinds()
            .into_iter()
            .map(|kind| Arc::new(MockTrack::new(format!("{kind}-{request}"), kind)) as Arc<dyn LocalTrack>)
            .collect();
        let media = LocalMedia::new(format!("mock-stream-{request}"), tracks);
        self.acquired.lock().push(media.clone());
        Ok(media)
    }
}

/// Operations a [`MockPeerTransport`] observed, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AttachMedia(usize),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Clone, Default)]
pub struct MockPeerOptions {
    /// Report `Connected` once both descriptions are set
    pub auto_connect: bool,
    /// Emitted as local candidates after each local description
    pub local_candidates: Vec<IceCandidate>,
    /// Remote descriptions wait for a permit
    pub remote_gate: Option<Arc<Semaphore>>,
}

impl MockPeerOptions {
    pub fn connecting() -> Self {
        Self {
            auto_connect: true,
            local_candidates: vec![IceCandidate::new("candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host")],
            remote_gate: None,
        }
    }
}

pub struct MockPeerTransport {
    id: usize,
    sink: PeerEventSink,
    options: MockPeerOptions,
    ops: Mutex<Vec<PeerOp>>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    connected: AtomicBool,
    media_attached: AtomicBool,
    descriptions: AtomicUsize,
    premature_candidates: AtomicUsize,
    failed_candidates: AtomicUsize,
    closes: AtomicUsize,
}

impl MockPeerTransport {
    fn new(id: usize, sink: PeerEventSink, options: MockPeerOptions) -> Self {
        Self {
            id,
            sink,
            options,
            ops: Mutex::new(Vec::new()),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            media_attached: AtomicBool::new(false),
            descriptions: AtomicUsize::new(0),
            premature_candidates: AtomicUsize::new(0),
            failed_candidates: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn ops(&self) -> Vec<PeerOp> {
        self.ops.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                PeerOp::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Candidates offered before any remote description; always zero when
    /// the caller respects ordering.
    pub fn premature_candidates(&self) -> usize {
        self.premature_candidates.load(Ordering::SeqCst)
    }

    pub fn failed_candidates(&self) -> usize {
        self.failed_candidates.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// Injects a transport event as if the connection produced it.
    pub fn emit(&self, event: PeerEvent) {
        if let PeerEvent::Connectivity(state) = &event {
            self.connected
                .store(*state == Connectivity::Connected, Ordering::SeqCst);
        }
        self.sink.emit(event);
    }

    fn record(&self, op: PeerOp) {
        self.ops.lock().push(op);
    }

    fn maybe_connect(&self) {
        if !self.options.auto_connect
            || !self.has_local.load(Ordering::SeqCst)
            || !self.has_remote.load(Ordering::SeqCst)
        {
            return;
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.emit(PeerEvent::Connectivity(Connectivity::Connected));
        if self.media_attached.load(Ordering::SeqCst) {
            self.sink.emit(PeerEvent::RemoteTrack(MediaKind::Audio));
        }
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        self.record(PeerOp::AttachMedia(media.tracks().len()));
        self.media_attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        self.record(PeerOp::CreateOffer { ice_restart });
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst) + 1;
        let suffix = if ice_restart { "-restart" } else { "" };
        Ok(SessionDescription::offer(format!(
            "mock-offer-{}-{n}{suffix}",
            self.id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(NegotiationError::Description("no remote offer".into()));
        }
        self.record(PeerOp::CreateAnswer);
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::answer(format!(
            "mock-answer-{}-{n}",
            self.id
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.record(PeerOp::SetLocal(desc.kind));
        self.has_local.store(true, Ordering::SeqCst);
        for candidate in &self.options.local_candidates {
            self.sink.emit(PeerEvent::LocalCandidate(candidate.clone()));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if let Some(gate) = &self.options.remote_gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if desc.sdp.contains("invalid") {
            return Err(NegotiationError::Description("unparseable sdp".into()));
        }
        self.record(PeerOp::SetRemote(desc.kind));
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if !self.has_remote.load(Ordering::SeqCst) {
            self.premature_candidates.fetch_add(1, Ordering::SeqCst);
            return Err(NegotiationError::Candidate("no remote description".into()));
        }
        self.record(PeerOp::AddCandidate(candidate.candidate.clone()));
        if candidate.candidate.contains("bad") {
            self.failed_candidates.fetch_add(1, Ordering::SeqCst);
            return Err(NegotiationError::Candidate(candidate.candidate));
        }
        Ok(())
    }

    async fn close(&self) {
        self.record(PeerOp::Close);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockPeerFactory {
    options: MockPeerOptions,
    transports: Mutex<Vec<Arc<MockPeerTransport>>>,
}

impl MockPeerFactory {
    pub fn new(options: MockPeerOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn connecting() -> Arc<Self> {
        Self::new(MockPeerOptions::connecting())
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn transports(&self) -> Vec<Arc<MockPeerTransport>> {
        self.transports.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockPeerTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for MockPeerFactory {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let mut transports = self.transports.lock();
        let transport = Arc::new(MockPeerTransport::new(
            transports.len(),
            events,
            self.options.clone(),
        ));
        transports.push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// In-process stand-in for the relay: routes envelopes between joined
/// participants and silently drops the rest.
#[derive(Default)]
pub struct LocalSwitchboard {
    participants: Mutex<HashMap<ParticipantId, mpsc::UnboundedSender<Envelope>>>,
    sent: Mutex<Vec<Envelope>>,
}

pub struct SwitchboardSink {
    board: Arc<LocalSwitchboard>,
}

impl LocalSwitchboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(
        self: &Arc<Self>,
        participant: impl Into<ParticipantId>,
    ) -> (Arc<dyn SignalSink>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.participants.lock().insert(participant.into(), tx);
        let sink = SwitchboardSink {
            board: Arc::clone(self),
        };
        (Arc::new(sink), rx)
    }

    pub fn leave(&self, participant: &ParticipantId) {
        self.participants.lock().remove(participant);
    }

    /// Every envelope handed to the switchboard, delivered or not.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn sent_of(&self, from: &str, kind: EnvelopeKind) -> Vec<Envelope> {
        self.sent
            .lock()
            .iter()
            .filter(|envelope| envelope.from.as_str() == from && envelope.kind == kind)
            .cloned()
            .collect()
    }

    fn route(&self, envelope: Envelope) {
        self.sent.lock().push(envelope.clone());
        let participants = self.participants.lock();
        match participants.get(&envelope.to) {
            Some(tx) => {
                let _ = tx.send(envelope);
            }
            None => {
                tracing::debug!(
                    target = "relay",
                    to = %envelope.to,
                    kind = %envelope.kind,
                    "dropping envelope for unregistered participant"
                );
            }
        }
    }
}

impl SignalSink for SwitchboardSink {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.board.route(envelope);
        Ok(())
    }
}
