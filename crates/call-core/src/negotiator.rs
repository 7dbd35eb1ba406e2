use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use call_proto::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;

use crate::error::{CallError, NegotiationError};
use crate::media::{LocalMedia, MediaConstraints, MediaKind, MediaSource};
use crate::peer::{PeerEvent, PeerEventSink, PeerTransport, PeerTransportFactory};
use crate::session::Role;

/// Completion of a suspended negotiation step, or an event raised by the
/// transport. Always stamped with the generation of the session that started it.
pub(crate) struct NegotiatorEvent {
    pub(crate) generation: u64,
    pub(crate) kind: NegotiatorEventKind,
}

pub(crate) enum NegotiatorEventKind {
    Prepared(Result<PreparedPeer, CallError>),
    LocalDescription {
        round: u32,
        result: Result<SessionDescription, NegotiationError>,
    },
    RemoteApplied {
        round: u32,
        result: Result<(), NegotiationError>,
    },
    Peer(PeerEvent),
}

impl NegotiatorEvent {
    /// Drops the event, releasing anything it owns.
    pub(crate) fn release(self) {
        if let NegotiatorEventKind::Prepared(Ok(peer)) = self.kind {
            peer.release();
        }
    }
}

pub(crate) struct PreparedPeer {
    media: LocalMedia,
    transport: Arc<dyn PeerTransport>,
}

impl PreparedPeer {
    pub(crate) fn release(self) {
        self.media.stop();
        let transport = self.transport;
        tokio::spawn(async move {
            transport.close().await;
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Handed to the transport's candidate lane
    Applied,
    /// Held until a remote description is set
    Queued,
}

enum TransportPhase {
    Idle,
    Preparing,
    Ready {
        transport: Arc<dyn PeerTransport>,
        media: LocalMedia,
        lane: mpsc::UnboundedSender<IceCandidate>,
    },
    Closed,
}

/// Drives one peer transport through offer/answer/candidate exchange.
///
/// Every suspending step runs on a spawned task and reports back through the
/// controller's event channel; the negotiator itself is only mutated by the
/// controller task. Invariants kept here:
/// - a remote candidate reaches the transport only after a remote description
///   has been applied, and in arrival order;
/// - only the initiator creates offers, only the responder creates answers;
/// - the transport is built at most once.
pub struct SessionNegotiator {
    role: Role,
    generation: u64,
    epoch: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    media_source: Arc<dyn MediaSource>,
    transports: Arc<dyn PeerTransportFactory>,
    constraints: MediaConstraints,
    phase: TransportPhase,
    round: u32,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_in_flight: Option<(u32, SessionDescription)>,
    /// Remote description in force before the in-flight one; restored if it fails
    previous_remote: Option<SessionDescription>,
    audio_enabled: bool,
    video_enabled: bool,
    pending_remote_candidates: VecDeque<IceCandidate>,
    pending_local_candidates: Vec<IceCandidate>,
    local_sent: bool,
}

impl SessionNegotiator {
    pub(crate) fn new(
        role: Role,
        generation: u64,
        epoch: Arc<AtomicU64>,
        events: mpsc::UnboundedSender<NegotiatorEvent>,
        media_source: Arc<dyn MediaSource>,
        transports: Arc<dyn PeerTransportFactory>,
        constraints: MediaConstraints,
    ) -> Self {
        Self {
            role,
            generation,
            epoch,
            events,
            media_source,
            transports,
            constraints,
            phase: TransportPhase::Idle,
            round: 0,
            local_description: None,
            remote_description: None,
            remote_in_flight: None,
            previous_remote: None,
            audio_enabled: true,
            video_enabled: true,
            pending_remote_candidates: VecDeque::new(),
            pending_local_candidates: Vec::new(),
            local_sent: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.generation
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.phase, TransportPhase::Ready { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, TransportPhase::Closed)
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_remote_candidates(&self) -> impl Iterator<Item = &IceCandidate> {
        self.pending_remote_candidates.iter()
    }

    fn transport(&self) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        match &self.phase {
            TransportPhase::Ready { transport, .. } => Ok(Arc::clone(transport)),
            TransportPhase::Closed => Err(NegotiationError::Closed),
            TransportPhase::Idle | TransportPhase::Preparing => Err(NegotiationError::NotReady),
        }
    }

    /// Acquires local media and builds the transport. Returns `false` when a
    /// preparation is already running or finished, so racing triggers
    /// collapse into one construction.
    pub(crate) fn prepare(&mut self) -> bool {
        if !matches!(self.phase, TransportPhase::Idle) {
            tracing::debug!(
                target = "negotiator",
                generation = self.generation,
                "peer transport already prepared or preparing"
            );
            return false;
        }
        self.phase = TransportPhase::Preparing;

        let generation = self.generation;
        let epoch = Arc::clone(&self.epoch);
        let events = self.events.clone();
        let source = Arc::clone(&self.media_source);
        let factory = Arc::clone(&self.transports);
        let constraints = self.constraints;
        let sink = PeerEventSink::new(generation, self.events.clone());
        tokio::spawn(async move {
            let result = prepare_peer(source, factory, constraints, sink, &epoch, generation).await;
            let event = NegotiatorEvent {
                generation,
                kind: NegotiatorEventKind::Prepared(result),
            };
            if let Err(mpsc::error::SendError(event)) = events.send(event) {
                event.release();
            }
        });
        true
    }

    pub(crate) fn on_prepared(&mut self, peer: PreparedPeer) {
        if !matches!(self.phase, TransportPhase::Preparing) {
            tracing::debug!(
                target = "negotiator",
                generation = self.generation,
                "discarding transport prepared after close"
            );
            peer.release();
            return;
        }
        let lane = spawn_candidate_lane(
            Arc::clone(&peer.transport),
            Arc::clone(&self.epoch),
            self.generation,
        );
        peer.media.set_enabled(MediaKind::Audio, self.audio_enabled);
        peer.media.set_enabled(MediaKind::Video, self.video_enabled);
        self.phase = TransportPhase::Ready {
            transport: peer.transport,
            media: peer.media,
            lane,
        };
        tracing::debug!(
            target = "negotiator",
            generation = self.generation,
            role = ?self.role,
            "peer transport ready"
        );
    }

    pub(crate) fn on_prepare_failed(&mut self) {
        if matches!(self.phase, TransportPhase::Preparing) {
            self.phase = TransportPhase::Idle;
        }
    }

    /// Starts an offer round. Initiator only; an ICE restart round forgets the
    /// previous remote description so candidates queue until the new answer lands.
    pub(crate) fn start_offer(&mut self, ice_restart: bool) -> Result<u32, NegotiationError> {
        if self.role != Role::Initiator {
            return Err(NegotiationError::RoleViolation(
                "responder never creates offers".into(),
            ));
        }
        let transport = self.transport()?;
        self.round += 1;
        self.local_sent = false;
        if ice_restart {
            self.remote_description = None;
            self.remote_in_flight = None;
            self.previous_remote = None;
        }
        let round = self.round;
        tracing::debug!(
            target = "negotiator",
            generation = self.generation,
            round,
            ice_restart,
            "creating offer"
        );
        self.spawn_local_round(round, async move {
            let offer = transport.create_offer(ice_restart).await?;
            transport.set_local_description(offer.clone()).await?;
            Ok(offer)
        });
        Ok(round)
    }

    /// Answers the current remote offer. Responder only.
    pub(crate) fn start_answer(&mut self) -> Result<u32, NegotiationError> {
        if self.role != Role::Responder {
            return Err(NegotiationError::RoleViolation(
                "initiator never creates answers".into(),
            ));
        }
        if self.remote_description.is_none() {
            return Err(NegotiationError::NotReady);
        }
        let transport = self.transport()?;
        self.local_sent = false;
        let round = self.round;
        tracing::debug!(
            target = "negotiator",
            generation = self.generation,
            round,
            "creating answer"
        );
        self.spawn_local_round(round, async move {
            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            Ok(answer)
        });
        Ok(round)
    }

    fn spawn_local_round<F>(&self, round: u32, step: F)
    where
        F: std::future::Future<Output = Result<SessionDescription, NegotiationError>>
            + Send
            + 'static,
    {
        let generation = self.generation;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = step.await;
            let _ = events.send(NegotiatorEvent {
                generation,
                kind: NegotiatorEventKind::LocalDescription { round, result },
            });
        });
    }

    /// Applies a description received from the peer. The initiator accepts
    /// answers, the responder accepts offers; a responder offer opens a new round.
    pub(crate) fn apply_remote(&mut self, desc: SessionDescription) -> Result<u32, NegotiationError> {
        let expected = match self.role {
            Role::Initiator => SdpKind::Answer,
            Role::Responder => SdpKind::Offer,
        };
        if desc.kind != expected {
            return Err(NegotiationError::RoleViolation(format!(
                "{:?} cannot apply a remote {:?}",
                self.role, desc.kind
            )));
        }
        let transport = self.transport()?;
        if self.role == Role::Responder {
            self.round += 1;
        }
        let round = self.round;
        self.previous_remote = self.remote_description.take();
        self.remote_in_flight = Some((round, desc.clone()));

        let generation = self.generation;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = transport.set_remote_description(desc).await;
            let _ = events.send(NegotiatorEvent {
                generation,
                kind: NegotiatorEventKind::RemoteApplied { round, result },
            });
        });
        Ok(round)
    }

    /// Records a successfully applied remote description and drains the
    /// candidate queue in arrival order. `None` when the round is stale.
    pub(crate) fn on_remote_applied(&mut self, round: u32) -> Option<usize> {
        match self.remote_in_flight.take() {
            Some((in_flight, desc)) if in_flight == round => {
                self.remote_description = Some(desc);
                self.previous_remote = None;
                Some(self.drain_pending_candidates())
            }
            other => {
                self.remote_in_flight = other;
                None
            }
        }
    }

    /// Returns whether the failed round was the current one. The remote
    /// description that was in force before it comes back, and candidates
    /// queued meanwhile are handed to the transport against it.
    pub(crate) fn on_remote_failed(&mut self, round: u32) -> bool {
        match self.remote_in_flight {
            Some((in_flight, _)) if in_flight == round => {
                self.remote_in_flight = None;
                self.remote_description = self.previous_remote.take();
                if self.remote_description.is_some() {
                    self.drain_pending_candidates();
                }
                true
            }
            _ => false,
        }
    }

    /// Enables or disables the local tracks of `kind`. The choice is kept
    /// and applied to media acquired later. Returns the tracks changed now.
    pub(crate) fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) -> usize {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
        match &self.phase {
            TransportPhase::Ready { media, .. } => media.set_enabled(kind, enabled),
            _ => 0,
        }
    }

    pub fn is_media_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }

    /// Stores the local description of `round`; `false` when the round was superseded.
    pub(crate) fn on_local_description(&mut self, round: u32, desc: SessionDescription) -> bool {
        if round != self.round {
            return false;
        }
        self.local_description = Some(desc);
        true
    }

    fn drain_pending_candidates(&mut self) -> usize {
        let TransportPhase::Ready { lane, .. } = &self.phase else {
            return 0;
        };
        let mut drained = 0;
        while let Some(candidate) = self.pending_remote_candidates.pop_front() {
            if lane.send(candidate).is_err() {
                break;
            }
            drained += 1;
        }
        drained
    }

    pub(crate) fn add_remote_candidate(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        if self.remote_description.is_some() {
            if let TransportPhase::Ready { lane, .. } = &self.phase {
                if lane.send(candidate.clone()).is_ok() {
                    return CandidateDisposition::Applied;
                }
            }
        }
        self.pending_remote_candidates.push_back(candidate);
        CandidateDisposition::Queued
    }

    /// Local candidates wait until this round's description reached the peer.
    pub(crate) fn note_local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.local_sent {
            Some(candidate)
        } else {
            self.pending_local_candidates.push(candidate);
            None
        }
    }

    pub(crate) fn mark_local_sent(&mut self) -> Vec<IceCandidate> {
        self.local_sent = true;
        std::mem::take(&mut self.pending_local_candidates)
    }

    /// Stops local media and closes the transport. Returns `false` if the
    /// negotiator was already closed.
    pub(crate) fn close(&mut self) -> bool {
        let phase = std::mem::replace(&mut self.phase, TransportPhase::Closed);
        self.pending_remote_candidates.clear();
        self.pending_local_candidates.clear();
        self.remote_in_flight = None;
        self.previous_remote = None;
        match phase {
            TransportPhase::Closed => false,
            TransportPhase::Ready {
                transport, media, ..
            } => {
                media.stop();
                tokio::spawn(async move {
                    transport.close().await;
                });
                tracing::debug!(
                    target = "negotiator",
                    generation = self.generation,
                    "peer transport closed"
                );
                true
            }
            TransportPhase::Idle | TransportPhase::Preparing => true,
        }
    }
}

impl Drop for SessionNegotiator {
    fn drop(&mut self) {
        let phase = std::mem::replace(&mut self.phase, TransportPhase::Closed);
        if let TransportPhase::Ready {
            transport, media, ..
        } = phase
        {
            media.stop();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    transport.close().await;
                });
            }
        }
    }
}

async fn prepare_peer(
    source: Arc<dyn MediaSource>,
    factory: Arc<dyn PeerTransportFactory>,
    constraints: MediaConstraints,
    sink: PeerEventSink,
    epoch: &AtomicU64,
    generation: u64,
) -> Result<PreparedPeer, CallError> {
    let media = source.acquire(constraints).await?;
    if epoch.load(Ordering::SeqCst) != generation {
        tracing::debug!(
            target = "negotiator",
            generation,
            "session ended during media acquisition; releasing devices"
        );
        media.stop();
        return Err(NegotiationError::Closed.into());
    }
    let transport = match factory.create(sink).await {
        Ok(transport) => transport,
        Err(err) => {
            media.stop();
            return Err(err.into());
        }
    };
    if let Err(err) = transport.attach_media(&media).await {
        media.stop();
        transport.close().await;
        return Err(err.into());
    }
    Ok(PreparedPeer { media, transport })
}

/// Applies remote candidates one at a time, in the order they were handed over.
fn spawn_candidate_lane(
    transport: Arc<dyn PeerTransport>,
    epoch: Arc<AtomicU64>,
    generation: u64,
) -> mpsc::UnboundedSender<IceCandidate> {
    let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();
    tokio::spawn(async move {
        while let Some(candidate) = rx.recv().await {
            if epoch.load(Ordering::SeqCst) != generation {
                break;
            }
            match transport.add_ice_candidate(candidate.clone()).await {
                Ok(()) => tracing::trace!(
                    target = "negotiator",
                    generation,
                    candidate = %candidate.candidate,
                    "applied remote candidate"
                ),
                Err(err) => tracing::warn!(
                    target = "negotiator",
                    generation,
                    candidate = %candidate.candidate,
                    error = %err,
                    "skipping remote candidate"
                ),
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockMediaSource, MockPeerFactory, MockPeerOptions, PeerOp};
    use std::time::Duration;

    struct Harness {
        negotiator: SessionNegotiator,
        events: mpsc::UnboundedReceiver<NegotiatorEvent>,
        epoch: Arc<AtomicU64>,
        factory: Arc<MockPeerFactory>,
        media: Arc<MockMediaSource>,
    }

    fn harness(role: Role, options: MockPeerOptions) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(1));
        let factory = MockPeerFactory::new(options);
        let media = MockMediaSource::granting();
        let negotiator = SessionNegotiator::new(
            role,
            1,
            Arc::clone(&epoch),
            tx,
            media.clone(),
            factory.clone(),
            MediaConstraints::default(),
        );
        Harness {
            negotiator,
            events: rx,
            epoch,
            factory,
            media,
        }
    }

    impl Harness {
        async fn next(&mut self) -> NegotiatorEventKind {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("negotiator event in time")
                .expect("event channel open")
                .kind
        }

        async fn make_ready(&mut self) {
            assert!(self.negotiator.prepare());
            self.finish_prepare().await;
        }

        async fn finish_prepare(&mut self) {
            match self.next().await {
                NegotiatorEventKind::Prepared(Ok(peer)) => self.negotiator.on_prepared(peer),
                _ => panic!("expected prepared peer"),
            }
        }

        async fn wait_remote_applied(&mut self) -> usize {
            loop {
                if let NegotiatorEventKind::RemoteApplied { round, result } = self.next().await {
                    result.expect("remote applied");
                    return self
                        .negotiator
                        .on_remote_applied(round)
                        .expect("current round");
                }
            }
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn prepare_runs_once_under_racing_triggers() {
        let mut h = harness(Role::Responder, MockPeerOptions::default());
        assert!(h.negotiator.prepare());
        assert!(!h.negotiator.prepare());
        h.finish_prepare().await;
        assert!(!h.negotiator.prepare());
        assert!(h.negotiator.is_current());
        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.media.requests(), 1);
        h.epoch.fetch_add(1, Ordering::SeqCst);
        assert!(!h.negotiator.is_current());
    }

    #[tokio::test]
    async fn candidates_queue_until_remote_description_then_drain_in_order() {
        let mut h = harness(Role::Initiator, MockPeerOptions::default());
        h.make_ready().await;

        for n in 1..=3 {
            let disposition = h
                .negotiator
                .add_remote_candidate(IceCandidate::new(format!("cand-{n}")));
            assert_eq!(disposition, CandidateDisposition::Queued);
        }
        assert_eq!(h.negotiator.pending_remote_candidates().count(), 3);

        h.negotiator
            .apply_remote(SessionDescription::answer("remote"))
            .expect("apply answer");
        // still in flight: a fourth candidate must queue behind the first three
        assert_eq!(
            h.negotiator
                .add_remote_candidate(IceCandidate::new("cand-4")),
            CandidateDisposition::Queued
        );

        let drained = h.wait_remote_applied().await;
        assert_eq!(drained, 4);
        assert_eq!(
            h.negotiator
                .add_remote_candidate(IceCandidate::new("cand-5")),
            CandidateDisposition::Applied
        );
        settle().await;

        let transport = h.factory.last().expect("transport");
        assert_eq!(
            transport.applied_candidates(),
            vec!["cand-1", "cand-2", "cand-3", "cand-4", "cand-5"]
        );
        assert_eq!(transport.premature_candidates(), 0);
        let ops = transport.ops();
        let remote_at = ops
            .iter()
            .position(|op| matches!(op, PeerOp::SetRemote(_)))
            .expect("remote set");
        let first_candidate = ops
            .iter()
            .position(|op| matches!(op, PeerOp::AddCandidate(_)))
            .expect("candidate applied");
        assert!(remote_at < first_candidate);
    }

    #[tokio::test]
    async fn failing_candidate_is_skipped_not_fatal() {
        let mut h = harness(Role::Responder, MockPeerOptions::default());
        h.make_ready().await;
        h.negotiator
            .add_remote_candidate(IceCandidate::new("bad-candidate"));
        h.negotiator
            .add_remote_candidate(IceCandidate::new("good-candidate"));
        h.negotiator
            .apply_remote(SessionDescription::offer("remote"))
            .expect("apply offer");
        assert_eq!(h.wait_remote_applied().await, 2);
        settle().await;
        let transport = h.factory.last().expect("transport");
        assert_eq!(transport.applied_candidates(), vec!["bad-candidate", "good-candidate"]);
        assert_eq!(transport.failed_candidates(), 1);
    }

    #[tokio::test]
    async fn roles_are_enforced() {
        let mut responder = harness(Role::Responder, MockPeerOptions::default());
        responder.make_ready().await;
        assert!(matches!(
            responder.negotiator.start_offer(false),
            Err(NegotiationError::RoleViolation(_))
        ));
        assert!(matches!(
            responder
                .negotiator
                .apply_remote(SessionDescription::answer("x")),
            Err(NegotiationError::RoleViolation(_))
        ));

        let mut initiator = harness(Role::Initiator, MockPeerOptions::default());
        initiator.make_ready().await;
        assert!(matches!(
            initiator.negotiator.start_answer(),
            Err(NegotiationError::RoleViolation(_))
        ));
        assert!(matches!(
            initiator
                .negotiator
                .apply_remote(SessionDescription::offer("x")),
            Err(NegotiationError::RoleViolation(_))
        ));
    }

    #[tokio::test]
    async fn ice_restart_replaces_local_description_and_requeues_candidates() {
        let mut h = harness(Role::Initiator, MockPeerOptions::default());
        h.make_ready().await;

        let first = h.negotiator.start_offer(false).expect("offer");
        let NegotiatorEventKind::LocalDescription { round, result } = h.next().await else {
            panic!("expected local description");
        };
        assert_eq!(round, first);
        assert!(h.negotiator.on_local_description(round, result.expect("offer")));
        h.negotiator
            .apply_remote(SessionDescription::answer("answer-1"))
            .expect("answer");
        h.wait_remote_applied().await;
        assert!(h.negotiator.remote_description().is_some());

        let second = h.negotiator.start_offer(true).expect("restart");
        assert_eq!(second, first + 1);
        assert!(h.negotiator.remote_description().is_none());
        assert_eq!(
            h.negotiator
                .add_remote_candidate(IceCandidate::new("after-restart")),
            CandidateDisposition::Queued
        );
        let NegotiatorEventKind::LocalDescription { round, result } = h.next().await else {
            panic!("expected restart offer");
        };
        let offer = result.expect("restart offer");
        assert!(offer.sdp.ends_with("-restart"));
        // a late completion from the first round is ignored
        assert!(!h.negotiator.on_local_description(first, SessionDescription::offer("late")));
        assert!(h.negotiator.on_local_description(round, offer.clone()));
        assert_eq!(h.negotiator.local_description(), Some(&offer));
    }

    #[tokio::test]
    async fn failed_remote_round_keeps_previous_description_and_candidates_flowing() {
        let mut h = harness(Role::Initiator, MockPeerOptions::default());
        h.make_ready().await;
        let first = SessionDescription::answer("answer-1");
        h.negotiator.apply_remote(first.clone()).expect("answer");
        h.wait_remote_applied().await;

        h.negotiator
            .apply_remote(SessionDescription::answer("invalid answer"))
            .expect("second answer in flight");
        assert_eq!(
            h.negotiator
                .add_remote_candidate(IceCandidate::new("during-failed-round")),
            CandidateDisposition::Queued
        );
        let NegotiatorEventKind::RemoteApplied { round, result } = h.next().await else {
            panic!("expected remote completion");
        };
        assert!(result.is_err());
        assert!(h.negotiator.on_remote_failed(round));
        assert_eq!(h.negotiator.remote_description(), Some(&first));
        assert_eq!(h.negotiator.pending_remote_candidates().count(), 0);
        assert_eq!(
            h.negotiator
                .add_remote_candidate(IceCandidate::new("after-failed-round")),
            CandidateDisposition::Applied
        );
        settle().await;
        let transport = h.factory.last().expect("transport");
        assert_eq!(
            transport.applied_candidates(),
            vec!["during-failed-round", "after-failed-round"]
        );
    }

    #[tokio::test]
    async fn media_preference_applies_before_and_after_preparation() {
        let mut h = harness(Role::Responder, MockPeerOptions::default());
        assert_eq!(h.negotiator.set_media_enabled(MediaKind::Video, false), 0);
        h.make_ready().await;
        let media = h.media.acquired().pop().expect("acquired media");
        assert_eq!(media.is_enabled(MediaKind::Video), Some(false));
        assert_eq!(media.is_enabled(MediaKind::Audio), Some(true));

        assert_eq!(h.negotiator.set_media_enabled(MediaKind::Audio, false), 1);
        assert_eq!(media.is_enabled(MediaKind::Audio), Some(false));
        assert!(!h.negotiator.is_media_enabled(MediaKind::Audio));
    }

    #[tokio::test]
    async fn local_candidates_wait_for_description_to_be_sent() {
        let mut h = harness(Role::Initiator, MockPeerOptions::default());
        h.make_ready().await;
        h.negotiator.start_offer(false).expect("offer");
        assert!(h
            .negotiator
            .note_local_candidate(IceCandidate::new("early"))
            .is_none());
        let flushed = h.negotiator.mark_local_sent();
        assert_eq!(flushed, vec![IceCandidate::new("early")]);
        assert_eq!(
            h.negotiator.note_local_candidate(IceCandidate::new("late")),
            Some(IceCandidate::new("late"))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_media() {
        let mut h = harness(Role::Initiator, MockPeerOptions::default());
        h.make_ready().await;
        assert!(h.negotiator.close());
        assert!(!h.negotiator.close());
        settle().await;
        let transport = h.factory.last().expect("transport");
        assert_eq!(transport.close_count(), 1);
        assert!(h.media.acquired().iter().all(|media| media.is_stopped()));
        assert!(matches!(
            h.negotiator.start_offer(false),
            Err(NegotiationError::Closed)
        ));
    }

    #[tokio::test]
    async fn superseded_preparation_releases_media_without_building_transport() {
        let (media, gate) = MockMediaSource::gated();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(7));
        let factory = MockPeerFactory::new(MockPeerOptions::default());
        let mut negotiator = SessionNegotiator::new(
            Role::Responder,
            7,
            Arc::clone(&epoch),
            tx,
            media.clone(),
            factory.clone(),
            MediaConstraints::default(),
        );
        assert!(negotiator.prepare());
        settle().await;
        epoch.fetch_add(1, Ordering::SeqCst);
        assert!(!negotiator.is_current());
        gate.release();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert!(matches!(
            event.kind,
            NegotiatorEventKind::Prepared(Err(CallError::Negotiation(NegotiationError::Closed)))
        ));
        assert_eq!(factory.created(), 0);
        assert!(media.acquired().iter().all(|m| m.is_stopped()));
        assert!(!media.acquired().is_empty());
    }
}
