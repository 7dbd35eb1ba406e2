use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use call_proto::{CallId, CallSignal, Envelope, IceCandidate, ParticipantId, SessionDescription};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CallConfig;
use crate::error::{CallError, NegotiationError, SignalingError};
use crate::media::{MediaKind, MediaSource};
use crate::negotiator::{NegotiatorEvent, NegotiatorEventKind, PreparedPeer, SessionNegotiator};
use crate::peer::{Connectivity, PeerEvent, PeerTransportFactory};
use crate::session::{CallSession, Role};
use crate::signaling::SignalSink;
use crate::state::{CallState, Direction, EndReason};

const EVENT_CAPACITY: usize = 64;
/// Ended calls remembered so late invites for them are not rung again.
const RECENTLY_ENDED_CAPACITY: usize = 32;

/// Observable output of a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        call_id: CallId,
        from: CallState,
        to: CallState,
    },
    RemoteMediaAvailable {
        call_id: CallId,
        kind: MediaKind,
    },
    LocalMediaChanged {
        call_id: CallId,
        kind: MediaKind,
        enabled: bool,
    },
    Error {
        call_id: Option<CallId>,
        error: CallError,
    },
}

/// Collaborators a controller needs. `inbound` carries envelopes addressed
/// to this participant, typically from [`crate::signaling::SignalingClient`].
pub struct CallDeps {
    pub signals: Arc<dyn SignalSink>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
    pub media: Arc<dyn MediaSource>,
    pub transports: Arc<dyn PeerTransportFactory>,
}

enum Command {
    Initiate(ParticipantId),
    Accept,
    Reject,
    /// Carries the state the caller saw, so a call that started ringing after
    /// the user pressed hang-up is left alone.
    HangUp { observed: CallState },
    Retry,
    SetMediaEnabled { kind: MediaKind, enabled: bool },
    Shutdown(oneshot::Sender<()>),
}

/// Handle to one participant's call state machine.
///
/// All state lives on a single task; the methods here only enqueue commands,
/// so they never block on media acquisition or negotiation. Outcomes
/// (including refusals of illegal commands) arrive on [`CallController::subscribe`].
pub struct CallController {
    participant: ParticipantId,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CallEvent>,
    state: watch::Receiver<CallState>,
    epoch: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl CallController {
    pub fn spawn(participant: ParticipantId, config: CallConfig, deps: CallDeps) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (negotiator_tx, negotiator_rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));

        let actor = ControllerTask {
            participant: participant.clone(),
            config,
            signals: deps.signals,
            media: deps.media,
            transports: deps.transports,
            epoch: Arc::clone(&epoch),
            events: events_tx.clone(),
            state_tx,
            negotiator_tx,
            session: None,
            last_outgoing: None,
            recently_ended: VecDeque::with_capacity(RECENTLY_ENDED_CAPACITY),
        };
        let task = tokio::spawn(actor.run(commands_rx, deps.inbound, negotiator_rx));

        Self {
            participant,
            commands: commands_tx,
            events: events_tx,
            state: state_rx,
            epoch,
            task,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn initiate_call(&self, peer: impl Into<ParticipantId>) -> Result<(), CallError> {
        self.send(Command::Initiate(peer.into()))
    }

    pub fn accept_incoming(&self) -> Result<(), CallError> {
        self.send(Command::Accept)
    }

    pub fn reject_incoming(&self) -> Result<(), CallError> {
        self.send(Command::Reject)
    }

    /// Ends the current call. Any negotiation step still in flight is
    /// invalidated immediately, before the controller task sees the command.
    pub fn hang_up(&self) -> Result<(), CallError> {
        let observed = self.state();
        if observed.is_live() {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.send(Command::HangUp { observed })
    }

    /// Mutes or unmutes the microphone of the current call.
    pub fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(Command::SetMediaEnabled {
            kind: MediaKind::Audio,
            enabled,
        })
    }

    /// Turns the camera of the current call off or back on.
    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(Command::SetMediaEnabled {
            kind: MediaKind::Video,
            enabled,
        })
    }

    /// Places the last outgoing call again after a retryable failure.
    pub fn retry(&self) -> Result<(), CallError> {
        self.send(Command::Retry)
    }

    /// Hangs up any live call and waits for the controller task to exit.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .map_err(|_| CallError::ControllerClosed)
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct RetryTarget {
    peer: ParticipantId,
    reason: EndReason,
}

enum PeerNotice {
    Silent,
    End,
    Reject,
}

struct ControllerTask {
    participant: ParticipantId,
    config: CallConfig,
    signals: Arc<dyn SignalSink>,
    media: Arc<dyn MediaSource>,
    transports: Arc<dyn PeerTransportFactory>,
    epoch: Arc<AtomicU64>,
    events: broadcast::Sender<CallEvent>,
    state_tx: watch::Sender<CallState>,
    negotiator_tx: mpsc::UnboundedSender<NegotiatorEvent>,
    session: Option<CallSession>,
    last_outgoing: Option<RetryTarget>,
    recently_ended: VecDeque<(ParticipantId, CallId)>,
}

impl ControllerTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut negotiator_rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
    ) {
        tracing::debug!(target = "call", participant = %self.participant, "call controller started");
        loop {
            let deadline = self.session.as_ref().and_then(|session| session.deadline);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.hang_up();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.hang_up();
                        break;
                    }
                },
                Some(envelope) = inbound.recv() => self.handle_envelope(envelope),
                Some(event) = negotiator_rx.recv() => self.handle_negotiator_event(event),
                _ = wait_until(deadline) => self.handle_deadline(),
            }
        }
        tracing::debug!(target = "call", participant = %self.participant, "call controller stopped");
    }

    // ---- commands ----

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate(peer) => self.initiate(peer),
            Command::Accept => self.accept(),
            Command::Reject => self.reject(),
            Command::HangUp { observed } => self.hang_up_observed(&observed),
            Command::Retry => self.retry(),
            Command::SetMediaEnabled { kind, enabled } => self.set_media_enabled(kind, enabled),
            Command::Shutdown(_) => {}
        }
    }

    fn initiate(&mut self, peer: ParticipantId) {
        if let Some(session) = &self.session {
            let state = session.state.clone();
            self.refuse("initiate_call", &state);
            return;
        }
        if peer == self.participant {
            self.emit_error(None, CallError::SelfCall);
            return;
        }

        let generation = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let negotiator = self.new_negotiator(Role::Initiator, generation);
        let call_id = CallId::generate();
        tracing::info!(
            target = "call",
            call_id = %call_id,
            peer = %peer,
            "placing call"
        );
        self.last_outgoing = None;
        self.session = Some(CallSession::outgoing(
            call_id,
            self.participant.clone(),
            peer,
            negotiator,
        ));
        self.transition(CallState::Ringing(Direction::Outgoing));
        if let Some(session) = self.session.as_mut() {
            session.negotiator.prepare();
        }
    }

    fn accept(&mut self) {
        let state = self.current_state();
        if state != CallState::Ringing(Direction::Incoming) {
            self.refuse("accept_incoming", &state);
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.deadline = Some(Instant::now() + self.config.connect_timeout);
        }
        self.transition(CallState::Negotiating);
        if let Some(session) = self.session.as_mut() {
            session.negotiator.prepare();
        }
    }

    fn reject(&mut self) {
        let state = self.current_state();
        if state != CallState::Ringing(Direction::Incoming) {
            self.refuse("reject_incoming", &state);
            return;
        }
        self.end_session(EndReason::LocalReject, PeerNotice::Reject);
    }

    fn hang_up_observed(&mut self, observed: &CallState) {
        let unseen_incoming = !observed.is_live()
            && self
                .session
                .as_ref()
                .is_some_and(|session| session.state == CallState::Ringing(Direction::Incoming));
        if unseen_incoming {
            tracing::debug!(
                target = "call",
                "hang_up predates the incoming call; leaving it ringing"
            );
            return;
        }
        self.hang_up();
    }

    fn hang_up(&mut self) {
        let Some(session) = &self.session else {
            tracing::debug!(target = "call", "hang_up with no call in progress");
            return;
        };
        let notice = if session.peer_aware {
            PeerNotice::End
        } else {
            PeerNotice::Silent
        };
        self.end_session(EndReason::LocalHangup, notice);
    }

    fn retry(&mut self) {
        if let Some(session) = &self.session {
            let state = session.state.clone();
            self.refuse("retry", &state);
            return;
        }
        match self.last_outgoing.take() {
            Some(target) if target.reason.is_retryable() => {
                tracing::info!(
                    target = "call",
                    peer = %target.peer,
                    previous = ?target.reason,
                    "retrying call"
                );
                self.initiate(target.peer);
            }
            other => {
                self.last_outgoing = other;
                self.emit_error(None, CallError::NothingToRetry);
            }
        }
    }

    fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) {
        let operation = match kind {
            MediaKind::Audio => "set_audio_enabled",
            MediaKind::Video => "set_video_enabled",
        };
        let state = self.current_state();
        if !matches!(state, CallState::Negotiating | CallState::Active) {
            self.refuse(operation, &state);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let tracks = session.negotiator.set_media_enabled(kind, enabled);
        let call_id = session.call_id().clone();
        tracing::info!(
            target = "call",
            call_id = %call_id,
            %kind,
            enabled,
            tracks,
            "local media toggled"
        );
        let _ = self.events.send(CallEvent::LocalMediaChanged {
            call_id,
            kind,
            enabled,
        });
    }

    // ---- inbound signals ----

    fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.to != self.participant {
            tracing::warn!(
                target = "call",
                to = %envelope.to,
                from = %envelope.from,
                "dropping envelope addressed to another participant"
            );
            return;
        }
        let signal = match CallSignal::from_envelope(&envelope) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(
                    target = "call",
                    from = %envelope.from,
                    kind = %envelope.kind,
                    error = %err,
                    "malformed signal"
                );
                let call_id = self.session.as_ref().map(|s| s.call_id().clone());
                self.emit_error(
                    call_id,
                    CallError::MalformedSignal {
                        from: envelope.from.to_string(),
                        message: err.to_string(),
                    },
                );
                return;
            }
        };
        let from = envelope.from;
        tracing::debug!(
            target = "call",
            from = %from,
            kind = %signal.kind(),
            call_id = %signal.call_id(),
            "signal received"
        );
        match signal {
            CallSignal::Invite {
                call_id,
                round,
                offer,
            } => self.on_invite(from, call_id, round, offer),
            CallSignal::Answer {
                call_id,
                round,
                answer,
            } => self.on_answer(&from, &call_id, round, answer),
            CallSignal::Candidate {
                call_id,
                candidate,
            } => self.on_remote_candidate(&from, &call_id, candidate),
            CallSignal::Reject { call_id } => {
                if self.session_matches(&from, &call_id) {
                    self.end_session(EndReason::PeerRejected, PeerNotice::Silent);
                }
            }
            CallSignal::End { call_id } => {
                if self.session_matches(&from, &call_id) {
                    self.end_session(EndReason::PeerEnded, PeerNotice::Silent);
                }
            }
        }
    }

    fn session_matches(&self, from: &ParticipantId, call_id: &CallId) -> bool {
        let matched = self
            .session
            .as_ref()
            .is_some_and(|session| session.matches(from, call_id));
        if !matched {
            tracing::debug!(
                target = "call",
                from = %from,
                call_id = %call_id,
                "ignoring signal for another call"
            );
        }
        matched
    }

    fn on_invite(
        &mut self,
        from: ParticipantId,
        call_id: CallId,
        round: u32,
        offer: SessionDescription,
    ) {
        let live = self
            .session
            .as_ref()
            .is_some_and(|session| session.matches(&from, &call_id));
        if !live && self.recently_ended.contains(&(from.clone(), call_id.clone())) {
            tracing::info!(
                target = "call",
                call_id = %call_id,
                from = %from,
                round,
                "invite for a call that already ended; telling the caller"
            );
            send_signal(
                self.signals.as_ref(),
                &self.events,
                &self.participant,
                &from,
                CallSignal::End { call_id },
            );
            return;
        }
        if self.session.is_none() {
            self.ring_incoming(from, call_id, round, offer);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if !session.matches(&from, &call_id) {
            tracing::info!(
                target = "call",
                call_id = %call_id,
                from = %from,
                "busy; rejecting second call"
            );
            send_signal(
                self.signals.as_ref(),
                &self.events,
                &self.participant,
                &from,
                CallSignal::Reject { call_id },
            );
            return;
        }
        if session.role() != Role::Responder {
            tracing::warn!(
                target = "call",
                call_id = %call_id,
                "ignoring offer for a call we initiated"
            );
            return;
        }

        if round <= session.offer_round {
            tracing::debug!(
                target = "call",
                call_id = %call_id,
                round,
                current = session.offer_round,
                "ignoring stale invite"
            );
            return;
        }

        match session.state {
            CallState::Ringing(Direction::Incoming) => {
                session.offer_round = round;
                session.stored_offer = Some(offer);
            }
            CallState::Negotiating | CallState::Active => {
                session.offer_round = round;
                if !session.negotiator.is_ready() {
                    session.stored_offer = Some(offer);
                    return;
                }
                tracing::info!(
                    target = "call",
                    call_id = %call_id,
                    "renegotiation offer received"
                );
                session.deadline = Some(Instant::now() + self.config.connect_timeout);
                if let Err(err) = session.negotiator.apply_remote(offer) {
                    self.negotiation_failed(err, false);
                }
            }
            _ => {}
        }
    }

    fn ring_incoming(
        &mut self,
        from: ParticipantId,
        call_id: CallId,
        round: u32,
        offer: SessionDescription,
    ) {
        let generation = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let negotiator = self.new_negotiator(Role::Responder, generation);
        tracing::info!(
            target = "call",
            call_id = %call_id,
            from = %from,
            "incoming call"
        );
        let mut session = CallSession::incoming(
            call_id,
            self.participant.clone(),
            from,
            round,
            offer,
            negotiator,
        );
        session.deadline = Some(Instant::now() + self.config.ring_timeout);
        self.session = Some(session);
        self.transition(CallState::Ringing(Direction::Incoming));
    }

    fn on_answer(
        &mut self,
        from: &ParticipantId,
        call_id: &CallId,
        round: u32,
        answer: SessionDescription,
    ) {
        if !self.session_matches(from, call_id) {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.role() != Role::Initiator {
            tracing::warn!(target = "call", call_id = %call_id, "responder ignoring answer");
            return;
        }
        if round != session.negotiator.round() {
            tracing::debug!(
                target = "call",
                call_id = %call_id,
                round,
                current = session.negotiator.round(),
                "ignoring answer to a superseded offer"
            );
            return;
        }
        if session.state == CallState::Ringing(Direction::Outgoing) {
            self.transition(CallState::Negotiating);
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let fatal = session.negotiator.round() <= 1;
        if let Err(err) = session.negotiator.apply_remote(answer) {
            self.negotiation_failed(err, fatal);
        }
    }

    fn on_remote_candidate(&mut self, from: &ParticipantId, call_id: &CallId, candidate: IceCandidate) {
        if !self.session_matches(from, call_id) {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            let disposition = session.negotiator.add_remote_candidate(candidate);
            tracing::trace!(
                target = "call",
                call_id = %call_id,
                ?disposition,
                "remote candidate"
            );
        }
    }

    // ---- negotiation completions ----

    fn handle_negotiator_event(&mut self, event: NegotiatorEvent) {
        let current = self
            .session
            .as_ref()
            .map(|session| session.negotiator.generation());
        if current != Some(event.generation)
            || self.epoch.load(Ordering::SeqCst) != event.generation
        {
            tracing::debug!(
                target = "call",
                generation = event.generation,
                "discarding result from a finished call"
            );
            event.release();
            return;
        }

        match event.kind {
            NegotiatorEventKind::Prepared(Ok(peer)) => self.on_prepared(peer),
            NegotiatorEventKind::Prepared(Err(err)) => self.on_prepare_failed(err),
            NegotiatorEventKind::LocalDescription { round, result } => {
                self.on_local_description(round, result)
            }
            NegotiatorEventKind::RemoteApplied { round, result } => {
                self.on_remote_applied(round, result)
            }
            NegotiatorEventKind::Peer(peer) => self.on_peer_event(peer),
        }
    }

    fn on_prepared(&mut self, peer: PreparedPeer) {
        let Some(session) = self.session.as_mut() else {
            peer.release();
            return;
        };
        session.negotiator.on_prepared(peer);
        let result = match session.role() {
            Role::Initiator => session.negotiator.start_offer(false).map(|_| ()),
            Role::Responder => match session.stored_offer.take() {
                Some(offer) => session.negotiator.apply_remote(offer).map(|_| ()),
                None => Err(NegotiationError::NotReady),
            },
        };
        if let Err(err) = result {
            self.negotiation_failed(err, true);
        }
    }

    fn on_prepare_failed(&mut self, err: CallError) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.negotiator.on_prepare_failed();
        let call_id = session.call_id().clone();
        let notice = if session.peer_aware {
            PeerNotice::End
        } else {
            PeerNotice::Silent
        };
        tracing::warn!(target = "call", call_id = %call_id, error = %err, "call setup failed");
        let reason = match &err {
            CallError::Media(media) => EndReason::MediaUnavailable(media.clone()),
            _ => EndReason::NegotiationFailed,
        };
        self.emit_error(Some(call_id), err);
        self.end_session(reason, notice);
    }

    fn on_local_description(
        &mut self,
        round: u32,
        result: Result<SessionDescription, NegotiationError>,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let desc = match result {
            Ok(desc) => desc,
            Err(err) => {
                if round == session.negotiator.round() {
                    self.negotiation_failed(err, round <= 1);
                }
                return;
            }
        };
        if !session.negotiator.on_local_description(round, desc.clone()) {
            tracing::debug!(target = "call", round, "dropping superseded local description");
            return;
        }

        let call_id = session.call_id().clone();
        let peer = session.peer().clone();
        let signal = match session.role() {
            Role::Initiator => CallSignal::Invite {
                call_id: call_id.clone(),
                round,
                offer: desc,
            },
            Role::Responder => CallSignal::Answer {
                call_id: call_id.clone(),
                round: session.offer_round,
                answer: desc,
            },
        };
        send_signal(
            self.signals.as_ref(),
            &self.events,
            &self.participant,
            &peer,
            signal,
        );
        session.peer_aware = true;
        if session.role() == Role::Initiator {
            session.deadline = Some(Instant::now() + self.config.connect_timeout);
        }
        for candidate in session.negotiator.mark_local_sent() {
            send_signal(
                self.signals.as_ref(),
                &self.events,
                &self.participant,
                &peer,
                CallSignal::Candidate {
                    call_id: call_id.clone(),
                    candidate,
                },
            );
        }
    }

    fn on_remote_applied(&mut self, round: u32, result: Result<(), NegotiationError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match result {
            Ok(()) => {
                let Some(drained) = session.negotiator.on_remote_applied(round) else {
                    return;
                };
                tracing::debug!(
                    target = "call",
                    call_id = %session.call_id(),
                    round,
                    drained,
                    "remote description applied"
                );
                if session.role() == Role::Responder {
                    if let Err(err) = session.negotiator.start_answer() {
                        self.negotiation_failed(err, round <= 1);
                    }
                }
            }
            Err(err) => {
                if session.negotiator.on_remote_failed(round) {
                    self.negotiation_failed(err, round <= 1);
                }
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = session.negotiator.note_local_candidate(candidate) {
                    let call_id = session.call_id().clone();
                    let peer = session.peer().clone();
                    send_signal(
                        self.signals.as_ref(),
                        &self.events,
                        &self.participant,
                        &peer,
                        CallSignal::Candidate { call_id, candidate },
                    );
                }
            }
            PeerEvent::Connectivity(Connectivity::Connected) => {
                if session.state == CallState::Negotiating {
                    session.deadline = None;
                    session.restarts_used = 0;
                    self.transition(CallState::Active);
                }
            }
            PeerEvent::Connectivity(lost @ (Connectivity::Disconnected | Connectivity::Failed)) => {
                tracing::info!(
                    target = "call",
                    call_id = %session.call_id(),
                    connectivity = ?lost,
                    "connectivity lost"
                );
                let restart_now = lost == Connectivity::Failed && session.role() == Role::Initiator;
                match session.state {
                    CallState::Active => {
                        session.deadline = Some(Instant::now() + self.config.connect_timeout);
                        self.transition(CallState::Negotiating);
                        if restart_now {
                            self.attempt_restart();
                        }
                    }
                    CallState::Negotiating if restart_now => self.attempt_restart(),
                    _ => {}
                }
            }
            PeerEvent::Connectivity(other) => {
                tracing::trace!(target = "call", connectivity = ?other, "connectivity update");
            }
            PeerEvent::RemoteTrack(kind) => {
                let call_id = session.call_id().clone();
                let _ = self
                    .events
                    .send(CallEvent::RemoteMediaAvailable { call_id, kind });
            }
        }
    }

    // ---- timers ----

    fn handle_deadline(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.deadline = None;
        match (session.state.clone(), session.role()) {
            (CallState::Ringing(Direction::Incoming), _) => {
                tracing::info!(target = "call", call_id = %session.call_id(), "incoming call missed");
                self.end_session(EndReason::Missed, PeerNotice::Silent);
            }
            (CallState::Ringing(Direction::Outgoing) | CallState::Negotiating, Role::Initiator) => {
                self.attempt_restart();
            }
            (CallState::Negotiating, Role::Responder) => {
                if session.restarts_used >= self.config.max_ice_restarts {
                    let restarts = session.restarts_used;
                    self.connectivity_exhausted(restarts);
                } else {
                    session.restarts_used += 1;
                    session.deadline = Some(Instant::now() + self.config.connect_timeout);
                    tracing::info!(
                        target = "call",
                        call_id = %session.call_id(),
                        "still no connectivity; waiting for the caller to restart ice"
                    );
                }
            }
            _ => {}
        }
    }

    fn attempt_restart(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.restarts_used >= self.config.max_ice_restarts {
            let restarts = session.restarts_used;
            self.connectivity_exhausted(restarts);
            return;
        }
        session.restarts_used += 1;
        session.deadline = Some(Instant::now() + self.config.connect_timeout);
        tracing::info!(
            target = "call",
            call_id = %session.call_id(),
            attempt = session.restarts_used,
            "restarting ice"
        );
        if let Err(err) = session.negotiator.start_offer(true) {
            let call_id = session.call_id().clone();
            self.emit_error(Some(call_id), err.into());
        }
    }

    fn connectivity_exhausted(&mut self, restarts: u32) {
        let call_id = self.session.as_ref().map(|s| s.call_id().clone());
        tracing::warn!(target = "call", restarts, "giving up on connectivity");
        self.emit_error(call_id, CallError::ConnectivityExhausted { restarts });
        self.end_session(EndReason::ConnectivityExhausted, PeerNotice::End);
    }

    // ---- helpers ----

    fn negotiation_failed(&mut self, err: NegotiationError, fatal: bool) {
        let call_id = self.session.as_ref().map(|s| s.call_id().clone());
        tracing::warn!(target = "call", error = %err, fatal, "negotiation step failed");
        self.emit_error(call_id, err.into());
        if fatal {
            let notice = match &self.session {
                Some(session) if session.peer_aware => PeerNotice::End,
                _ => PeerNotice::Silent,
            };
            self.end_session(EndReason::NegotiationFailed, notice);
        }
    }

    fn new_negotiator(&self, role: Role, generation: u64) -> SessionNegotiator {
        SessionNegotiator::new(
            role,
            generation,
            Arc::clone(&self.epoch),
            self.negotiator_tx.clone(),
            Arc::clone(&self.media),
            Arc::clone(&self.transports),
            self.config.media,
        )
    }

    /// Tears the session down and returns to idle. Releases media and the
    /// transport and invalidates every in-flight step of this call.
    fn end_session(&mut self, reason: EndReason, notice: PeerNotice) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.state.is_live() {
            return;
        }
        let call_id = session.call_id().clone();
        let peer = session.peer().clone();
        let role = session.role();

        let signal = match notice {
            PeerNotice::Silent => None,
            PeerNotice::End => Some(CallSignal::End {
                call_id: call_id.clone(),
            }),
            PeerNotice::Reject => Some(CallSignal::Reject {
                call_id: call_id.clone(),
            }),
        };
        if let Some(signal) = signal {
            send_signal(
                self.signals.as_ref(),
                &self.events,
                &self.participant,
                &peer,
                signal,
            );
        }

        self.epoch.fetch_add(1, Ordering::SeqCst);
        session.deadline = None;
        session.stored_offer = None;
        session.negotiator.close();

        let ended = CallState::Ended(reason.clone());
        self.transition(ended.clone());
        tracing::info!(target = "call", call_id = %call_id, reason = ?reason, "call ended");

        if self.recently_ended.len() == RECENTLY_ENDED_CAPACITY {
            self.recently_ended.pop_front();
        }
        self.recently_ended.push_back((peer.clone(), call_id.clone()));

        self.last_outgoing = match role {
            Role::Initiator => Some(RetryTarget { peer, reason }),
            Role::Responder => None,
        };
        self.session = None;
        self.state_tx.send_replace(CallState::Idle);
        let _ = self.events.send(CallEvent::StateChanged {
            call_id,
            from: ended,
            to: CallState::Idle,
        });
    }

    fn transition(&mut self, next: CallState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let from = session.state.clone();
        if from == next {
            return;
        }
        if !from.can_transition_to(&next) {
            tracing::warn!(
                target = "call",
                call_id = %session.call_id(),
                from = %from,
                to = %next,
                "refusing illegal state transition"
            );
            return;
        }
        session.state = next.clone();
        tracing::info!(
            target = "call",
            call_id = %session.call_id(),
            from = %from,
            to = %next,
            "call state changed"
        );
        self.state_tx.send_replace(next.clone());
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: session.call_id().clone(),
            from,
            to: next,
        });
    }

    fn current_state(&self) -> CallState {
        self.session
            .as_ref()
            .map_or(CallState::Idle, |session| session.state.clone())
    }

    fn refuse(&self, operation: &'static str, state: &CallState) {
        tracing::warn!(target = "call", operation, state = %state, "operation not allowed");
        let call_id = self.session.as_ref().map(|s| s.call_id().clone());
        self.emit_error(
            call_id,
            CallError::IllegalState {
                operation,
                state: state.to_string(),
            },
        );
    }

    fn emit_error(&self, call_id: Option<CallId>, error: CallError) {
        let _ = self.events.send(CallEvent::Error { call_id, error });
    }
}

fn send_signal(
    signals: &dyn SignalSink,
    events: &broadcast::Sender<CallEvent>,
    from: &ParticipantId,
    to: &ParticipantId,
    signal: CallSignal,
) {
    let call_id = signal.call_id().clone();
    let kind = signal.kind();
    let result = signal
        .into_envelope(from.clone(), to.clone())
        .map_err(SignalingError::from)
        .and_then(|envelope| signals.send(envelope));
    match result {
        Ok(()) => tracing::debug!(target = "call", to = %to, kind = %kind, "signal sent"),
        Err(err) => {
            tracing::warn!(target = "call", to = %to, kind = %kind, error = %err, "failed to send signal");
            let _ = events.send(CallEvent::Error {
                call_id: Some(call_id),
                error: err.into(),
            });
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
