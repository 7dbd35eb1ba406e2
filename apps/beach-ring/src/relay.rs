use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use call_proto::{Envelope, ParticipantId, ServerMessage};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Floor for the reaper period; `tokio::time::interval` rejects zero.
const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies one websocket connection; a participant that reconnects gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotRegistered,
    ConnectionClosed,
}

/// What happened to a routed envelope. Only ever logged; senders are not told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Dropped(DropReason),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("participant id must not be empty")]
    EmptyParticipant,
    #[error("join before sending signals")]
    NotJoined,
    #[error("envelope from {claimed} does not match joined participant {joined}")]
    SenderMismatch { claimed: String, joined: String },
    #[error("connection closed")]
    ConnectionClosed,
}

struct Registration {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_seen: Instant,
}

/// Participant-id to connection directory. Forwards envelopes verbatim and
/// never stores them.
#[derive(Clone, Default)]
pub struct Relay {
    registrations: Arc<DashMap<ParticipantId, Registration>>,
    next_connection: Arc<AtomicU64>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `participant` to a connection. A previous binding is replaced
    /// and its socket simply stops receiving.
    pub fn register(
        &self,
        participant: ParticipantId,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> ConnectionId {
        let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
        let previous = self.registrations.insert(
            participant.clone(),
            Registration {
                connection,
                tx,
                last_seen: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            debug!(
                target = "relay",
                participant = %participant,
                orphaned = %previous.connection,
                connection = %connection,
                "participant re-registered"
            );
        }
        connection
    }

    pub fn route(&self, envelope: Envelope) -> RouteOutcome {
        let Some(registration) = self.registrations.get(&envelope.to) else {
            debug!(
                target = "relay",
                to = %envelope.to,
                from = %envelope.from,
                kind = %envelope.kind,
                "dropping envelope for unregistered participant"
            );
            return RouteOutcome::Dropped(DropReason::NotRegistered);
        };
        match registration.tx.send(ServerMessage::Signal { envelope }) {
            Ok(()) => RouteOutcome::Delivered,
            Err(_) => RouteOutcome::Dropped(DropReason::ConnectionClosed),
        }
    }

    pub fn unregister(&self, participant: &ParticipantId) -> bool {
        self.registrations.remove(participant).is_some()
    }

    /// Removes the binding only if it still belongs to `connection`.
    pub fn unregister_connection(
        &self,
        participant: &ParticipantId,
        connection: ConnectionId,
    ) -> bool {
        self.registrations
            .remove_if(participant, |_, registration| {
                registration.connection == connection
            })
            .is_some()
    }

    pub fn touch(&self, participant: &ParticipantId, connection: ConnectionId) -> bool {
        match self.registrations.get_mut(participant) {
            Some(mut registration) if registration.connection == connection => {
                registration.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, participant: &ParticipantId) -> bool {
        self.registrations.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Drops registrations that have not been heard from within `timeout`.
    pub fn reap_stale(&self, timeout: Duration) -> Vec<ParticipantId> {
        // collect first so no shard guard is held while removing
        let stale: Vec<(ParticipantId, ConnectionId)> = self
            .registrations
            .iter()
            .filter(|entry| entry.value().last_seen.elapsed() > timeout)
            .map(|entry| (entry.key().clone(), entry.value().connection))
            .collect();

        let mut reaped = Vec::with_capacity(stale.len());
        for (participant, connection) in stale {
            let removed = self
                .registrations
                .remove_if(&participant, |_, registration| {
                    registration.connection == connection
                        && registration.last_seen.elapsed() > timeout
                })
                .is_some();
            if removed {
                info!(
                    target = "relay",
                    participant = %participant,
                    connection = %connection,
                    "removing stale participant (heartbeat timeout)"
                );
                reaped.push(participant);
            }
        }
        reaped
    }

    pub fn spawn_reaper(&self, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        if interval < MIN_REAP_INTERVAL {
            warn!(
                target = "relay",
                ?interval,
                "reaper interval too small; using {:?}",
                MIN_REAP_INTERVAL
            );
        }
        let interval = interval.max(MIN_REAP_INTERVAL);
        let relay = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                relay.reap_stale(timeout);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use call_proto::{CallId, CallSignal};

    fn envelope(from: &str, to: &str) -> Envelope {
        CallSignal::End {
            call_id: CallId::from("call-1"),
        }
        .into_envelope(from.into(), to.into())
        .expect("envelope")
    }

    #[tokio::test]
    async fn routes_verbatim_to_registered_participant() {
        let relay = Relay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.register("bob".into(), tx);

        let sent = envelope("alice", "bob");
        assert_eq!(relay.route(sent.clone()), RouteOutcome::Delivered);
        match rx.recv().await {
            Some(ServerMessage::Signal { envelope }) => assert_eq!(envelope, sent),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_destination_is_dropped_silently() {
        let relay = Relay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.register("alice".into(), tx);

        assert_eq!(
            relay.route(envelope("alice", "ghost")),
            RouteOutcome::Dropped(DropReason::NotRegistered)
        );
        assert!(rx.try_recv().is_err(), "sender must not hear about drops");
    }

    #[tokio::test]
    async fn closed_connection_counts_as_dropped() {
        let relay = Relay::new();
        let (tx, rx) = mpsc::unbounded_channel();
        relay.register("bob".into(), tx);
        drop(rx);
        assert_eq!(
            relay.route(envelope("alice", "bob")),
            RouteOutcome::Dropped(DropReason::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn rebinding_orphans_the_old_connection() {
        let relay = Relay::new();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        let old = relay.register("bob".into(), old_tx);
        let new = relay.register("bob".into(), new_tx);
        assert_ne!(old, new);
        assert_eq!(relay.len(), 1);

        relay.route(envelope("alice", "bob"));
        assert!(new_rx.try_recv().is_ok());
        assert!(old_rx.try_recv().is_err());

        // the orphaned socket closing must not evict the live one
        assert!(!relay.unregister_connection(&"bob".into(), old));
        assert!(relay.is_registered(&"bob".into()));
        assert!(!relay.touch(&"bob".into(), old));
        assert!(relay.touch(&"bob".into(), new));
        assert!(relay.unregister_connection(&"bob".into(), new));
        assert!(relay.is_empty());
    }

    #[tokio::test]
    async fn unregister_removes_mapping() {
        let relay = Relay::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        relay.register("bob".into(), tx);
        assert!(relay.unregister(&"bob".into()));
        assert!(!relay.unregister(&"bob".into()));
        assert_eq!(
            relay.route(envelope("alice", "bob")),
            RouteOutcome::Dropped(DropReason::NotRegistered)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_only_silent_participants() {
        let relay = Relay::new();
        let (quiet_tx, _quiet_rx) = mpsc::unbounded_channel();
        let (chatty_tx, _chatty_rx) = mpsc::unbounded_channel();
        relay.register("quiet".into(), quiet_tx);
        let chatty = relay.register("chatty".into(), chatty_tx);

        let timeout = Duration::from_secs(600);
        tokio::time::advance(Duration::from_secs(400)).await;
        relay.touch(&"chatty".into(), chatty);
        tokio::time::advance(Duration::from_secs(300)).await;

        assert_eq!(relay.reap_stale(timeout), vec![ParticipantId::from("quiet")]);
        assert!(relay.is_registered(&"chatty".into()));
        assert!(!relay.is_registered(&"quiet".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_survives_zero_interval() {
        let relay = Relay::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        relay.register("quiet".into(), tx);

        let reaper = relay.spawn_reaper(Duration::ZERO, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!reaper.is_finished());
        assert!(!relay.is_registered(&"quiet".into()));
        reaper.abort();
    }
}
