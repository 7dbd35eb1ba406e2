use std::sync::Arc;
use std::time::Duration;

use call_proto::{ClientMessage, Envelope, ParticipantId, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use url::Url;

use crate::config::SignalingConfig;
use crate::error::SignalingError;

/// Outbound half of a signaling channel. Sending never suspends; delivery is
/// best-effort and unacknowledged.
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError>;
}

/// Connection to a beach-ring relay for one participant.
pub struct SignalingClient {
    participant_id: ParticipantId,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connects, registers `participant_id`, and returns the client together
    /// with the stream of envelopes the relay delivers to it.
    pub async fn connect(
        relay_url: &str,
        participant_id: ParticipantId,
        config: SignalingConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Envelope>), SignalingError> {
        if participant_id.is_empty() {
            return Err(SignalingError::Setup("participant id must not be empty".into()));
        }
        let websocket_url = derive_websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| SignalingError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "signaling",
            url = %websocket_url,
            "relay websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (join_tx, join_rx) = oneshot::channel::<Result<(), String>>();

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "failed to encode frame");
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let expected = participant_id.clone();
        let reader_handle = tokio::spawn(async move {
            let mut join_tx = Some(join_tx);
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "signaling", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "signaling", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target = "signaling", event = "ws_in", len = text.len());
                let message = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "unparseable relay frame");
                        continue;
                    }
                };
                match message {
                    ServerMessage::Joined { participant_id } => {
                        if participant_id == expected {
                            if let Some(tx) = join_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                    }
                    ServerMessage::Signal { envelope } => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    ServerMessage::Pong => {
                        tracing::trace!(target = "signaling", "pong");
                    }
                    ServerMessage::Error { message } => {
                        tracing::warn!(target = "signaling", %message, "relay reported error");
                        if let Some(tx) = join_tx.take() {
                            let _ = tx.send(Err(message));
                        }
                    }
                }
            }
            tracing::debug!(target = "signaling", "relay reader finished");
        });

        let mut tasks = vec![writer_handle, reader_handle];
        if let Some(interval) = heartbeat_period(&config) {
            let heartbeat_tx = send_tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                        break;
                    }
                }
            }));
        }

        let client = Arc::new(SignalingClient {
            participant_id: participant_id.clone(),
            send_tx,
            tasks: Mutex::new(tasks),
        });

        client
            .send_tx
            .send(ClientMessage::Join { participant_id })
            .map_err(|_| SignalingError::ChannelClosed)?;
        tracing::debug!(target = "signaling", "sent join");

        match tokio::time::timeout(config.join_timeout, join_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(
                    target = "signaling",
                    participant = %client.participant_id,
                    "joined relay"
                );
                Ok((client, inbound_rx))
            }
            Ok(Ok(Err(message))) => Err(SignalingError::Relay(message)),
            Ok(Err(_)) => {
                tracing::warn!(target = "signaling", "relay closed before join completed");
                Err(SignalingError::ChannelClosed)
            }
            Err(_) => Err(SignalingError::JoinTimeout),
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Stops all background tasks; the relay unregisters us when the socket drops.
    pub fn disconnect(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl SignalSink for SignalingClient {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        tracing::trace!(
            target = "signaling",
            kind = %envelope.kind,
            to = %envelope.to,
            "queueing envelope"
        );
        self.send_tx
            .send(ClientMessage::Signal { envelope })
            .map_err(|_| SignalingError::ChannelClosed)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// `None` disables pings; `tokio::time::interval` panics on a zero period.
fn heartbeat_period(config: &SignalingConfig) -> Option<Duration> {
    if config.heartbeat_interval.is_zero() {
        tracing::warn!(
            target = "signaling",
            "zero heartbeat interval; relay pings disabled"
        );
        return None;
    }
    Some(config.heartbeat_interval)
}

/// Accepts `ws(s)://` or `http(s)://` relay addresses; a bare host gets the `/ws` path.
pub(crate) fn derive_websocket_url(relay_url: &str) -> Result<Url, SignalingError> {
    let base = Url::parse(relay_url)
        .map_err(|err| SignalingError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match base.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SignalingError::Setup(format!(
                "unsupported relay url scheme: {other}"
            )));
        }
    };
    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| SignalingError::Setup("invalid websocket scheme".into()))?;
    if ws.path().is_empty() || ws.path() == "/" {
        ws.set_path("/ws");
    }
    ws.set_fragment(None);
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_become_websocket_urls() {
        let url = derive_websocket_url("http://127.0.0.1:8090").expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:8090/ws");
        let url = derive_websocket_url("https://relay.example/").expect("url");
        assert_eq!(url.as_str(), "wss://relay.example/ws");
    }

    #[test]
    fn explicit_websocket_path_is_kept() {
        let url = derive_websocket_url("ws://relay.example:9000/custom/ws").expect("url");
        assert_eq!(url.as_str(), "ws://relay.example:9000/custom/ws");
    }

    #[test]
    fn zero_heartbeat_interval_disables_pings() {
        let config = SignalingConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(heartbeat_period(&config), None);
        assert_eq!(
            heartbeat_period(&SignalingConfig::default()),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(matches!(
            derive_websocket_url("ftp://relay.example"),
            Err(SignalingError::Setup(_))
        ));
        assert!(derive_websocket_url("not a url").is_err());
    }
}
