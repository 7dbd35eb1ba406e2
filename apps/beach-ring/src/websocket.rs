use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use call_proto::{ClientMessage, ParticipantId, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::relay::{ConnectionId, Relay, RelayError, RouteOutcome};
use crate::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay, remote_addr))
}

/// The participant a socket has joined as, if any.
type Joined = Option<(ParticipantId, ConnectionId)>;

async fn handle_socket(socket: WebSocket, relay: Relay, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(target = "relay", %remote_addr, "writer task ended");
    });

    debug!(target = "relay", %remote_addr, "websocket connected");
    let mut joined: Joined = None;

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(err) => {
                warn!(target = "relay", %remote_addr, error = %err, "websocket error");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(target = "relay", %remote_addr, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client_msg) => {
                if let Err(err) = handle_client_message(client_msg, &relay, &tx, &mut joined) {
                    warn!(target = "relay", %remote_addr, error = %err, "rejected client frame");
                    let _ = tx.send(ServerMessage::Error {
                        message: err.to_string(),
                    });
                }
            }
            Err(err) => {
                warn!(target = "relay", %remote_addr, error = %err, "invalid client frame");
                let _ = tx.send(ServerMessage::Error {
                    message: format!("invalid message format: {err}"),
                });
            }
        }
    }

    if let Some((participant, connection)) = joined {
        if relay.unregister_connection(&participant, connection) {
            info!(
                target = "relay",
                participant = %participant,
                connection = %connection,
                "participant disconnected"
            );
        }
    }
}

fn handle_client_message(
    message: ClientMessage,
    relay: &Relay,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    joined: &mut Joined,
) -> Result<(), RelayError> {
    match message {
        ClientMessage::Join { participant_id } => {
            if participant_id.is_empty() {
                return Err(RelayError::EmptyParticipant);
            }
            if let Some((previous, connection)) = joined.take() {
                relay.unregister_connection(&previous, connection);
            }
            let connection = relay.register(participant_id.clone(), tx.clone());
            info!(
                target = "relay",
                participant = %participant_id,
                connection = %connection,
                "participant joined"
            );
            *joined = Some((participant_id.clone(), connection));
            tx.send(ServerMessage::Joined { participant_id })
                .map_err(|_| RelayError::ConnectionClosed)?;
        }
        ClientMessage::Signal { envelope } => {
            let Some((participant, connection)) = joined.as_ref() else {
                return Err(RelayError::NotJoined);
            };
            if &envelope.from != participant {
                return Err(RelayError::SenderMismatch {
                    claimed: envelope.from.to_string(),
                    joined: participant.to_string(),
                });
            }
            relay.touch(participant, *connection);
            let kind = envelope.kind;
            let to = envelope.to.clone();
            match relay.route(envelope) {
                RouteOutcome::Delivered => {
                    debug!(target = "relay", from = %participant, to = %to, %kind, "routed");
                }
                RouteOutcome::Dropped(reason) => {
                    debug!(target = "relay", from = %participant, to = %to, %kind, ?reason, "dropped");
                }
            }
        }
        ClientMessage::Ping => {
            if let Some((participant, connection)) = joined.as_ref() {
                relay.touch(participant, *connection);
            }
            tx.send(ServerMessage::Pong)
                .map_err(|_| RelayError::ConnectionClosed)?;
        }
    }
    Ok(())
}
