use anyhow::{anyhow, Result};
use call_proto::{CallSignal, ClientMessage, ParticipantId, ServerMessage};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "beach-ring")]
#[command(about = "Beach Ring call signaling relay and listening client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Listen port (overrides BEACH_RING_PORT)
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a relay as a participant and print every envelope delivered to it
    Listen {
        /// Relay websocket URL
        #[arg(short, long, default_value = "ws://localhost:8090/ws")]
        url: String,

        /// Participant id to register (random if omitted)
        #[arg(short, long)]
        participant: Option<String>,

        /// Exit after this many envelopes
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

pub async fn run_listen(url: String, participant: Option<String>, count: Option<usize>) -> Result<()> {
    let participant = ParticipantId::new(
        participant.unwrap_or_else(|| format!("listener-{}", uuid::Uuid::new_v4())),
    );
    debug!("connecting to {} as {}", url, participant);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("connection failed: {e}"));
        }
        Err(_) => {
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = serde_json::to_string(&ClientMessage::Join {
        participant_id: participant.clone(),
    })?;
    write.send(Message::Text(join.into())).await?;

    let joined = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::Joined { participant_id } => return Ok(participant_id),
                    ServerMessage::Error { message } => {
                        return Err(anyhow!("join failed: {message}"));
                    }
                    _ => {}
                }
            }
        }
        Err(anyhow!("connection closed before join completed"))
    })
    .await
    .map_err(|_| anyhow!("timeout waiting for join response"))??;
    println!("joined as {joined}");

    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    heartbeat.tick().await;
    let mut received = 0usize;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let ping = serde_json::to_string(&ClientMessage::Ping)?;
                write.send(Message::Text(ping.into())).await?;
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Err(anyhow!("relay closed the connection"));
                };
                let Message::Text(text) = msg? else {
                    continue;
                };
                match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::Signal { envelope } => {
                        let summary = match CallSignal::from_envelope(&envelope) {
                            Ok(signal) => format!("{} call={}", signal.kind(), signal.call_id()),
                            Err(err) => format!("{} (malformed: {err})", envelope.kind),
                        };
                        println!("{} -> {}: {}", envelope.from, envelope.to, summary);
                        println!("{}", serde_json::to_string(&envelope)?);
                        received += 1;
                        if count.is_some_and(|limit| received >= limit) {
                            return Ok(());
                        }
                    }
                    ServerMessage::Error { message } => eprintln!("relay error: {message}"),
                    ServerMessage::Pong | ServerMessage::Joined { .. } => {}
                }
            }
        }
    }
}
