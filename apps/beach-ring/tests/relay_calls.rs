use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beach_ring::config::RelayConfig;
use call_core::call_proto::{CallId, CallSignal, Envelope, ParticipantId};
use call_core::mock::{MockMediaSource, MockPeerFactory};
use call_core::{
    CallConfig, CallController, CallDeps, CallEvent, CallState, Direction, SignalSink,
    SignalingClient, SignalingConfig,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn start_relay() -> Result<(String, JoinHandle<()>), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr: SocketAddr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(err) = beach_ring::serve(listener, RelayConfig::default()).await {
            panic!("relay stopped: {err:#}");
        }
    });
    Ok((format!("http://{addr}"), handle))
}

async fn join(
    url: &str,
    id: &str,
) -> Result<(Arc<SignalingClient>, mpsc::UnboundedReceiver<Envelope>), Box<dyn std::error::Error>> {
    Ok(SignalingClient::connect(url, ParticipantId::from(id), SignalingConfig::default()).await?)
}

fn end(from: &str, to: &str, call: &str) -> Result<Envelope, Box<dyn std::error::Error>> {
    Ok(CallSignal::End {
        call_id: CallId::from(call),
    }
    .into_envelope(from.into(), to.into())?)
}

async fn recv(inbound: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("envelope in time")
        .expect("inbound open")
}

async fn assert_quiet(inbound: &mut mpsc::UnboundedReceiver<Envelope>) {
    let result = tokio::time::timeout(Duration::from_millis(200), inbound.recv()).await;
    assert!(
        !matches!(result, Ok(Some(_))),
        "unexpected envelope: {result:?}"
    );
}

#[tokio::test]
async fn envelopes_are_forwarded_verbatim() -> TestResult {
    let (url, relay) = start_relay().await?;
    let (alice, _alice_in) = join(&url, "alice").await?;
    let (_bob, mut bob_in) = join(&url, "bob").await?;

    let sent = end("alice", "bob", "call-1")?;
    alice.send(sent.clone())?;
    assert_eq!(recv(&mut bob_in).await, sent);

    relay.abort();
    Ok(())
}

#[tokio::test]
async fn unknown_destination_is_dropped_without_feedback() -> TestResult {
    let (url, relay) = start_relay().await?;
    let (alice, mut alice_in) = join(&url, "alice").await?;
    let (_bob, mut bob_in) = join(&url, "bob").await?;

    alice.send(end("alice", "ghost", "call-1")?)?;
    alice.send(end("alice", "bob", "call-2")?)?;

    let delivered = recv(&mut bob_in).await;
    assert_eq!(delivered.to.as_str(), "bob");
    assert_quiet(&mut bob_in).await;
    assert_quiet(&mut alice_in).await;

    relay.abort();
    Ok(())
}

#[tokio::test]
async fn impersonated_sender_is_not_routed() -> TestResult {
    let (url, relay) = start_relay().await?;
    let (alice, _alice_in) = join(&url, "alice").await?;
    let (_bob, mut bob_in) = join(&url, "bob").await?;

    alice.send(end("mallory", "bob", "call-1")?)?;
    assert_quiet(&mut bob_in).await;

    relay.abort();
    Ok(())
}

#[tokio::test]
async fn reconnect_replaces_registration_and_survives_old_socket_closing() -> TestResult {
    let (url, relay) = start_relay().await?;
    let (alice, _alice_in) = join(&url, "alice").await?;
    let (bob_old, mut bob_old_in) = join(&url, "bob").await?;
    let (_bob_new, mut bob_new_in) = join(&url, "bob").await?;

    alice.send(end("alice", "bob", "call-1")?)?;
    recv(&mut bob_new_in).await;
    assert_quiet(&mut bob_old_in).await;

    bob_old.disconnect();
    drop(bob_old);
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.send(end("alice", "bob", "call-2")?)?;
    let delivered = recv(&mut bob_new_in).await;
    assert_eq!(
        CallSignal::from_envelope(&delivered)?.call_id(),
        &CallId::from("call-2")
    );

    relay.abort();
    Ok(())
}

async fn wait_for_state(events: &mut broadcast::Receiver<CallEvent>, state: CallState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged { to, .. }) if to == state => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("state reached in time");
}

fn controller(
    id: &str,
    client: Arc<SignalingClient>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
) -> CallController {
    CallController::spawn(
        ParticipantId::from(id),
        CallConfig::localhost(),
        CallDeps {
            signals: client,
            inbound,
            media: MockMediaSource::granting(),
            transports: MockPeerFactory::connecting(),
        },
    )
}

#[tokio::test]
async fn call_through_relay_reaches_active_and_ends_cleanly() -> TestResult {
    let (url, relay) = start_relay().await?;
    let (alice_client, alice_in) = join(&url, "alice").await?;
    let (bob_client, bob_in) = join(&url, "bob").await?;

    let alice = controller("alice", alice_client, alice_in);
    let bob = controller("bob", bob_client, bob_in);
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.initiate_call("bob")?;
    wait_for_state(&mut bob_events, CallState::Ringing(Direction::Incoming)).await;
    bob.accept_incoming()?;
    wait_for_state(&mut alice_events, CallState::Active).await;
    wait_for_state(&mut bob_events, CallState::Active).await;

    bob.hang_up()?;
    wait_for_state(&mut alice_events, CallState::Idle).await;
    wait_for_state(&mut bob_events, CallState::Idle).await;

    alice.shutdown().await;
    bob.shutdown().await;
    relay.abort();
    Ok(())
}
