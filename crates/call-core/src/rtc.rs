use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use call_proto::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{CallConfig, IceServerConfig};
use crate::error::NegotiationError;
use crate::media::{LocalMedia, MediaKind};
use crate::peer::{Connectivity, PeerEvent, PeerEventSink, PeerTransport, PeerTransportFactory};

/// Builds one webrtc-rs peer connection per call.
pub struct RtcTransportFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let transport = RtcPeerTransport::new(&self.ice_servers, events).await?;
        Ok(Arc::new(transport))
    }
}

pub struct RtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    closed: AtomicBool,
}

fn setup_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Setup(err.to_string())
}

fn description_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Description(err.to_string())
}

impl RtcPeerTransport {
    pub async fn new(
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(setup_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(setup_error)?,
        );

        let candidate_sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(err) => tracing::warn!(
                        target = "negotiator",
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let state_sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = state_sink.clone();
                Box::pin(async move {
                    tracing::debug!(target = "negotiator", ?state, "peer connection state");
                    if let Some(connectivity) = map_connection_state(state) {
                        sink.emit(PeerEvent::Connectivity(connectivity));
                    }
                })
            },
        ));

        let track_sink = events;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    sink.emit(PeerEvent::RemoteTrack(kind));
                })
            },
        ));

        Ok(Self {
            peer_connection,
            local_tracks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Tracks fed by the attached local media; a capture pipeline writes samples here.
    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().clone()
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<Connectivity> {
    match state {
        RTCPeerConnectionState::New => Some(Connectivity::New),
        RTCPeerConnectionState::Connecting => Some(Connectivity::Checking),
        RTCPeerConnectionState::Connected => Some(Connectivity::Connected),
        RTCPeerConnectionState::Disconnected => Some(Connectivity::Disconnected),
        RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
        RTCPeerConnectionState::Closed => Some(Connectivity::Closed),
        _ => None,
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(description_error)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(NegotiationError::Description(format!(
            "unsupported description type {other}"
        ))),
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        for track in media.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                media.stream_id().to_string(),
            ));
            let sender = self
                .peer_connection
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(setup_error)?;
            // RTCP must be drained for interceptors to run
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
            self.local_tracks.lock().push(local);
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let options = RTCOfferOptions {
            ice_restart,
            voice_activity_detection: false,
        };
        let offer = self
            .peer_connection
            .create_offer(Some(options))
            .await
            .map_err(description_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(description_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.peer_connection
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(description_error)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer_connection
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(description_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| NegotiationError::Candidate(err.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.peer_connection.close().await {
            tracing::warn!(target = "negotiator", error = %err, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalTrack;
    use crate::mock::MockTrack;
    use std::time::Duration;

    fn audio_only() -> LocalMedia {
        let track: Arc<dyn LocalTrack> = Arc::new(MockTrack::new("mic-0", MediaKind::Audio));
        LocalMedia::new("stream-0", vec![track])
    }

    #[tokio::test]
    async fn offer_carries_attached_audio() {
        let (sink, _events) = PeerEventSink::detached();
        let transport = RtcPeerTransport::new(&[], sink).await.expect("transport");
        transport.attach_media(&audio_only()).await.expect("attach");
        assert_eq!(transport.local_tracks().len(), 1);

        let offer = transport.create_offer(false).await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(!offer.sdp.contains("m=video"));

        transport.close().await;
        transport.close().await;
    }

    #[tokio::test]
    async fn answer_requires_remote_offer() {
        let (sink, _events) = PeerEventSink::detached();
        let transport = RtcPeerTransport::new(&[], sink).await.expect("transport");
        assert!(matches!(
            transport.create_answer().await,
            Err(NegotiationError::Description(_))
        ));
        transport.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "opens host UDP sockets"]
    async fn loopback_peers_connect_and_see_remote_audio() {
        let (caller_sink, mut caller_events) = PeerEventSink::detached();
        let (callee_sink, mut callee_events) = PeerEventSink::detached();
        let caller = RtcPeerTransport::new(&[], caller_sink).await.expect("caller");
        let callee = RtcPeerTransport::new(&[], callee_sink).await.expect("callee");
        caller.attach_media(&audio_only()).await.expect("attach");
        callee.attach_media(&audio_only()).await.expect("attach");

        let offer = caller.create_offer(false).await.expect("offer");
        caller.set_local_description(offer.clone()).await.expect("local");
        callee.set_remote_description(offer).await.expect("remote");
        let answer = callee.create_answer().await.expect("answer");
        callee.set_local_description(answer.clone()).await.expect("local");
        caller.set_remote_description(answer).await.expect("remote");

        let connected = tokio::time::timeout(Duration::from_secs(10), async {
            let mut caller_up = false;
            let mut callee_up = false;
            while !(caller_up && callee_up) {
                tokio::select! {
                    Some(event) = caller_events.recv() => match event {
                        PeerEvent::LocalCandidate(c) => callee.add_ice_candidate(c).await.expect("cand"),
                        PeerEvent::Connectivity(Connectivity::Connected) => caller_up = true,
                        _ => {}
                    },
                    Some(event) = callee_events.recv() => match event {
                        PeerEvent::LocalCandidate(c) => caller.add_ice_candidate(c).await.expect("cand"),
                        PeerEvent::Connectivity(Connectivity::Connected) => callee_up = true,
                        _ => {}
                    },
                }
            }
        })
        .await;
        assert!(connected.is_ok(), "peers never connected");
        caller.close().await;
        callee.close().await;
    }
}
