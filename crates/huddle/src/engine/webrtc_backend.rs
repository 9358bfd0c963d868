use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::vnet::net::Net;

use super::backend::{
    BackendError, BackendEvent, BackendEventSender, IceConnectionState, NegotiationBackend,
    NegotiationFactory, PeerConnectionState, SdpKind, SessionDescription, SignalingState,
    TaggedEvent,
};
use crate::config::SessionConfig;
use crate::media::{LocalStream, RemoteTrack, TrackKind};
use crate::signaling::IceCandidatePayload;

/// Live `webrtc` tracks by id, shared across backend rebuilds. The capture layer writes
/// samples into local tracks; the rendering layer reads remote ones. Entries belong to
/// the backend generation that created them and go away with it.
#[derive(Default)]
pub struct TrackRegistry {
    local: parking_lot::Mutex<HashMap<String, (u64, Arc<TrackLocalStaticSample>)>>,
    remote: parking_lot::Mutex<HashMap<String, (u64, Arc<TrackRemote>)>>,
}

impl TrackRegistry {
    pub fn local(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local.lock().get(track_id).map(|(_, track)| Arc::clone(track))
    }

    pub fn remote(&self, track_id: &str) -> Option<Arc<TrackRemote>> {
        self.remote.lock().get(track_id).map(|(_, track)| Arc::clone(track))
    }

    pub fn local_ids(&self) -> Vec<String> {
        self.local.lock().keys().cloned().collect()
    }

    pub fn remote_ids(&self) -> Vec<String> {
        self.remote.lock().keys().cloned().collect()
    }

    fn insert_local(&self, generation: u64, id: String, track: Arc<TrackLocalStaticSample>) {
        self.local.lock().insert(id, (generation, track));
    }

    fn insert_remote(&self, generation: u64, id: String, track: Arc<TrackRemote>) {
        self.remote.lock().insert(id, (generation, track));
    }

    fn clear_local(&self, generation: u64) {
        self.local.lock().retain(|_, (owner, _)| *owner != generation);
    }

    fn forget_generation(&self, generation: u64) {
        self.clear_local(generation);
        self.remote.lock().retain(|_, (owner, _)| *owner != generation);
    }
}

#[derive(Clone, Copy)]
struct IceTimeouts {
    disconnected: Duration,
    failed: Duration,
    keepalive: Duration,
}

/// Builds `RTCPeerConnection`-backed negotiation objects.
#[derive(Clone)]
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
    vnet: Option<Arc<Net>>,
    ice_timeouts: Option<IceTimeouts>,
    tracks: Arc<TrackRegistry>,
}

impl WebRtcFactory {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            vnet: None,
            ice_timeouts: None,
            tracks: Arc::new(TrackRegistry::default()),
        }
    }

    /// Routes every connection through a virtual network instead of the host's.
    pub fn with_vnet(mut self, net: Arc<Net>) -> Self {
        self.vnet = Some(net);
        self
    }

    pub fn with_ice_timeouts(mut self, disconnected: Duration, failed: Duration, keepalive: Duration) -> Self {
        self.ice_timeouts = Some(IceTimeouts {
            disconnected,
            failed,
            keepalive,
        });
        self
    }

    pub fn tracks(&self) -> Arc<TrackRegistry> {
        Arc::clone(&self.tracks)
    }

    fn build_api(&self) -> Result<API, BackendError> {
        let mut setting = SettingEngine::default();
        if let Some(net) = &self.vnet {
            setting.set_vnet(Some(Arc::clone(net)));
        }
        if let Some(timeouts) = self.ice_timeouts {
            setting.set_ice_timeouts(
                Some(timeouts.disconnected),
                Some(timeouts.failed),
                Some(timeouts.keepalive),
            );
        }

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(to_backend_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(to_backend_error)?;

        Ok(APIBuilder::new()
            .with_setting_engine(setting)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl NegotiationFactory for WebRtcFactory {
    async fn create(
        &self,
        generation: u64,
        events: BackendEventSender,
    ) -> Result<Box<dyn NegotiationBackend>, BackendError> {
        let api = self.build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_backend_error)?,
        );
        install_handlers(&pc, generation, &events, &self.tracks);
        tracing::debug!(target: "huddle::webrtc", generation, "created peer connection");
        Ok(Box::new(WebRtcBackend {
            pc,
            generation,
            senders: AsyncMutex::new(Vec::new()),
            tracks: Arc::clone(&self.tracks),
        }))
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    generation: u64,
    events: &BackendEventSender,
    tracks: &Arc<TrackRegistry>,
) {
    let emit = {
        let events = events.clone();
        move |event: BackendEvent| {
            let _ = events.send(TaggedEvent { generation, event });
        }
    };

    let on_candidate = emit.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => on_candidate(BackendEvent::LocalCandidate(IceCandidatePayload {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(err) => tracing::warn!(
                    target: "huddle::webrtc",
                    error = %err,
                    "failed to serialize local candidate"
                ),
            }
        }
        Box::pin(async {})
    }));

    let on_state = emit.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if let Some(mapped) = map_connection_state(state) {
            on_state(BackendEvent::ConnectionState(mapped));
        }
        Box::pin(async {})
    }));

    let on_ice_state = emit.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        if let Some(mapped) = map_ice_state(state) {
            on_ice_state(BackendEvent::IceConnectionState(mapped));
        }
        Box::pin(async {})
    }));

    let on_track = emit;
    let registry = Arc::clone(tracks);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let remote = RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
            };
            registry.insert_remote(generation, remote.id.clone(), Arc::clone(&track));
            on_track(BackendEvent::RemoteTrack(remote));
            Box::pin(async {})
        },
    ));
}

struct WebRtcBackend {
    pc: Arc<RTCPeerConnection>,
    generation: u64,
    senders: AsyncMutex<Vec<Arc<RTCRtpSender>>>,
    tracks: Arc<TrackRegistry>,
}

impl WebRtcBackend {
    fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, BackendError> {
        match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(to_backend_error)
    }
}

#[async_trait]
impl NegotiationBackend for WebRtcBackend {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, BackendError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(to_backend_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, BackendError> {
        let answer = self.pc.create_answer(None).await.map_err(to_backend_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), BackendError> {
        let description = Self::to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_backend_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), BackendError> {
        let description = Self::to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_backend_error)
    }

    async fn rollback(&self) -> Result<(), BackendError> {
        let pending_sdp = match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => self.pc.local_description().await,
            RTCSignalingState::HaveRemoteOffer => self.pc.remote_description().await,
            _ => return Err(BackendError::WrongState("nothing to roll back".into())),
        }
        .map(|description| description.sdp)
        .unwrap_or_default();
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": pending_sdp }))
                .map_err(to_backend_error)?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(to_backend_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), BackendError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(to_backend_error)
    }

    async fn replace_local_tracks(&self, stream: &LocalStream) -> Result<(), BackendError> {
        let mut senders = self.senders.lock().await;
        for sender in senders.drain(..) {
            self.pc.remove_track(&sender).await.map_err(to_backend_error)?;
        }
        self.tracks.clear_local(self.generation);
        for track in &stream.tracks {
            let codec = match track.kind {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
            };
            let local = Arc::new(TrackLocalStaticSample::new(codec, track.id.clone(), stream.id.clone()));
            let sender = self
                .pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_backend_error)?;
            let rtcp_reader = Arc::clone(&sender);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while rtcp_reader.read(&mut buf).await.is_ok() {}
            });
            senders.push(sender);
            self.tracks.insert_local(self.generation, track.id.clone(), local);
        }
        tracing::debug!(
            target: "huddle::webrtc",
            generation = self.generation,
            tracks = stream.tracks.len(),
            "replaced outbound tracks"
        );
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.tracks.forget_generation(self.generation);
        self.pc.close().await.map_err(to_backend_error)
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        _ => None,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

fn to_backend_error<E: std::fmt::Display>(err: E) -> BackendError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("connection closed") || lowered.contains("peerconnection is closed") {
        BackendError::Closed
    } else if lowered.contains("signaling state") || lowered.contains("rollback") {
        BackendError::WrongState(message)
    } else {
        BackendError::Failed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use webrtc::util::vnet::net::NetConfig;
    use webrtc::util::vnet::router::{Router, RouterConfig};

    use crate::media::MediaTrack;
    use crate::media::CaptureSource;

    async fn attach_vnet_to_router(vnet: &Arc<Net>, router: &Arc<AsyncMutex<Router>>) {
        let nic = vnet.get_nic().expect("nic");
        router
            .lock()
            .await
            .add_net(Arc::clone(&nic))
            .await
            .expect("add net");
        nic.lock()
            .await
            .set_router(Arc::clone(router))
            .await
            .expect("set router");
    }

    async fn vnet_factories() -> (WebRtcFactory, WebRtcFactory) {
        let wan = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: "10.0.0.0/24".to_owned(),
                ..Default::default()
            })
            .expect("router"),
        ));
        let left = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec!["10.0.0.2".to_owned()],
            ..Default::default()
        })));
        attach_vnet_to_router(&left, &wan).await;
        let right = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec!["10.0.0.3".to_owned()],
            ..Default::default()
        })));
        attach_vnet_to_router(&right, &wan).await;
        wan.lock().await.start().await.expect("router start");

        let config = SessionConfig {
            ice_servers: Vec::new(),
            ..SessionConfig::default()
        };
        let timeouts = (
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_millis(200),
        );
        (
            WebRtcFactory::new(&config)
                .with_vnet(left)
                .with_ice_timeouts(timeouts.0, timeouts.1, timeouts.2),
            WebRtcFactory::new(&config)
                .with_vnet(right)
                .with_ice_timeouts(timeouts.0, timeouts.1, timeouts.2),
        )
    }

    fn audio_stream(id: &str) -> LocalStream {
        LocalStream {
            id: format!("{id}-stream"),
            tracks: vec![MediaTrack {
                id: format!("{id}-mic"),
                kind: TrackKind::Audio,
                source: CaptureSource::Microphone,
            }],
        }
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn two_backends_connect_over_virtual_network() {
        let (left_factory, right_factory) = vnet_factories().await;
        let (left_tx, mut left_rx) = mpsc::unbounded_channel();
        let (right_tx, mut right_rx) = mpsc::unbounded_channel();
        let left = left_factory.create(1, left_tx).await.expect("left backend");
        let right = right_factory.create(1, right_tx).await.expect("right backend");

        left.replace_local_tracks(&audio_stream("left")).await.expect("left tracks");
        right.replace_local_tracks(&audio_stream("right")).await.expect("right tracks");
        assert!(left_factory.tracks().local("left-mic").is_some());

        let offer = left.create_offer(false).await.expect("offer");
        left.set_local_description(offer.clone()).await.expect("set local offer");
        assert_eq!(left.signaling_state(), SignalingState::HaveLocalOffer);

        right.set_remote_description(offer).await.expect("set remote offer");
        assert!(right.has_remote_description().await);
        let answer = right.create_answer().await.expect("answer");
        right.set_local_description(answer.clone()).await.expect("set local answer");
        left.set_remote_description(answer).await.expect("set remote answer");
        assert_eq!(left.signaling_state(), SignalingState::Stable);

        // Trickle candidates both ways until each side reports connected.
        let pump = async {
            let mut left_connected = false;
            let mut right_connected = false;
            while !(left_connected && right_connected) {
                tokio::select! {
                    Some(tagged) = left_rx.recv() => match tagged.event {
                        BackendEvent::LocalCandidate(candidate) => {
                            let _ = right.add_ice_candidate(candidate).await;
                        }
                        BackendEvent::ConnectionState(PeerConnectionState::Connected) => left_connected = true,
                        _ => {}
                    },
                    Some(tagged) = right_rx.recv() => match tagged.event {
                        BackendEvent::LocalCandidate(candidate) => {
                            let _ = left.add_ice_candidate(candidate).await;
                        }
                        BackendEvent::ConnectionState(PeerConnectionState::Connected) => right_connected = true,
                        _ => {}
                    },
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(20), pump)
            .await
            .expect("both sides connect");

        left.close().await.expect("close left");
        right.close().await.expect("close right");
        assert_eq!(left.signaling_state(), SignalingState::Closed);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn registry_holds_only_tracks_of_open_backends() {
        let config = SessionConfig {
            ice_servers: Vec::new(),
            ..SessionConfig::default()
        };
        let factory = WebRtcFactory::new(&config);
        let (events, _events_rx) = mpsc::unbounded_channel();
        let first = factory.create(1, events.clone()).await.expect("first backend");

        let mut stream = audio_stream("me");
        stream.tracks.push(MediaTrack {
            id: "me-cam-1".to_owned(),
            kind: TrackKind::Video,
            source: CaptureSource::Camera,
        });
        first.replace_local_tracks(&stream).await.expect("camera on");
        let mut ids = factory.tracks().local_ids();
        ids.sort();
        assert_eq!(ids, vec!["me-cam-1".to_owned(), "me-mic".to_owned()]);

        stream.tracks.retain(|track| track.kind == TrackKind::Audio);
        first.replace_local_tracks(&stream).await.expect("camera off");
        assert_eq!(factory.tracks().local_ids(), vec!["me-mic".to_owned()]);
        assert!(factory.tracks().local("me-cam-1").is_none());

        // The rebuilt backend takes over the id before the old one closes.
        let second = factory.create(2, events).await.expect("second backend");
        second.replace_local_tracks(&stream).await.expect("reattach");
        first.close().await.expect("close first");
        assert!(factory.tracks().local("me-mic").is_some());

        second.close().await.expect("close second");
        assert!(factory.tracks().local_ids().is_empty());
        assert!(factory.tracks().remote_ids().is_empty());
    }

    #[test]
    fn error_text_classifies_wrong_state() {
        assert!(to_backend_error("invalid proposed signaling state transition").is_wrong_state());
        assert_eq!(to_backend_error("connection closed"), BackendError::Closed);
        assert!(matches!(to_backend_error("dtls handshake failed"), BackendError::Failed(_)));
    }
}
