//! Peer transport backed by the `webrtc` crate
//!
//! Each local track is published as a sample track (Opus for audio, VP8 for
//! video) sharing one stream id per connection, so the peer sees a single
//! stream. Kinds the call wants to receive but does not send get a
//! receive-only transceiver before the offer is created.

use crate::config::IceServer;
use crate::media::{LocalTrack, MediaKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::transport::{
    OfferOptions, PeerConnectionState, PeerTransport, PeerTransportFactory, RemoteTrackInfo,
    SenderId, TransportConfig, TransportError, TransportEvent, TransportEventSink,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn setup_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Setup(e.to_string())
}

fn negotiation_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

fn track_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Track(e.to_string())
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        MediaKind::Audio => MIME_TYPE_OPUS,
        MediaKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

fn rtp_kind(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

/// Creates [`WebRtcPeerTransport`]s sharing one media engine setup
pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    /// Build the API with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new() -> Result<Self, TransportError> {
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
        Ok(Self { api })
    }
}

impl std::fmt::Debug for WebRtcTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransportFactory").finish_non_exhaustive()
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(setup_error)?,
        );
        let transport = WebRtcPeerTransport::new(pc, events);
        transport.register_handlers();
        tracing::debug!(
            stream_id = %transport.stream_id,
            ice_servers = config.ice_servers.len(),
            "Peer connection created"
        );
        Ok(Arc::new(transport))
    }
}

struct SenderSlot {
    sender: Arc<RTCRtpSender>,
    kind: MediaKind,
}

#[derive(Default)]
struct Senders {
    slots: HashMap<SenderId, SenderSlot>,
    next_id: u32,
    recv_only: Vec<MediaKind>,
}

impl Senders {
    fn sends(&self, kind: MediaKind) -> bool {
        self.slots.values().any(|s| s.kind == kind)
    }
}

/// One `RTCPeerConnection`
pub struct WebRtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    events: TransportEventSink,
    stream_id: String,
    senders: Mutex<Senders>,
}

impl WebRtcPeerTransport {
    fn new(pc: Arc<RTCPeerConnection>, events: TransportEventSink) -> Self {
        Self {
            pc,
            events,
            stream_id: format!("murmur-{}", uuid::Uuid::new_v4()),
            senders: Mutex::new(Senders::default()),
        }
    }

    fn register_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::debug!(state = %state, "Peer connection state");
                let _ = events.send(TransportEvent::ConnectionState(connection_state(state)));
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => return,
                };
                let info = RemoteTrackInfo {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                };
                tracing::debug!(track_id = %info.track_id, kind = ?kind, "Remote track");
                let _ = events.send(TransportEvent::RemoteTrack(info));
            })
        }));
    }

    fn sample_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            self.stream_id.clone(),
        ))
    }

    /// Add a receive-only transceiver for a kind the peer should send but we don't
    async fn ensure_receiving(&self, kind: MediaKind) -> Result<(), TransportError> {
        {
            let senders = self.senders.lock();
            if senders.sends(kind) || senders.recv_only.contains(&kind) {
                return Ok(());
            }
        }
        self.pc
            .add_transceiver_from_kind(
                rtp_kind(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(negotiation_error)?;
        self.senders.lock().recv_only.push(kind);
        Ok(())
    }
}

/// Tracks the remote side announces in its description. Remote media is known
/// from the `a=msid` lines long before the first packet makes `on_track` fire.
fn announced_tracks(description: &RTCSessionDescription) -> Vec<RemoteTrackInfo> {
    let parsed = match description.unmarshal() {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read tracks from remote description");
            return Vec::new();
        }
    };
    parsed
        .media_descriptions
        .iter()
        .filter_map(|media| {
            let kind = match media.media_name.media.as_str() {
                "audio" => MediaKind::Audio,
                "video" => MediaKind::Video,
                _ => return None,
            };
            // The peer does not send on these
            if media.attribute("recvonly").is_some() || media.attribute("inactive").is_some() {
                return None;
            }
            let (stream_id, track_id) = media.attribute("msid")??.split_once(' ')?;
            Some(RemoteTrackInfo {
                track_id: track_id.to_string(),
                stream_id: stream_id.to_string(),
                kind,
            })
        })
        .collect()
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(negotiation_error)
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, TransportError> {
        let local = self.sample_track(&track);
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(track_error)?;
        let mut senders = self.senders.lock();
        senders.next_id += 1;
        let id = SenderId(senders.next_id);
        senders.slots.insert(
            id,
            SenderSlot {
                sender,
                kind: track.kind(),
            },
        );
        tracing::debug!(sender = %id, track_id = %track.id(), kind = ?track.kind(), "Track added");
        Ok(id)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<LocalTrack>,
    ) -> Result<(), TransportError> {
        let rtp_sender = {
            let senders = self.senders.lock();
            let slot = senders
                .slots
                .get(&sender)
                .ok_or(TransportError::UnknownSender(sender))?;
            if slot.kind != track.kind() {
                return Err(TransportError::Track(format!(
                    "{sender} carries {:?}, not {:?}",
                    slot.kind,
                    track.kind()
                )));
            }
            Arc::clone(&slot.sender)
        };
        let local = self.sample_track(&track);
        rtp_sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(track_error)
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, TransportError> {
        if options.receive_audio {
            self.ensure_receiving(MediaKind::Audio).await?;
        }
        if options.receive_video {
            self.ensure_receiving(MediaKind::Video).await?;
        }
        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc(description)?;
        let announced = announced_tracks(&description);
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation_error)?;
        // on_track reports the same ids again once media flows
        for info in announced {
            tracing::debug!(track_id = %info.track_id, kind = ?info.kind, "Remote track announced");
            let _ = self.events.send(TransportEvent::RemoteTrack(info));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.senders.lock().slots.clear();
        self.pc.close().await.map_err(setup_error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_ice_server_mapping() {
        let server = IceServer {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        };
        let rtc = rtc_ice_server(&server);
        assert_eq!(rtc.urls, server.urls);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "secret");

        let rtc = rtc_ice_server(&IceServer::new("stun:stun.l.google.com:19302"));
        assert!(rtc.username.is_empty());
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Connected),
            PeerConnectionState::Connected
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            PeerConnectionState::Failed
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
    }

    #[tokio::test]
    async fn test_offer_includes_local_and_receive_only_media() {
        let factory = WebRtcTransportFactory::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&TransportConfig::default(), tx)
            .await
            .unwrap();

        let mic = Arc::new(LocalTrack::new(MediaKind::Audio, "mic-0", "Microphone"));
        let sender = transport.add_track(mic).await.unwrap();
        assert_eq!(sender, SenderId(1));

        let offer = transport
            .create_offer(OfferOptions {
                receive_audio: true,
                receive_video: true,
            })
            .await
            .unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_tracks_reported_from_description() {
        let factory = WebRtcTransportFactory::new().unwrap();
        let (caller_tx, _caller_rx) = mpsc::unbounded_channel();
        let caller = factory
            .create(&TransportConfig::default(), caller_tx)
            .await
            .unwrap();
        let (callee_tx, mut callee_rx) = mpsc::unbounded_channel();
        let callee = factory
            .create(&TransportConfig::default(), callee_tx)
            .await
            .unwrap();

        let mic = Arc::new(LocalTrack::new(MediaKind::Audio, "mic-0", "Microphone"));
        let cam = Arc::new(LocalTrack::new(MediaKind::Video, "cam-front", "Front"));
        caller.add_track(mic.clone()).await.unwrap();
        caller.add_track(cam.clone()).await.unwrap();
        let offer = caller
            .create_offer(OfferOptions {
                receive_audio: true,
                receive_video: true,
            })
            .await
            .unwrap();
        callee.set_remote_description(offer).await.unwrap();

        let mut tracks = Vec::new();
        while let Ok(event) = callee_rx.try_recv() {
            if let TransportEvent::RemoteTrack(info) = event {
                tracks.push(info);
            }
        }
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].kind, MediaKind::Audio);
        assert_eq!(tracks[0].track_id, mic.id().to_string());
        assert_eq!(tracks[1].kind, MediaKind::Video);
        assert_eq!(tracks[1].track_id, cam.id().to_string());
        assert_eq!(tracks[0].stream_id, tracks[1].stream_id);

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[test]
    fn test_receive_only_media_is_not_a_remote_track() {
        let sdp = "v=0\r\n\
o=- 1 1 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=msid:stream-1 mic-0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=recvonly\r\n\
a=rtpmap:96 VP8/90000\r\n";
        let description = RTCSessionDescription::answer(sdp.to_string()).unwrap();
        assert_eq!(
            announced_tracks(&description),
            vec![RemoteTrackInfo {
                track_id: "mic-0".to_string(),
                stream_id: "stream-1".to_string(),
                kind: MediaKind::Audio,
            }]
        );
    }

    #[tokio::test]
    async fn test_replace_track_checks_sender() {
        let factory = WebRtcTransportFactory::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&TransportConfig::default(), tx)
            .await
            .unwrap();

        let cam = Arc::new(LocalTrack::new(MediaKind::Video, "cam-front", "Front"));
        let mic = Arc::new(LocalTrack::new(MediaKind::Audio, "mic-0", "Microphone"));
        let sender = transport.add_track(cam).await.unwrap();

        assert_eq!(
            transport.replace_track(SenderId(99), mic.clone()).await,
            Err(TransportError::UnknownSender(SenderId(99)))
        );
        assert!(matches!(
            transport.replace_track(sender, mic).await,
            Err(TransportError::Track(_))
        ));

        let rear = Arc::new(LocalTrack::new(MediaKind::Video, "cam-rear", "Rear"));
        transport.replace_track(sender, rear).await.unwrap();
        transport.close().await.unwrap();
    }
}
