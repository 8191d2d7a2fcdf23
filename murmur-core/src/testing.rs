//! Scripted collaborators
//!
//! A peer transport that records every operation and a signaling channel that
//! records every emit. Used by the test suite and by offline demos.

use crate::identity::PeerId;
use crate::media::{LocalTrack, MediaKind};
use crate::signaling::{
    IceCandidate, InboundSignal, OutboundSignal, SdpType, SessionDescription, SignalingChannel,
    SignalingError,
};
use crate::transport::{
    OfferOptions, PeerConnectionState, PeerTransport, PeerTransportFactory, RemoteTrackInfo,
    SenderId, TransportConfig, TransportError, TransportEvent, TransportEventSink,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Operation recorded by [`MockPeerTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    /// `add_track` with the track id
    AddTrack(String),
    /// `replace_track` with the sender and new track id
    ReplaceTrack(SenderId, String),
    /// `create_offer`
    CreateOffer(OfferOptions),
    /// `create_answer`
    CreateAnswer,
    /// `set_local_description`
    SetLocal(SdpType),
    /// `set_remote_description`
    SetRemote(SdpType),
    /// `add_ice_candidate` with the candidate line
    AddCandidate(String),
    /// `close`
    Close,
}

/// Knobs for transports created by [`MockTransportFactory`]
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Refuse to create connections
    pub fail_create: bool,
    /// `create_offer` fails
    pub fail_create_offer: bool,
    /// `set_remote_description` fails
    pub fail_set_remote: bool,
    /// `replace_track` fails
    pub fail_replace_track: bool,
    /// `create_offer` waits for this to be notified
    pub offer_gate: Option<Arc<Notify>>,
    /// Host candidates reported after the local description is set
    pub local_candidates: usize,
    /// Report `connected` once both descriptions are applied
    pub connect_when_negotiated: bool,
}

#[derive(Default)]
struct MockState {
    ops: Vec<MockOp>,
    senders: HashMap<SenderId, String>,
    next_sender: u32,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    sends_video: bool,
    closed: bool,
    events: Option<TransportEventSink>,
}

/// Peer transport that records operations and produces placeholder SDP
pub struct MockPeerTransport {
    behavior: MockBehavior,
    state: Mutex<MockState>,
}

impl MockPeerTransport {
    /// Transport reporting into `events`
    #[must_use]
    pub fn new(behavior: MockBehavior, events: TransportEventSink) -> Self {
        Self {
            behavior,
            state: Mutex::new(MockState {
                events: Some(events),
                ..MockState::default()
            }),
        }
    }

    /// Operations so far
    #[must_use]
    pub fn ops(&self) -> Vec<MockOp> {
        self.state.lock().ops.clone()
    }

    /// Candidate lines applied, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                MockOp::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Track currently behind `sender`
    #[must_use]
    pub fn sender_track(&self, sender: SenderId) -> Option<String> {
        self.state.lock().senders.get(&sender).cloned()
    }

    /// Number of senders
    #[must_use]
    pub fn sender_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    /// Whether `close` was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether a remote description has been applied
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    /// Report an event as if the network produced it
    pub fn inject(&self, event: TransportEvent) {
        if let Some(events) = &self.state.lock().events {
            let _ = events.send(event);
        }
    }

    fn record(&self, op: MockOp) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.ops.push(op);
        Ok(())
    }

    fn placeholder_sdp(kind: SdpType, video: bool) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=type:{kind:?}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            Uuid::new_v4().as_u128() % 1_000_000_000
        );
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }

    fn after_description(&self, local_changed: bool) {
        let (events, local_set, both_set, remote_video) = {
            let state = self.state.lock();
            (
                state.events.clone(),
                state.local.is_some(),
                state.local.is_some() && state.remote.is_some(),
                state
                    .remote
                    .as_ref()
                    .is_some_and(|d| d.sdp.contains("m=video")),
            )
        };
        let Some(events) = events else {
            return;
        };
        if both_set {
            let stream_id = format!("stream-{}", Uuid::new_v4());
            let _ = events.send(TransportEvent::RemoteTrack(RemoteTrackInfo {
                track_id: Uuid::new_v4().to_string(),
                stream_id: stream_id.clone(),
                kind: MediaKind::Audio,
            }));
            if remote_video {
                let _ = events.send(TransportEvent::RemoteTrack(RemoteTrackInfo {
                    track_id: Uuid::new_v4().to_string(),
                    stream_id,
                    kind: MediaKind::Video,
                }));
            }
            if self.behavior.connect_when_negotiated {
                let _ = events.send(TransportEvent::ConnectionState(
                    PeerConnectionState::Connected,
                ));
            }
        }
        if local_changed && local_set {
            for n in 0..self.behavior.local_candidates {
                let _ = events.send(TransportEvent::LocalCandidate(IceCandidate::new(
                    format!("candidate:{n} 1 udp 2122260223 192.0.2.{} 5000{n} typ host", n + 1),
                    Some("0".to_string()),
                    Some(0),
                )));
            }
        }
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, TransportError> {
        self.record(MockOp::AddTrack(track.id().to_string()))?;
        let mut state = self.state.lock();
        let sender = SenderId(state.next_sender);
        state.next_sender += 1;
        state.senders.insert(sender, track.id().to_string());
        if track.kind() == MediaKind::Video {
            state.sends_video = true;
        }
        Ok(sender)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<LocalTrack>,
    ) -> Result<(), TransportError> {
        self.record(MockOp::ReplaceTrack(sender, track.id().to_string()))?;
        if self.behavior.fail_replace_track {
            return Err(TransportError::Track("replace refused".to_string()));
        }
        let mut state = self.state.lock();
        match state.senders.get_mut(&sender) {
            Some(slot) => {
                *slot = track.id().to_string();
                Ok(())
            }
            None => Err(TransportError::UnknownSender(sender)),
        }
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, TransportError> {
        if let Some(gate) = &self.behavior.offer_gate {
            gate.notified().await;
        }
        self.record(MockOp::CreateOffer(options))?;
        if self.behavior.fail_create_offer {
            return Err(TransportError::Negotiation("offer refused".to_string()));
        }
        let video = options.receive_video || self.state.lock().sends_video;
        Ok(SessionDescription::offer(Self::placeholder_sdp(
            SdpType::Offer,
            video,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(MockOp::CreateAnswer)?;
        let state = self.state.lock();
        let Some(remote) = &state.remote else {
            return Err(TransportError::Negotiation(
                "no remote offer to answer".to_string(),
            ));
        };
        let video = remote.sdp.contains("m=video");
        Ok(SessionDescription::answer(Self::placeholder_sdp(
            SdpType::Answer,
            video,
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockOp::SetLocal(description.sdp_type))?;
        self.state.lock().local = Some(description);
        self.after_description(true);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockOp::SetRemote(description.sdp_type))?;
        if self.behavior.fail_set_remote {
            return Err(TransportError::Negotiation(
                "remote description refused".to_string(),
            ));
        }
        self.state.lock().remote = Some(description);
        self.after_description(false);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !self.has_remote_description() {
            return Err(TransportError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        self.record(MockOp::AddCandidate(candidate.candidate))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.closed {
            state.ops.push(MockOp::Close);
            state.closed = true;
            if let Some(events) = state.events.take() {
                let _ = events.send(TransportEvent::ConnectionState(PeerConnectionState::Closed));
            }
        }
        Ok(())
    }
}

/// Factory for [`MockPeerTransport`]s that keeps every transport it made
#[derive(Default)]
pub struct MockTransportFactory {
    behavior: MockBehavior,
    created: Mutex<Vec<Arc<MockPeerTransport>>>,
}

impl MockTransportFactory {
    /// Factory with default behavior
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose transports follow `behavior`
    #[must_use]
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Every transport created so far
    #[must_use]
    pub fn created(&self) -> Vec<Arc<MockPeerTransport>> {
        self.created.lock().clone()
    }

    /// Most recent transport
    #[must_use]
    pub fn last(&self) -> Option<Arc<MockPeerTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self.behavior.fail_create {
            return Err(TransportError::Setup("factory refused".to_string()));
        }
        let transport = Arc::new(MockPeerTransport::new(self.behavior.clone(), events));
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Signaling channel that records emits and replays scripted inbound signals
pub struct RecordingChannel {
    id: PeerId,
    connected: AtomicBool,
    sent: Mutex<Vec<OutboundSignal>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<InboundSignal>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundSignal>>,
    hold: Mutex<Option<Arc<Notify>>>,
}

impl RecordingChannel {
    /// Connected channel for participant `id`
    #[must_use]
    pub fn new(id: PeerId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            hold: Mutex::new(None),
        }
    }

    /// Keep each emit in flight after recording it until `gate` is notified.
    /// `None` lets emits complete immediately again.
    pub fn hold_emits(&self, gate: Option<Arc<Notify>>) {
        *self.hold.lock() = gate;
    }

    /// Signals emitted so far
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().clone()
    }

    /// Event names emitted so far
    #[must_use]
    pub fn sent_events(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(OutboundSignal::event_name).collect()
    }

    /// How many times `event` was emitted
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.sent_events().iter().filter(|e| **e == event).count()
    }

    /// Forget recorded emits
    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Queue a signal for `next_signal`
    pub fn push_inbound(&self, signal: InboundSignal) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(signal);
        }
    }

    /// Simulate the connection dropping or coming back
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// End the inbound stream; `next_signal` returns `None` once drained
    pub fn close(&self) {
        self.inbound_tx.lock().take();
    }
}

#[async_trait]
impl SignalingChannel for RecordingChannel {
    async fn emit(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(signal);
        let gate = self.hold.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn next_signal(&self) -> Result<Option<InboundSignal>, SignalingError> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn local_id(&self) -> Option<PeerId> {
        Some(self.id.clone())
    }
}
