//! Call session management
//!
//! [`CallSessionManager`] owns the one call a participant can be in at a time.
//! It turns user intent (place, accept, reject, hang up) and inbound signals
//! into peer transport operations and outbound signals, and publishes every
//! change through a `watch` snapshot plus a `broadcast` event stream.
//!
//! # Call flow
//!
//! ```text
//!   caller                          server                          callee
//!   initiate_call ── call:initiate ──►  ── call:incoming ──────────► Ringing
//!   Calling                                                         accept_call
//!   Connecting ◄── call:accepted ───── ◄── call:accept ──────────── Connecting
//!   create offer ── webrtc:offer ────► ── webrtc:offer ───────────► apply, answer
//!   Connected  ◄── webrtc:answer ───── ◄── webrtc:answer ────────── Connected
//! ```
//!
//! A side is `Connected` once both descriptions are applied, or earlier if the
//! transport reports a connected media path.
//!
//! # Concurrency
//!
//! Session fields live behind a synchronous lock that is never held across an
//! await. Offer, answer and remote-candidate handling are serialized by a
//! separate async lock. Teardown takes neither; every negotiation step
//! re-checks the call id after each await and drops its result if the session
//! it started for is gone.

use crate::config::CallConfig;
use crate::identity::PeerId;
use crate::media::{
    next_camera, DeviceKind, MediaConstraints, MediaDevices, MediaError, MediaKind,
    MediaStream, VideoConstraints,
};
use crate::signaling::{
    IceCandidate, InboundSignal, OutboundSignal, SessionDescription, SignalingHandler,
};
use crate::transport::{
    OfferOptions, PeerConnectionState, PeerTransport, PeerTransportFactory, RemoteStream,
    SenderId, TransportConfig, TransportError, TransportEvent,
};
use crate::types::{CallEvent, CallId, CallSnapshot, CallState, CallType, EndReason};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Operation not allowed in the current state
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallState),

    /// Nobody to answer
    #[error("No remote peer to answer")]
    MissingRemotePeer,

    /// Signaling channel absent or disconnected
    #[error("Signaling channel unavailable")]
    SignalingUnavailable,

    /// No call in progress
    #[error("No active call")]
    NotInCall,

    /// The call sends no video
    #[error("Call has no outgoing video")]
    NoVideo,

    /// Only one camera is available
    #[error("No other camera available")]
    NoAlternateCamera,

    /// The call attempt ended while the operation was in flight
    #[error("Call attempt was superseded")]
    Stale,

    /// Media acquisition failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Peer transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallError {
    /// Whether the user can retry or carry on
    ///
    /// Transport and negotiation failures end the call attempt; everything
    /// else leaves the session consistent and usable.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

// ============================================================================
// Pending candidates
// ============================================================================

/// Remote ICE candidates received before the remote description was applied
///
/// Kept in receipt order and handed out exactly once.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    /// Empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Remove and return every queued candidate in receipt order
    pub fn take_all(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    /// Number of queued candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ============================================================================
// Session
// ============================================================================

struct Session {
    call_id: CallId,
    state: CallState,
    call_type: CallType,
    is_incoming: bool,
    remote_peer: PeerId,
    /// The peer knows this call exists
    announced: bool,
    local_stream: Option<MediaStream>,
    remote_stream: Option<RemoteStream>,
    transport: Option<Arc<dyn PeerTransport>>,
    video_sender: Option<SenderId>,
    remote_description_set: bool,
    pending: PendingCandidates,
    audio_muted: bool,
    video_enabled: bool,
    connected_at: Option<DateTime<Utc>>,
    ring_timer: Option<JoinHandle<()>>,
}

impl Session {
    fn new(call_type: CallType, remote_peer: PeerId, is_incoming: bool) -> Self {
        Self {
            call_id: CallId::new(),
            state: if is_incoming {
                CallState::Ringing
            } else {
                CallState::Calling
            },
            call_type,
            is_incoming,
            remote_peer,
            announced: is_incoming,
            local_stream: None,
            remote_stream: None,
            transport: None,
            video_sender: None,
            remote_description_set: false,
            pending: PendingCandidates::new(),
            audio_muted: false,
            video_enabled: true,
            connected_at: None,
            ring_timer: None,
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            call_id: Some(self.call_id),
            call_type: Some(self.call_type),
            is_incoming: self.is_incoming,
            remote_peer_id: Some(self.remote_peer.clone()),
            local_stream: self.local_stream.clone(),
            remote_stream: self.remote_stream.clone(),
            audio_muted: self.audio_muted,
            video_enabled: self.video_enabled,
            connected_at: self.connected_at,
        }
    }

    /// Waiting for the remote description; the transport may already report connected
    fn is_negotiating(&self) -> bool {
        matches!(self.state, CallState::Connecting | CallState::Connected)
            && !self.remote_description_set
    }

    fn apply_track_flags(&self) {
        if let Some(stream) = &self.local_stream {
            for track in stream.audio_tracks() {
                track.set_enabled(!self.audio_muted);
            }
            for track in stream.video_tracks() {
                track.set_enabled(self.video_enabled);
            }
        }
    }
}

/// Whether the peer must be told with `call:end` when a session ends this way
fn notifies_peer(reason: EndReason) -> bool {
    matches!(
        reason,
        EndReason::LocalHangup | EndReason::TransportLost | EndReason::NegotiationFailed
    )
}

struct Inner {
    config: CallConfig,
    media: Arc<dyn MediaDevices>,
    transports: Arc<dyn PeerTransportFactory>,
    signaling: Arc<SignalingHandler>,
    session: Mutex<Option<Session>>,
    negotiation: tokio::sync::Mutex<()>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl Inner {
    fn publish(&self, session: Option<&Session>) {
        let snapshot = session.map_or_else(CallSnapshot::idle, Session::snapshot);
        self.snapshot_tx.send_replace(snapshot);
    }

    fn notify(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn transition(&self, session: &mut Session, to: CallState) -> bool {
        let from = session.state;
        if !CallState::can_transition(from, to) {
            tracing::warn!(
                call_id = %session.call_id,
                old_state = ?from,
                new_state = ?to,
                "Rejected invalid state transition"
            );
            return false;
        }
        session.state = to;
        if to == CallState::Connected {
            session.connected_at = Some(Utc::now());
        }
        tracing::debug!(
            call_id = %session.call_id,
            old_state = ?from,
            new_state = ?to,
            "Call state changed"
        );
        self.notify(CallEvent::StateChanged {
            call_id: session.call_id,
            old: from,
            new: to,
        });
        true
    }

    /// Run `f` on the session if it is still the one `call_id` names
    fn with_session<R>(
        &self,
        call_id: CallId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, CallError> {
        let mut guard = self.session.lock();
        match guard.as_mut() {
            Some(session) if session.call_id == call_id => {
                let result = f(session);
                self.publish(Some(session));
                Ok(result)
            }
            _ => Err(CallError::Stale),
        }
    }

    fn is_current(&self, call_id: CallId) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.call_id == call_id)
    }

    fn ensure_current(&self, call_id: CallId) -> Result<(), CallError> {
        if self.is_current(call_id) {
            Ok(())
        } else {
            Err(CallError::Stale)
        }
    }

    fn transport_for(&self, call_id: CallId) -> Result<Arc<dyn PeerTransport>, CallError> {
        let guard = self.session.lock();
        match guard.as_ref() {
            Some(session) if session.call_id == call_id => {
                session.transport.clone().ok_or_else(|| {
                    CallError::Transport(TransportError::Setup(
                        "peer connection not ready".to_string(),
                    ))
                })
            }
            _ => Err(CallError::Stale),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Call session manager
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct CallSessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionManager")
            .field("state", &self.state())
            .finish()
    }
}

impl CallSessionManager {
    /// Create a manager with an idle session
    #[must_use]
    pub fn new(
        config: CallConfig,
        media: Arc<dyn MediaDevices>,
        transports: Arc<dyn PeerTransportFactory>,
        signaling: Arc<SignalingHandler>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(CallSnapshot::idle());
        let (event_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(Inner {
                config,
                media,
                transports,
                signaling,
                session: Mutex::new(None),
                negotiation: tokio::sync::Mutex::new(()),
                snapshot_tx,
                event_tx,
            }),
        }
    }

    /// Watch the session snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(CallState::Idle, |s| s.state)
    }

    /// Remote candidates waiting for a remote description
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(0, |s| s.pending.len())
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    /// Place a call to `partner`
    ///
    /// Acquires local media, creates the peer connection, attaches every
    /// local track and announces the call. The session is `Calling` from the
    /// start so a second attempt is refused while this one is being set up.
    ///
    /// # Errors
    ///
    /// - [`CallError::SignalingUnavailable`] if signaling is down; the session stays idle
    /// - [`CallError::InvalidState`] if a call is already in progress; nothing changes
    /// - [`CallError::Media`] if capture fails; the session returns to idle
    #[tracing::instrument(skip_all, fields(call_type = %call_type, peer = %partner))]
    pub async fn initiate_call(
        &self,
        call_type: CallType,
        partner: PeerId,
    ) -> Result<CallId, CallError> {
        let inner = &self.inner;
        if !inner.signaling.is_available() {
            tracing::warn!("Cannot place a call without a signaling connection");
            return Err(CallError::SignalingUnavailable);
        }

        let call_id = {
            let mut guard = inner.session.lock();
            if let Some(existing) = guard.as_ref() {
                tracing::warn!(current_state = ?existing.state, "Call already in progress");
                return Err(CallError::InvalidState(existing.state));
            }
            let session = Session::new(call_type, partner, false);
            let call_id = session.call_id;
            inner.notify(CallEvent::StateChanged {
                call_id,
                old: CallState::Idle,
                new: CallState::Calling,
            });
            inner.publish(Some(&session));
            *guard = Some(session);
            call_id
        };
        tracing::info!(call_id = %call_id, "Placing call");

        self.prepare_media(call_id, call_type).await?;

        inner.with_session(call_id, |s| s.announced = true)?;
        inner
            .signaling
            .emit(OutboundSignal::Initiate { call_type })
            .await;
        self.start_ring_timer(call_id);
        Ok(call_id)
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// - [`CallError::MissingRemotePeer`] if nothing is ringing; nothing changes
    /// - [`CallError::InvalidState`] if the session is past ringing
    /// - [`CallError::Media`] if capture fails; the caller is sent `call:reject`
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<CallId, CallError> {
        let inner = &self.inner;
        let (call_id, call_type, peer) = {
            let mut guard = inner.session.lock();
            let Some(session) = guard.as_mut() else {
                tracing::warn!("No incoming call to accept");
                return Err(CallError::MissingRemotePeer);
            };
            if session.state != CallState::Ringing {
                tracing::warn!(current_state = ?session.state, "Call is not ringing");
                return Err(CallError::InvalidState(session.state));
            }
            if let Some(timer) = session.ring_timer.take() {
                timer.abort();
            }
            inner.transition(session, CallState::Connecting);
            inner.publish(Some(session));
            (session.call_id, session.call_type, session.remote_peer.clone())
        };
        tracing::info!(call_id = %call_id, peer = %peer, "Accepting call");

        self.prepare_media(call_id, call_type).await?;

        inner.ensure_current(call_id)?;
        inner
            .signaling
            .emit(OutboundSignal::Accept { to: peer })
            .await;
        Ok(call_id)
    }

    /// Decline the ringing call without touching capture devices
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] if the session is not ringing
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let (call_id, peer) = {
            let guard = self.inner.session.lock();
            match guard.as_ref() {
                Some(s) if s.state == CallState::Ringing => (s.call_id, s.remote_peer.clone()),
                Some(s) => return Err(CallError::InvalidState(s.state)),
                None => return Err(CallError::InvalidState(CallState::Idle)),
            }
        };
        tracing::info!(call_id = %call_id, peer = %peer, "Rejecting call");
        self.inner
            .signaling
            .emit(OutboundSignal::Reject { to: peer })
            .await;
        self.teardown(Some(call_id), EndReason::Rejected).await;
        Ok(())
    }

    /// Hang up. Safe to call in any state.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) {
        if !self.teardown(None, EndReason::LocalHangup).await {
            tracing::debug!("No call to end");
        }
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotInCall`] when idle
    pub fn set_audio_muted(&self, muted: bool) -> Result<(), CallError> {
        let mut guard = self.inner.session.lock();
        let session = guard.as_mut().ok_or(CallError::NotInCall)?;
        session.audio_muted = muted;
        session.apply_track_flags();
        tracing::debug!(call_id = %session.call_id, muted, "Microphone toggled");
        self.inner.publish(Some(session));
        Ok(())
    }

    /// Turn the outgoing camera on or off
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotInCall`] when idle
    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let mut guard = self.inner.session.lock();
        let session = guard.as_mut().ok_or(CallError::NotInCall)?;
        session.video_enabled = enabled;
        session.apply_track_flags();
        tracing::debug!(call_id = %session.call_id, enabled, "Camera toggled");
        self.inner.publish(Some(session));
        Ok(())
    }

    /// Send video from another camera without renegotiating
    ///
    /// With `device_id` of `None` the next camera in enumeration order is
    /// used. The old track keeps running until the connection has accepted
    /// the new one.
    ///
    /// # Errors
    ///
    /// Returns error if there is no call with video, no other camera, or the
    /// new camera cannot be opened or attached; the current video is untouched
    #[tracing::instrument(skip(self))]
    pub async fn switch_camera(&self, device_id: Option<String>) -> Result<String, CallError> {
        let inner = &self.inner;
        let _negotiation = inner.negotiation.lock().await;

        let (call_id, transport, sender, current, video_enabled) = {
            let guard = inner.session.lock();
            let session = guard.as_ref().ok_or(CallError::NotInCall)?;
            let (Some(transport), Some(sender)) = (session.transport.clone(), session.video_sender)
            else {
                return Err(CallError::NoVideo);
            };
            let current = session
                .local_stream
                .as_ref()
                .and_then(MediaStream::video_track)
                .map(|t| t.device_id().to_string());
            (
                session.call_id,
                transport,
                sender,
                current,
                session.video_enabled,
            )
        };

        let devices = inner.media.enumerate_devices().await?;
        let target = match device_id {
            Some(id) => devices
                .iter()
                .find(|d| d.kind == DeviceKind::VideoInput && d.device_id == id)
                .ok_or_else(|| MediaError::DeviceNotFound(id.clone()))?,
            None => next_camera(&devices, current.as_deref()).ok_or(CallError::NoAlternateCamera)?,
        };
        if current.as_deref() == Some(target.device_id.as_str()) {
            return Ok(target.device_id.clone());
        }

        let constraints = MediaConstraints::camera(VideoConstraints {
            device_id: Some(target.device_id.clone()),
            ..inner.config.video.clone()
        });
        let stream = inner.media.get_user_media(&constraints).await?;
        let Some(new_track) = stream.video_track().cloned() else {
            stream.stop_all();
            return Err(MediaError::DeviceNotFound(target.device_id.clone()).into());
        };
        new_track.set_enabled(video_enabled);

        if let Err(e) = transport.replace_track(sender, new_track.clone()).await {
            tracing::warn!(call_id = %call_id, error = %e, "Camera switch failed, keeping current camera");
            new_track.stop();
            return Err(e.into());
        }

        let swapped = inner.with_session(call_id, |s| {
            let old = s
                .local_stream
                .as_ref()
                .and_then(|stream| stream.video_track().cloned());
            if let Some(stream) = &s.local_stream {
                s.local_stream = Some(stream.with_video(new_track.clone()));
            }
            old
        });
        let old = match swapped {
            Ok(old) => old,
            Err(e) => {
                new_track.stop();
                return Err(e);
            }
        };
        if let Some(old) = old {
            old.stop();
        }

        let device_id = new_track.device_id().to_string();
        tracing::info!(call_id = %call_id, device_id = %device_id, "Camera switched");
        inner.notify(CallEvent::CameraSwitched {
            call_id,
            device_id: device_id.clone(),
        });
        Ok(device_id)
    }

    /// React to a signal from the server
    ///
    /// # Errors
    ///
    /// Returns the negotiation error after the call has been torn down
    #[tracing::instrument(skip_all, fields(event = signal.event_name()))]
    pub async fn handle_signal(&self, signal: InboundSignal) -> Result<(), CallError> {
        match signal {
            InboundSignal::Incoming { call_type, from } => {
                self.on_incoming(call_type, from);
                Ok(())
            }
            InboundSignal::Accepted { from } => self.on_accepted(from).await,
            InboundSignal::Rejected => {
                self.on_rejected().await;
                Ok(())
            }
            InboundSignal::Ended => {
                self.teardown(None, EndReason::RemoteHangup).await;
                Ok(())
            }
            InboundSignal::Offer { offer, from } => self.on_offer(offer, from).await,
            InboundSignal::Answer { answer } => self.on_answer(answer).await,
            InboundSignal::IceCandidate { candidate } => {
                self.on_remote_candidate(candidate).await;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Signal handlers
    // ------------------------------------------------------------------------

    fn on_incoming(&self, call_type: CallType, from: PeerId) {
        let inner = &self.inner;
        let call_id = {
            let mut guard = inner.session.lock();
            if let Some(existing) = guard.as_ref() {
                tracing::warn!(
                    call_id = %existing.call_id,
                    caller = %from,
                    "Ignoring incoming call while busy"
                );
                return;
            }
            let session = Session::new(call_type, from.clone(), true);
            let call_id = session.call_id;
            inner.notify(CallEvent::StateChanged {
                call_id,
                old: CallState::Idle,
                new: CallState::Ringing,
            });
            inner.publish(Some(&session));
            *guard = Some(session);
            call_id
        };
        tracing::info!(call_id = %call_id, caller = %from, call_type = %call_type, "Incoming call");
        inner.notify(CallEvent::IncomingCall {
            call_id,
            call_type,
            from,
        });
        self.start_ring_timer(call_id);
    }

    async fn on_accepted(&self, from: PeerId) -> Result<(), CallError> {
        let inner = &self.inner;
        let _negotiation = inner.negotiation.lock().await;
        let (call_id, call_type) = {
            let mut guard = inner.session.lock();
            match guard.as_mut() {
                Some(s) if !s.is_incoming && s.state == CallState::Calling => {
                    if let Some(timer) = s.ring_timer.take() {
                        timer.abort();
                    }
                    s.remote_peer = from;
                    inner.transition(s, CallState::Connecting);
                    inner.publish(Some(s));
                    (s.call_id, s.call_type)
                }
                Some(s) => {
                    tracing::warn!(current_state = ?s.state, "Ignoring call:accepted");
                    return Ok(());
                }
                None => {
                    tracing::debug!("Ignoring call:accepted with no call");
                    return Ok(());
                }
            }
        };
        tracing::info!(call_id = %call_id, "Call accepted, sending offer");
        let result = self.send_offer(call_id, call_type).await;
        self.settle(call_id, result).await
    }

    async fn send_offer(&self, call_id: CallId, call_type: CallType) -> Result<(), CallError> {
        let inner = &self.inner;
        let transport = inner.transport_for(call_id)?;
        let offer = transport
            .create_offer(OfferOptions {
                receive_audio: true,
                receive_video: call_type.has_video(),
            })
            .await?;
        inner.ensure_current(call_id)?;
        transport.set_local_description(offer.clone()).await?;
        inner.ensure_current(call_id)?;
        inner.signaling.emit(OutboundSignal::Offer { offer }).await;
        Ok(())
    }

    async fn on_offer(&self, offer: SessionDescription, from: PeerId) -> Result<(), CallError> {
        let inner = &self.inner;
        let _negotiation = inner.negotiation.lock().await;
        let call_id = {
            let mut guard = inner.session.lock();
            match guard.as_mut() {
                Some(s) if s.is_incoming && s.is_negotiating() => {
                    s.remote_peer = from.clone();
                    s.call_id
                }
                other => {
                    tracing::warn!(
                        current_state = ?other.map(|s| s.state),
                        "Ignoring unexpected offer"
                    );
                    return Ok(());
                }
            }
        };
        let result = self.answer_offer(call_id, offer, from).await;
        self.settle(call_id, result).await
    }

    async fn answer_offer(
        &self,
        call_id: CallId,
        offer: SessionDescription,
        from: PeerId,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let transport = inner.transport_for(call_id)?;
        transport.set_remote_description(offer).await?;
        self.remote_description_applied(call_id, &transport).await?;

        let answer = transport.create_answer().await?;
        inner.ensure_current(call_id)?;
        transport.set_local_description(answer.clone()).await?;
        inner.ensure_current(call_id)?;
        inner
            .signaling
            .emit(OutboundSignal::Answer { answer, to: from })
            .await;
        self.negotiation_complete(call_id)
    }

    async fn on_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        let inner = &self.inner;
        let _negotiation = inner.negotiation.lock().await;
        let call_id = {
            let guard = inner.session.lock();
            match guard.as_ref() {
                Some(s) if !s.is_incoming && s.is_negotiating() => s.call_id,
                other => {
                    tracing::warn!(
                        current_state = ?other.map(|s| s.state),
                        "Ignoring unexpected answer"
                    );
                    return Ok(());
                }
            }
        };
        let result = async {
            let transport = inner.transport_for(call_id)?;
            transport.set_remote_description(answer).await?;
            self.remote_description_applied(call_id, &transport).await?;
            self.negotiation_complete(call_id)
        }
        .await;
        self.settle(call_id, result).await
    }

    /// Mark the remote description as set and apply queued candidates in order
    async fn remote_description_applied(
        &self,
        call_id: CallId,
        transport: &Arc<dyn PeerTransport>,
    ) -> Result<(), CallError> {
        let queued = self.inner.with_session(call_id, |s| {
            s.remote_description_set = true;
            s.pending.take_all()
        })?;
        if !queued.is_empty() {
            tracing::debug!(call_id = %call_id, count = queued.len(), "Applying queued ICE candidates");
        }
        for candidate in queued {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(call_id = %call_id, error = %e, "Queued ICE candidate rejected");
            }
        }
        Ok(())
    }

    fn negotiation_complete(&self, call_id: CallId) -> Result<(), CallError> {
        let inner = &self.inner;
        inner.with_session(call_id, |s| {
            if s.state == CallState::Connecting {
                inner.transition(s, CallState::Connected);
            }
        })
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) {
        let inner = &self.inner;
        let _negotiation = inner.negotiation.lock().await;
        let (call_id, transport) = {
            let mut guard = inner.session.lock();
            let Some(session) = guard.as_mut() else {
                tracing::trace!("Ignoring ICE candidate with no call");
                return;
            };
            match (&session.transport, session.remote_description_set) {
                (Some(transport), true) => (session.call_id, transport.clone()),
                _ => {
                    session.pending.push(candidate);
                    tracing::trace!(
                        call_id = %session.call_id,
                        queued = session.pending.len(),
                        "Queued ICE candidate"
                    );
                    return;
                }
            }
        };
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            tracing::warn!(call_id = %call_id, error = %e, "ICE candidate rejected");
        }
    }

    async fn on_rejected(&self) {
        let call_id = self.inner.session.lock().as_ref().map(|s| s.call_id);
        let Some(call_id) = call_id else {
            tracing::debug!("Ignoring call:rejected with no call");
            return;
        };
        tracing::info!(call_id = %call_id, "Call declined by peer");
        self.inner.notify(CallEvent::Declined { call_id });
        self.teardown(Some(call_id), EndReason::Declined).await;
    }

    /// Finish a negotiation step: stale results are dropped, failures end the call
    async fn settle(&self, call_id: CallId, result: Result<(), CallError>) -> Result<(), CallError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if matches!(e, CallError::Stale) || !self.inner.is_current(call_id) => {
                tracing::debug!(call_id = %call_id, "Discarding result for ended call");
                Ok(())
            }
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e, "Negotiation failed");
                self.fail(call_id, &e, EndReason::NegotiationFailed).await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Setup and teardown
    // ------------------------------------------------------------------------

    /// Acquire media, create the connection and attach every track
    async fn prepare_media(&self, call_id: CallId, call_type: CallType) -> Result<(), CallError> {
        let inner = &self.inner;
        let constraints = inner.config.constraints_for(call_type);
        let stream = match inner.media.get_user_media(&constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_media(call_id, &e).await;
                return Err(e.into());
            }
        };
        let stored = inner.with_session(call_id, |s| {
            s.local_stream = Some(stream.clone());
            s.apply_track_flags();
        });
        if let Err(e) = stored {
            stream.stop_all();
            return Err(e);
        }

        let transport = match self.open_transport(call_id).await {
            Ok(transport) => transport,
            Err(e) => {
                self.fail(call_id, &e, EndReason::NegotiationFailed).await;
                return Err(e);
            }
        };

        let mut video_sender = None;
        for track in stream.tracks() {
            match transport.add_track(Arc::clone(track)).await {
                Ok(sender) => {
                    if track.kind() == MediaKind::Video && video_sender.is_none() {
                        video_sender = Some(sender);
                    }
                }
                Err(e) => {
                    let e = CallError::from(e);
                    self.fail(call_id, &e, EndReason::NegotiationFailed).await;
                    return Err(e);
                }
            }
        }
        inner.with_session(call_id, |s| s.video_sender = video_sender)?;
        tracing::debug!(call_id = %call_id, tracks = stream.tracks().len(), "Local tracks attached");
        Ok(())
    }

    async fn open_transport(&self, call_id: CallId) -> Result<Arc<dyn PeerTransport>, CallError> {
        let inner = &self.inner;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = TransportConfig {
            ice_servers: inner.config.ice_servers.clone(),
        };
        let transport = inner.transports.create(&config, events_tx).await?;
        tokio::spawn(pump_transport_events(
            Arc::downgrade(&self.inner),
            call_id,
            events_rx,
        ));

        let stored = inner.with_session(call_id, |s| s.transport = Some(transport.clone()));
        if let Err(e) = stored {
            let _ = transport.close().await;
            return Err(e);
        }
        Ok(transport)
    }

    async fn on_transport_event(&self, call_id: CallId, event: TransportEvent) {
        let inner = &self.inner;
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if inner.is_current(call_id) {
                    inner
                        .signaling
                        .emit(OutboundSignal::IceCandidate { candidate })
                        .await;
                }
            }
            TransportEvent::RemoteTrack(track) => {
                tracing::debug!(
                    call_id = %call_id,
                    track_id = %track.track_id,
                    kind = ?track.kind,
                    "Remote track received"
                );
                let _ = inner.with_session(call_id, |s| match &mut s.remote_stream {
                    Some(stream) if stream.id == track.stream_id => {
                        stream.merge(track);
                    }
                    _ => s.remote_stream = Some(RemoteStream::from_track(track)),
                });
            }
            TransportEvent::ConnectionState(state) => {
                tracing::debug!(call_id = %call_id, connection_state = ?state, "Peer connection state changed");
                if state == PeerConnectionState::Connected {
                    let _ = self.negotiation_complete(call_id);
                } else if state.is_terminal()
                    && self.teardown(Some(call_id), EndReason::TransportLost).await
                {
                    tracing::warn!(call_id = %call_id, connection_state = ?state, "Peer connection lost");
                }
            }
        }
    }

    fn start_ring_timer(&self, call_id: CallId) {
        let Some(timeout) = self.inner.config.ring_timeout else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                CallSessionManager { inner }.on_ring_timeout(call_id).await;
            }
        });
        let mut handle = Some(handle);
        if self
            .inner
            .with_session(call_id, |s| s.ring_timer = handle.take())
            .is_err()
        {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
    }

    async fn on_ring_timeout(&self, call_id: CallId) {
        let inner = &self.inner;
        // Claim the session under the same lock that decides the signal so a
        // racing accept sees Idle instead of a call about to be torn down
        let (session, signal) = {
            let mut guard = inner.session.lock();
            let signal = match guard.as_ref() {
                Some(s) if s.call_id == call_id => match s.state {
                    CallState::Calling => OutboundSignal::End,
                    CallState::Ringing => OutboundSignal::Reject {
                        to: s.remote_peer.clone(),
                    },
                    _ => return,
                },
                _ => return,
            };
            let Some(mut session) = guard.take() else {
                return;
            };
            // Detach rather than abort: this task is the timer
            drop(session.ring_timer.take());
            (session, signal)
        };
        tracing::info!(call_id = %call_id, "Call unanswered, giving up");
        inner.notify(CallEvent::TimedOut { call_id });
        self.release(session, EndReason::TimedOut).await;
        inner.signaling.emit(signal).await;
    }

    async fn fail(&self, call_id: CallId, error: &CallError, reason: EndReason) {
        if !self.inner.is_current(call_id) {
            return;
        }
        self.inner.notify(CallEvent::Failed {
            call_id,
            reason: error.to_string(),
        });
        self.teardown(Some(call_id), reason).await;
    }

    async fn fail_media(&self, call_id: CallId, error: &MediaError) {
        let inner = &self.inner;
        let incoming_from = {
            let guard = inner.session.lock();
            match guard.as_ref() {
                Some(s) if s.call_id == call_id => s.is_incoming.then(|| s.remote_peer.clone()),
                _ => return,
            }
        };
        tracing::warn!(call_id = %call_id, error = %error, "Media acquisition failed");
        inner.notify(CallEvent::MediaDenied {
            category: error.category(),
            message: error.user_message(),
        });
        if let Some(caller) = incoming_from {
            inner
                .signaling
                .emit(OutboundSignal::Reject { to: caller })
                .await;
        }
        self.teardown(Some(call_id), EndReason::MediaUnavailable)
            .await;
    }

    /// Return to idle, releasing everything the session owns
    ///
    /// With `call_id` set, only that call attempt is torn down. Returns
    /// whether a session was ended.
    async fn teardown(&self, call_id: Option<CallId>, reason: EndReason) -> bool {
        let inner = &self.inner;
        let session = {
            let mut guard = inner.session.lock();
            let matches = guard
                .as_ref()
                .is_some_and(|s| call_id.map_or(true, |id| id == s.call_id));
            if matches {
                guard.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            return false;
        };
        self.release(session, reason).await;
        true
    }

    /// Stop everything a session owns once it is out of the slot
    async fn release(&self, mut session: Session, reason: EndReason) {
        let inner = &self.inner;
        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }
        if let Some(stream) = session.local_stream.take() {
            stream.stop_all();
        }
        let dropped = session.pending.len();
        session.pending.clear();
        inner.publish(None);

        tracing::info!(
            call_id = %session.call_id,
            old_state = ?session.state,
            reason = ?reason,
            dropped_candidates = dropped,
            "Call ended"
        );
        inner.notify(CallEvent::StateChanged {
            call_id: session.call_id,
            old: session.state,
            new: CallState::Idle,
        });
        inner.notify(CallEvent::CallEnded {
            call_id: session.call_id,
            reason,
        });

        if session.announced && notifies_peer(reason) {
            inner.signaling.emit(OutboundSignal::End).await;
        }
        if let Some(transport) = session.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(call_id = %session.call_id, error = %e, "Error closing peer connection");
            }
        }
    }
}

async fn pump_transport_events(
    inner: Weak<Inner>,
    call_id: CallId,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = CallSessionManager { inner };
        manager.on_transport_event(call_id, event).await;
        if !manager.inner.is_current(call_id) {
            break;
        }
    }
    tracing::trace!(call_id = %call_id, "Transport event pump stopped");
}
