//! Call types and data structures

use crate::identity::PeerId;
use crate::media::{LocalTrack, MediaErrorCategory, MediaStream};
use crate::transport::RemoteStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for one call attempt
///
/// A fresh id is minted every time a session leaves `Idle`, so work started
/// for an earlier attempt can recognise that it has gone stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call, as announced in `call:initiate` / `call:incoming`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Voice,
    /// Audio and camera video
    Video,
}

impl CallType {
    /// Whether this call type carries video
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }

    /// Wire name of the call type
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No active call
    Idle,
    /// Outgoing call announced, waiting for the callee
    Calling,
    /// Incoming call waiting for a local decision
    Ringing,
    /// Call accepted, offer/answer in progress
    Connecting,
    /// Negotiation complete or transport connected
    Connected,
}

impl CallState {
    /// Whether a session exists in this state
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Check whether the call state machine permits `from -> to`
    ///
    /// ```text
    ///   Idle ──initiate──► Calling ──accepted──► Connecting ──negotiated──► Connected
    ///     │                                          ▲
    ///     └──incoming──► Ringing ──accept────────────┘
    ///
    ///   any active state ──end / ended / rejected / transport lost──► Idle
    /// ```
    #[must_use]
    pub fn can_transition(from: CallState, to: CallState) -> bool {
        matches!(
            (from, to),
            (CallState::Idle, CallState::Calling)
                | (CallState::Idle, CallState::Ringing)
                | (CallState::Calling, CallState::Connecting)
                | (CallState::Ringing, CallState::Connecting)
                | (CallState::Connecting, CallState::Connected)
                | (CallState::Calling, CallState::Idle)
                | (CallState::Ringing, CallState::Idle)
                | (CallState::Connecting, CallState::Idle)
                | (CallState::Connected, CallState::Idle)
        )
    }
}

/// Why a session returned to `Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote peer sent `call:ended`
    RemoteHangup,
    /// Local user declined an incoming call
    Rejected,
    /// Remote peer declined our call
    Declined,
    /// Transport reported disconnected, failed or closed
    TransportLost,
    /// Creating or applying a session description failed
    NegotiationFailed,
    /// Capture devices could not be opened
    MediaUnavailable,
    /// Nobody answered before the ring timeout
    TimedOut,
}

/// Call event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// Session state moved
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        old: CallState,
        /// New state
        new: CallState,
    },
    /// Incoming call received
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Announced call type
        call_type: CallType,
        /// Caller
        from: PeerId,
    },
    /// Remote peer declined our call
    Declined {
        /// Call identifier
        call_id: CallId,
    },
    /// Camera or microphone could not be opened
    MediaDenied {
        /// Error category
        category: MediaErrorCategory,
        /// Human-readable explanation
        message: String,
    },
    /// Call attempt failed
    Failed {
        /// Call identifier
        call_id: CallId,
        /// Error description
        reason: String,
    },
    /// Unanswered call was cancelled
    TimedOut {
        /// Call identifier
        call_id: CallId,
    },
    /// Outgoing video now comes from a different camera
    CameraSwitched {
        /// Call identifier
        call_id: CallId,
        /// Device now in use
        device_id: String,
    },
    /// Call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
    },
}

/// Observable view of the call session
///
/// Published through a `watch` channel every time anything in the session
/// changes, so any front end can render from one value.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Current state
    pub state: CallState,
    /// Current call attempt, if any
    pub call_id: Option<CallId>,
    /// Call type, if any
    pub call_type: Option<CallType>,
    /// Whether the session started from a remote offer
    pub is_incoming: bool,
    /// The other participant
    pub remote_peer_id: Option<PeerId>,
    /// Local capture stream
    pub local_stream: Option<MediaStream>,
    /// Stream received from the peer
    pub remote_stream: Option<RemoteStream>,
    /// Local audio tracks disabled
    pub audio_muted: bool,
    /// Local video tracks enabled
    pub video_enabled: bool,
    /// When the call reached `Connected`
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    /// Snapshot of an idle session
    #[must_use]
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            call_id: None,
            call_type: None,
            is_incoming: false,
            remote_peer_id: None,
            local_stream: None,
            remote_stream: None,
            audio_muted: false,
            video_enabled: true,
            connected_at: None,
        }
    }

    /// Outgoing video track
    #[must_use]
    pub fn local_video_track(&self) -> Option<Arc<LocalTrack>> {
        self.local_stream
            .as_ref()
            .and_then(MediaStream::video_track)
            .cloned()
    }

    /// Time spent connected so far
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// Render a call duration as `mm:ss`
#[must_use]
pub fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
