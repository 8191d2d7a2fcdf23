//! Peer transport seam
//!
//! The call layer drives one peer connection per session through
//! [`PeerTransport`]. Implementations report asynchronous happenings (local
//! ICE candidates, remote tracks, connection state) through a
//! [`TransportEventSink`] handed over at creation.

use crate::config::IceServer;
use crate::media::{LocalTrack, MediaKind};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer connection could not be created
    #[error("Connection setup failed: {0}")]
    Setup(String),

    /// Creating or applying a session description failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Candidate was rejected
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    /// Adding or replacing a track failed
    #[error("Track operation failed: {0}")]
    Track(String),

    /// Sender id does not belong to this connection
    #[error("Unknown sender: {0}")]
    UnknownSender(SenderId),

    /// Connection already closed
    #[error("Connection closed")]
    Closed,
}

/// Handle for an outgoing track slot on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderId(pub u32);

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sender-{}", self.0)
    }
}

/// What the local side wants to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferOptions {
    /// Ask the peer for audio
    pub receive_audio: bool,
    /// Ask the peer for video
    pub receive_video: bool,
}

/// Coarse connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    /// Created, nothing attempted yet
    New,
    /// Connectivity checks running
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Closed locally or remotely
    Closed,
}

impl PeerConnectionState {
    /// States the call layer treats as the remote side hanging up
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// One track received from the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    /// Track id
    pub track_id: String,
    /// Remote stream the track belongs to
    pub stream_id: String,
    /// Audio or video
    pub kind: MediaKind,
}

/// Stream received from the peer, for rendering
///
/// The transport owns the underlying media; the session only keeps this
/// description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Remote stream id
    pub id: String,
    /// Tracks received so far
    pub tracks: Vec<RemoteTrackInfo>,
}

impl RemoteStream {
    /// Stream containing a single track
    #[must_use]
    pub fn from_track(track: RemoteTrackInfo) -> Self {
        Self {
            id: track.stream_id.clone(),
            tracks: vec![track],
        }
    }

    /// Add a track of the same stream; returns false if it was already present
    pub fn merge(&mut self, track: RemoteTrackInfo) -> bool {
        if self.tracks.iter().any(|t| t.track_id == track.track_id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Whether the stream carries video
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }
}

/// Asynchronous notification from a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Local ICE candidate gathered
    LocalCandidate(IceCandidate),
    /// Remote track arrived
    RemoteTrack(RemoteTrackInfo),
    /// Connection state changed
    ConnectionState(PeerConnectionState),
}

/// Channel a transport reports events into
pub type TransportEventSink = mpsc::UnboundedSender<TransportEvent>;

/// Peer connection configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    /// NAT traversal servers
    pub ice_servers: Vec<IceServer>,
}

/// One end of a peer-to-peer media session
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track; each track gets its own sender
    ///
    /// # Errors
    ///
    /// Returns error if the track cannot be attached
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, TransportError>;

    /// Swap the track behind `sender` without renegotiating
    ///
    /// # Errors
    ///
    /// Returns error if the sender is unknown or the swap fails
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<LocalTrack>,
    ) -> Result<(), TransportError>;

    /// Create an offer
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be generated
    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, TransportError>;

    /// Create an answer to the applied remote offer
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer is set or generation fails
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a local description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply a remote description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if shutdown fails
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates peer transports
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a connection that reports into `events`
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be created
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, kind: MediaKind) -> RemoteTrackInfo {
        RemoteTrackInfo {
            track_id: id.to_string(),
            stream_id: "remote".to_string(),
            kind,
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(PeerConnectionState::Disconnected.is_terminal());
        assert!(PeerConnectionState::Failed.is_terminal());
        assert!(PeerConnectionState::Closed.is_terminal());
        assert!(!PeerConnectionState::Connected.is_terminal());
        assert!(!PeerConnectionState::Connecting.is_terminal());
        assert!(!PeerConnectionState::New.is_terminal());
    }

    #[test]
    fn test_remote_stream_merge() {
        let mut stream = RemoteStream::from_track(track("a", MediaKind::Audio));
        assert!(!stream.has_video());

        assert!(stream.merge(track("v", MediaKind::Video)));
        assert!(!stream.merge(track("v", MediaKind::Video)));
        assert_eq!(stream.tracks.len(), 2);
        assert!(stream.has_video());
        assert_eq!(stream.id, "remote");
    }
}
