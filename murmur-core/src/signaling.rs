//! Call signaling protocol
//!
//! Named events with JSON payloads relayed by the chat server between the two
//! participants of a call. Call control (`call:*`) and negotiation
//! (`webrtc:*`) share one ordered channel.

use crate::identity::PeerId;
use crate::socketio::PacketError;
use crate::types::CallType;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Channel is not connected to the server
    #[error("Signaling channel not connected")]
    NotConnected,

    /// Channel shut down for good
    #[error("Signaling channel closed")]
    Closed,

    /// Event payload did not match the wire contract
    #[error("Malformed payload for {event}: {source}")]
    Payload {
        /// Event name
        event: String,
        /// Decoder error
        #[source]
        source: serde_json::Error,
    },

    /// Socket.IO framing error
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Server URL could not be used
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    /// Handshake with the server failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// WebSocket failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

// ============================================================================
// Negotiation payloads
// ============================================================================

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description in the browser's JSON shape (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate bound to a media line
    #[must_use]
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index: index,
            username_fragment: None,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Signals this client sends to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSignal {
    /// `call:initiate {callType}`
    Initiate {
        /// Requested call type
        call_type: CallType,
    },
    /// `call:accept {to}`
    Accept {
        /// Caller
        to: PeerId,
    },
    /// `call:reject {to}`
    Reject {
        /// Caller
        to: PeerId,
    },
    /// `call:end {}`
    End,
    /// `webrtc:offer {offer}`
    Offer {
        /// Local offer
        offer: SessionDescription,
    },
    /// `webrtc:answer {answer, to}`
    Answer {
        /// Local answer
        answer: SessionDescription,
        /// Caller
        to: PeerId,
    },
    /// `webrtc:ice-candidate {candidate}`
    IceCandidate {
        /// Local candidate
        candidate: IceCandidate,
    },
}

impl OutboundSignal {
    /// Event name on the wire
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Initiate { .. } => "call:initiate",
            Self::Accept { .. } => "call:accept",
            Self::Reject { .. } => "call:reject",
            Self::End => "call:end",
            Self::Offer { .. } => "webrtc:offer",
            Self::Answer { .. } => "webrtc:answer",
            Self::IceCandidate { .. } => "webrtc:ice-candidate",
        }
    }

    /// Event name and JSON payload
    #[must_use]
    pub fn to_event(&self) -> (&'static str, Value) {
        let payload = match self {
            Self::Initiate { call_type } => json!({ "callType": call_type }),
            Self::Accept { to } | Self::Reject { to } => json!({ "to": to }),
            Self::End => json!({}),
            Self::Offer { offer } => json!({ "offer": offer }),
            Self::Answer { answer, to } => json!({ "answer": answer, "to": to }),
            Self::IceCandidate { candidate } => json!({ "candidate": candidate }),
        };
        (self.event_name(), payload)
    }
}

/// Signals the server delivers to this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    /// `call:incoming {callType, from}`
    Incoming {
        /// Announced call type
        call_type: CallType,
        /// Caller
        from: PeerId,
    },
    /// `call:accepted {from}`
    Accepted {
        /// Callee
        from: PeerId,
    },
    /// `call:rejected {}`
    Rejected,
    /// `call:ended {}`
    Ended,
    /// `webrtc:offer {offer, from}`
    Offer {
        /// Remote offer
        offer: SessionDescription,
        /// Caller
        from: PeerId,
    },
    /// `webrtc:answer {answer}`
    Answer {
        /// Remote answer
        answer: SessionDescription,
    },
    /// `webrtc:ice-candidate {candidate}`
    IceCandidate {
        /// Remote candidate
        candidate: IceCandidate,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingPayload {
    call_type: CallType,
    from: PeerId,
}

#[derive(Deserialize)]
struct FromPayload {
    from: PeerId,
}

#[derive(Deserialize)]
struct OfferPayload {
    offer: SessionDescription,
    from: PeerId,
}

#[derive(Deserialize)]
struct AnswerPayload {
    answer: SessionDescription,
}

#[derive(Deserialize)]
struct CandidatePayload {
    candidate: IceCandidate,
}

fn decode<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, SignalingError> {
    serde_json::from_value(payload).map_err(|source| SignalingError::Payload {
        event: event.to_string(),
        source,
    })
}

impl InboundSignal {
    /// Event name on the wire
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Incoming { .. } => "call:incoming",
            Self::Accepted { .. } => "call:accepted",
            Self::Rejected => "call:rejected",
            Self::Ended => "call:ended",
            Self::Offer { .. } => "webrtc:offer",
            Self::Answer { .. } => "webrtc:answer",
            Self::IceCandidate { .. } => "webrtc:ice-candidate",
        }
    }

    /// Decode a server event
    ///
    /// Returns `Ok(None)` for events the call layer does not handle (chat
    /// messages, presence and so on).
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Payload`] if a call event has the wrong shape
    pub fn from_event(event: &str, payload: Value) -> Result<Option<Self>, SignalingError> {
        let signal = match event {
            "call:incoming" => {
                let p: IncomingPayload = decode(event, payload)?;
                Self::Incoming {
                    call_type: p.call_type,
                    from: p.from,
                }
            }
            "call:accepted" => {
                let p: FromPayload = decode(event, payload)?;
                Self::Accepted { from: p.from }
            }
            "call:rejected" => Self::Rejected,
            // Some server builds relay the sender's `call:end` verbatim
            "call:ended" | "call:end" => Self::Ended,
            "webrtc:offer" => {
                let p: OfferPayload = decode(event, payload)?;
                Self::Offer {
                    offer: p.offer,
                    from: p.from,
                }
            }
            "webrtc:answer" => {
                let p: AnswerPayload = decode(event, payload)?;
                Self::Answer { answer: p.answer }
            }
            "webrtc:ice-candidate" => {
                let p: CandidatePayload = decode(event, payload)?;
                Self::IceCandidate {
                    candidate: p.candidate,
                }
            }
            other => {
                tracing::trace!(event = other, "Ignoring non-call event");
                return Ok(None);
            }
        };
        Ok(Some(signal))
    }

    /// Event name and JSON payload, as the server would send it
    #[must_use]
    pub fn to_event(&self) -> (&'static str, Value) {
        let payload = match self {
            Self::Incoming { call_type, from } => json!({ "callType": call_type, "from": from }),
            Self::Accepted { from } => json!({ "from": from }),
            Self::Rejected | Self::Ended => json!({}),
            Self::Offer { offer, from } => json!({ "offer": offer, "from": from }),
            Self::Answer { answer } => json!({ "answer": answer }),
            Self::IceCandidate { candidate } => json!({ "candidate": candidate }),
        };
        (self.event_name(), payload)
    }
}

// ============================================================================
// Channel seam
// ============================================================================

/// Bidirectional signaling channel
///
/// Implement this for your relay (Socket.IO, in-process, etc.). The channel
/// owns reconnection; callers only see whether it is currently usable.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a signal to the server
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::NotConnected`] while the connection is down
    async fn emit(&self, signal: OutboundSignal) -> Result<(), SignalingError>;

    /// Wait for the next call signal; `Ok(None)` once the channel has closed
    ///
    /// # Errors
    ///
    /// Returns error if a received event cannot be decoded
    async fn next_signal(&self) -> Result<Option<InboundSignal>, SignalingError>;

    /// Whether emits can currently be delivered
    fn is_connected(&self) -> bool;

    /// Identifier the server assigned to this participant
    fn local_id(&self) -> Option<PeerId>;
}

/// Signaling handler that tolerates an absent channel
///
/// Emits while no channel is attached, or while the channel is reconnecting,
/// are logged and dropped instead of failing the caller.
#[derive(Default)]
pub struct SignalingHandler {
    channel: RwLock<Option<Arc<dyn SignalingChannel>>>,
}

impl SignalingHandler {
    /// Create a handler bound to `channel`
    #[must_use]
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            channel: RwLock::new(Some(channel)),
        }
    }

    /// Create a handler with no channel yet
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }

    /// Attach or replace the channel
    pub fn attach(&self, channel: Arc<dyn SignalingChannel>) {
        *self.channel.write() = Some(channel);
    }

    /// Drop the channel
    pub fn detach(&self) {
        *self.channel.write() = None;
    }

    /// Current channel, if any
    #[must_use]
    pub fn channel(&self) -> Option<Arc<dyn SignalingChannel>> {
        self.channel.read().clone()
    }

    /// Whether a connected channel is attached
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.channel().is_some_and(|c| c.is_connected())
    }

    /// Send a signal; returns whether it was handed to the channel
    #[tracing::instrument(skip(self, signal), fields(event = signal.event_name()))]
    pub async fn emit(&self, signal: OutboundSignal) -> bool {
        let Some(channel) = self.channel() else {
            tracing::warn!("No signaling channel attached, dropping signal");
            return false;
        };
        match channel.emit(signal).await {
            Ok(()) => {
                tracing::debug!("Signal sent");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Signal dropped");
                false
            }
        }
    }

    /// Receive the next call signal
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::NotConnected`] if no channel is attached, or
    /// the channel's own decode error
    pub async fn recv(&self) -> Result<Option<InboundSignal>, SignalingError> {
        let channel = self.channel().ok_or(SignalingError::NotConnected)?;
        let signal = channel.next_signal().await?;
        if let Some(signal) = &signal {
            tracing::debug!(event = signal.event_name(), "Received signal");
        }
        Ok(signal)
    }
}

impl std::fmt::Debug for SignalingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingHandler")
            .field("attached", &self.channel.read().is_some())
            .finish()
    }
}
