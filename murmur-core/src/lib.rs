//! Murmur - one-to-one voice and video call sessions
//!
//! This library manages the lifecycle of a single call between two chat
//! partners: placing, ringing, accepting, rejecting and ending calls, the
//! offer/answer/ICE exchange over a Socket.IO signaling server, and local
//! capture devices. It features:
//!
//! - **Single owned session**: one call at a time, published as a `watch` snapshot
//! - **Socket.IO signaling**: Engine.IO v4 client with automatic reconnection
//! - **Ordered ICE handling**: early remote candidates are queued and applied in order
//! - **Pluggable transport**: the `webrtc` crate by default, scripted mocks for tests
//!
//! # Examples
//!
//! ```rust,no_run
//! use murmur_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let channel = SocketIoChannel::connect(SignalingConfig::default()).await?;
//! let service = CallService::builder()
//!     .with_channel(Arc::new(channel))
//!     .build()?;
//!
//! let manager = service.manager().clone();
//! tokio::spawn(async move { service.run().await });
//!
//! manager
//!     .initiate_call(CallType::Video, PeerId::new("partner-socket-id")?)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Peer identifiers
pub mod identity;

/// Call and signaling configuration
pub mod config;

/// Capture devices, tracks and streams
pub mod media;

/// Signaling wire contract and channel seam
pub mod signaling;

/// Engine.IO / Socket.IO packet codec
pub mod socketio;

/// Socket.IO signaling client
pub mod channel;

/// In-process signaling relay
pub mod relay;

/// Peer transport seam
pub mod transport;

/// Peer transport backed by the `webrtc` crate
#[cfg(feature = "webrtc-transport")]
pub mod webrtc_transport;

/// Call session manager
pub mod call;

/// Call service and builder
pub mod service;

/// Scripted collaborators for tests and demos
pub mod testing;

// Re-export main types at crate root
pub use call::{CallError, CallSessionManager, PendingCandidates};
pub use channel::{ChannelEvent, SocketIoChannel};
pub use config::{CallConfig, IceServer, SignalingConfig};
pub use identity::{EmptyPeerId, PeerId};
pub use media::{
    LocalTrack, MediaConstraints, MediaDeviceInfo, MediaDevices, MediaError, MediaErrorCategory,
    MediaKind, MediaStream, VirtualMediaDevices,
};
pub use relay::{MemoryRelay, RelayChannel};
pub use service::{CallService, CallServiceBuilder, ServiceError};
pub use signaling::{
    IceCandidate, InboundSignal, OutboundSignal, SessionDescription, SignalingChannel,
    SignalingError, SignalingHandler,
};
pub use transport::{
    PeerConnectionState, PeerTransport, PeerTransportFactory, RemoteStream, TransportError,
    TransportEvent,
};
pub use types::*;
#[cfg(feature = "webrtc-transport")]
pub use webrtc_transport::{WebRtcPeerTransport, WebRtcTransportFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallSessionManager};
    pub use crate::channel::SocketIoChannel;
    pub use crate::config::{CallConfig, SignalingConfig};
    pub use crate::identity::PeerId;
    pub use crate::media::{MediaDevices, MediaErrorCategory, VirtualMediaDevices};
    pub use crate::relay::MemoryRelay;
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::signaling::{SignalingChannel, SignalingHandler};
    pub use crate::transport::PeerTransportFactory;
    pub use crate::types::{CallEvent, CallId, CallSnapshot, CallState, CallType, EndReason};
    #[cfg(feature = "webrtc-transport")]
    pub use crate::webrtc_transport::WebRtcTransportFactory;
}
