//! Call service orchestration
//!
//! [`CallService`] wires a signaling channel to a [`CallSessionManager`] and
//! pumps inbound signals into it.

use crate::call::CallSessionManager;
use crate::config::CallConfig;
use crate::media::{MediaDevices, VirtualMediaDevices};
use crate::signaling::{SignalingChannel, SignalingError, SignalingHandler};
use crate::transport::{PeerTransportFactory, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Signaling failed while running
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Peer transport setup failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Signaling pump around a call session manager
pub struct CallService {
    signaling: Arc<SignalingHandler>,
    manager: CallSessionManager,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("signaling", &self.signaling)
            .field("manager", &self.manager)
            .finish()
    }
}

impl CallService {
    /// Create a builder
    #[must_use]
    pub fn builder() -> CallServiceBuilder {
        CallServiceBuilder::new()
    }

    /// The call session manager
    #[must_use]
    pub fn manager(&self) -> &CallSessionManager {
        &self.manager
    }

    /// The signaling handler
    #[must_use]
    pub fn signaling(&self) -> &Arc<SignalingHandler> {
        &self.signaling
    }

    /// Feed inbound signals to the manager until the channel closes or
    /// [`shutdown`](Self::shutdown) is called
    ///
    /// Negotiation errors are logged; the manager has already torn the call
    /// down by the time they surface here.
    ///
    /// # Errors
    ///
    /// Returns error if no channel is attached or receiving fails
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ServiceError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        tracing::info!("Call service started");

        loop {
            let signal = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                signal = self.signaling.recv() => signal?,
            };
            let Some(signal) = signal else {
                tracing::info!("Signaling channel closed");
                break;
            };
            if let Err(e) = self.manager.handle_signal(signal).await {
                tracing::warn!(error = %e, recoverable = e.is_recoverable(), "Signal handling failed");
            }
        }

        tracing::info!("Call service stopped");
        Ok(())
    }

    /// Stop [`run`](Self::run), leaving any call in place
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Call service builder
pub struct CallServiceBuilder {
    config: CallConfig,
    media: Option<Arc<dyn MediaDevices>>,
    transports: Option<Arc<dyn PeerTransportFactory>>,
    channel: Option<Arc<dyn SignalingChannel>>,
}

impl Default for CallServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CallServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CallConfig::default(),
            media: None,
            transports: None,
            channel: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set capture devices (default: [`VirtualMediaDevices::with_default_devices`])
    #[must_use]
    pub fn with_media(mut self, media: Arc<dyn MediaDevices>) -> Self {
        self.media = Some(media);
        self
    }

    /// Set the peer transport factory
    #[must_use]
    pub fn with_transports(mut self, transports: Arc<dyn PeerTransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Attach a signaling channel
    #[must_use]
    pub fn with_channel(mut self, channel: Arc<dyn SignalingChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Build the service
    ///
    /// Without an explicit transport factory the `webrtc` backed one is used
    /// when the `webrtc-transport` feature is enabled.
    ///
    /// # Errors
    ///
    /// Returns error if no transport factory is available or it fails to initialize
    pub fn build(self) -> Result<CallService, ServiceError> {
        let transports = match self.transports {
            Some(transports) => transports,
            None => default_transports()?,
        };
        let media = self
            .media
            .unwrap_or_else(|| Arc::new(VirtualMediaDevices::with_default_devices()));
        let signaling = Arc::new(match self.channel {
            Some(channel) => SignalingHandler::new(channel),
            None => SignalingHandler::detached(),
        });
        let manager =
            CallSessionManager::new(self.config, media, transports, Arc::clone(&signaling));
        let (shutdown, _) = watch::channel(false);
        Ok(CallService {
            signaling,
            manager,
            shutdown,
        })
    }
}

#[cfg(feature = "webrtc-transport")]
fn default_transports() -> Result<Arc<dyn PeerTransportFactory>, ServiceError> {
    Ok(Arc::new(crate::webrtc_transport::WebRtcTransportFactory::new()?))
}

#[cfg(not(feature = "webrtc-transport"))]
fn default_transports() -> Result<Arc<dyn PeerTransportFactory>, ServiceError> {
    Err(ServiceError::InitError(
        "no peer transport factory configured".to_string(),
    ))
}
