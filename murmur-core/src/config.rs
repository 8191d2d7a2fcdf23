//! Configuration
//!
//! Defaults match the chat client's production settings.

use crate::media::{AudioConstraints, MediaConstraints, VideoConstraints};
use crate::socketio::DEFAULT_NAMESPACE;
use crate::types::CallType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public STUN servers used when nothing else is configured
pub const DEFAULT_ICE_SERVERS: [&str; 4] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:openrelay.metered.ca:80",
];

/// NAT traversal server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` or `turn:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Server without credentials
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Call session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// NAT traversal servers handed to every peer transport
    pub ice_servers: Vec<IceServer>,
    /// Cancel an unanswered call after this long; `None` waits forever
    #[serde(with = "optional_secs")]
    pub ring_timeout: Option<Duration>,
    /// Microphone constraints
    pub audio: AudioConstraints,
    /// Camera constraints for video calls
    pub video: VideoConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|url| IceServer::new(*url)).collect(),
            ring_timeout: Some(Duration::from_secs(45)),
            audio: AudioConstraints::default(),
            video: VideoConstraints::default(),
        }
    }
}

impl CallConfig {
    /// Capture constraints for a call of `call_type`
    #[must_use]
    pub fn constraints_for(&self, call_type: CallType) -> MediaConstraints {
        if call_type.has_video() {
            MediaConstraints::audio_video(self.audio.clone(), self.video.clone())
        } else {
            MediaConstraints::audio_only(self.audio.clone())
        }
    }
}

/// Socket.IO signaling client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Server base URL (`http(s)://` or `ws(s)://`)
    pub server_url: String,
    /// Socket.IO namespace
    pub namespace: String,
    /// Reconnect after the connection drops
    pub reconnection: bool,
    /// Give up after this many attempts; `None` retries forever
    pub reconnection_attempts: Option<u32>,
    /// First reconnect delay
    #[serde(with = "millis")]
    pub reconnection_delay: Duration,
    /// Upper bound on the reconnect delay
    #[serde(with = "millis")]
    pub reconnection_delay_max: Duration,
    /// Jitter applied to each delay, 0.0 to 1.0
    pub randomization_factor: f64,
    /// Pause before rejoining when the server ends the session itself
    #[serde(with = "millis")]
    pub server_disconnect_delay: Duration,
    /// Connect and handshake timeout
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3001".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            reconnection: true,
            reconnection_attempts: None,
            reconnection_delay: Duration::from_millis(1000),
            reconnection_delay_max: Duration::from_millis(5000),
            randomization_factor: 0.5,
            server_disconnect_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_config_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 4);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(config.ring_timeout, Some(Duration::from_secs(45)));
        assert!(config.audio.echo_cancellation);
        assert_eq!(config.video.ideal_width, 1280);
    }

    #[test]
    fn test_constraints_follow_call_type() {
        let config = CallConfig::default();
        let voice = config.constraints_for(CallType::Voice);
        assert!(voice.audio.is_some());
        assert!(voice.video.is_none());

        let video = config.constraints_for(CallType::Video);
        assert!(video.video.is_some());
    }

    #[test]
    fn test_signaling_defaults() {
        let config = SignalingConfig::default();
        assert!(config.reconnection);
        assert_eq!(config.reconnection_attempts, None);
        assert_eq!(config.reconnection_delay, Duration::from_millis(1000));
        assert_eq!(config.reconnection_delay_max, Duration::from_millis(5000));
        assert_eq!(config.server_disconnect_delay, Duration::from_secs(2));
        assert_eq!(config.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: CallConfig = serde_json::from_str(r#"{"ring_timeout": null}"#).unwrap();
        assert_eq!(config.ring_timeout, None);
        assert_eq!(config.ice_servers.len(), 4);

        let config: SignalingConfig =
            serde_json::from_str(r#"{"server_url": "https://chat.example", "timeout": 5000}"#)
                .unwrap();
        assert_eq!(config.server_url, "https://chat.example");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.namespace, "/");
    }
}
