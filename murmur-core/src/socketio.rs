//! Engine.IO v4 / Socket.IO v5 text framing
//!
//! Only what a signaling client needs over a WebSocket: the engine packet
//! layer (open, ping/pong, message, close) and the socket packet layer
//! (namespace connect, events, acks). Binary attachments are rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default namespace
pub const DEFAULT_NAMESPACE: &str = "/";

/// Packet framing errors
#[derive(Error, Debug)]
pub enum PacketError {
    /// Empty frame
    #[error("Empty packet")]
    Empty,

    /// Unknown packet type digit
    #[error("Unknown packet type: {0:?}")]
    UnknownType(char),

    /// Payload is not valid JSON
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary events and acks are not supported
    #[error("Binary attachments are not supported")]
    BinaryUnsupported,

    /// Ack id does not fit in u64
    #[error("Invalid ack id")]
    InvalidAckId,

    /// Engine handshake missing or malformed
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),
}

// ============================================================================
// Engine.IO
// ============================================================================

/// Engine.IO handshake sent with the `open` packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Engine session id
    pub sid: String,
    /// Transports the server can upgrade to
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Server ping interval in milliseconds
    pub ping_interval: u64,
    /// Time the server waits for a pong, in milliseconds
    pub ping_timeout: u64,
    /// Largest payload the server accepts
    #[serde(default)]
    pub max_payload: Option<u64>,
}

/// Engine.IO packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    /// `0` handshake
    Open(OpenHandshake),
    /// `1` close
    Close,
    /// `2` ping with optional probe data
    Ping(String),
    /// `3` pong echoing the ping data
    Pong(String),
    /// `4` Socket.IO payload
    Message(String),
    /// `5` transport upgrade
    Upgrade,
    /// `6` no-op
    Noop,
}

impl EnginePacket {
    /// Encode as a WebSocket text frame
    ///
    /// # Errors
    ///
    /// Returns error if the handshake cannot be serialized
    pub fn encode(&self) -> Result<String, PacketError> {
        Ok(match self {
            Self::Open(handshake) => format!("0{}", serde_json::to_string(handshake)?),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        })
    }

    /// Decode a WebSocket text frame
    ///
    /// # Errors
    ///
    /// Returns error for empty frames, unknown types or a malformed handshake
    pub fn decode(frame: &str) -> Result<Self, PacketError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();
        Ok(match kind {
            '0' => Self::Open(
                serde_json::from_str(rest)
                    .map_err(|e| PacketError::InvalidHandshake(e.to_string()))?,
            ),
            '1' => Self::Close,
            '2' => Self::Ping(rest.to_string()),
            '3' => Self::Pong(rest.to_string()),
            '4' => Self::Message(rest.to_string()),
            '5' => Self::Upgrade,
            '6' => Self::Noop,
            other => return Err(PacketError::UnknownType(other)),
        })
    }
}

// ============================================================================
// Socket.IO
// ============================================================================

/// Socket.IO packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPacketKind {
    /// `0` namespace connect (client) or connected (server)
    Connect,
    /// `1` namespace disconnect
    Disconnect,
    /// `2` event
    Event,
    /// `3` acknowledgement
    Ack,
    /// `4` namespace connection refused
    ConnectError,
}

impl SocketPacketKind {
    fn digit(self) -> char {
        match self {
            Self::Connect => '0',
            Self::Disconnect => '1',
            Self::Event => '2',
            Self::Ack => '3',
            Self::ConnectError => '4',
        }
    }
}

/// Socket.IO packet carried inside an engine `message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPacket {
    /// Packet type
    pub kind: SocketPacketKind,
    /// Namespace, `/` by default
    pub namespace: String,
    /// Acknowledgement id
    pub ack_id: Option<u64>,
    /// JSON payload
    pub data: Option<Value>,
}

impl SocketPacket {
    /// Namespace connect request
    #[must_use]
    pub fn connect(namespace: &str) -> Self {
        Self {
            kind: SocketPacketKind::Connect,
            namespace: namespace.to_string(),
            ack_id: None,
            data: None,
        }
    }

    /// Event `name` with one payload argument
    #[must_use]
    pub fn event(namespace: &str, name: &str, payload: Value) -> Self {
        Self {
            kind: SocketPacketKind::Event,
            namespace: namespace.to_string(),
            ack_id: None,
            data: Some(Value::Array(vec![Value::String(name.to_string()), payload])),
        }
    }

    /// Event name and first argument, if this is an event
    ///
    /// A missing argument is reported as an empty object, which is how the
    /// server's argument-less emits look to a JavaScript handler.
    #[must_use]
    pub fn event_parts(&self) -> Option<(String, Value)> {
        if self.kind != SocketPacketKind::Event {
            return None;
        }
        let Some(Value::Array(items)) = &self.data else {
            return None;
        };
        let mut items = items.iter();
        let name = items.next()?.as_str()?.to_string();
        let payload = match items.next() {
            Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
            Some(value) => value.clone(),
        };
        Some((name, payload))
    }

    /// Session id the server returned with a namespace `CONNECT`
    #[must_use]
    pub fn connect_sid(&self) -> Option<String> {
        if self.kind != SocketPacketKind::Connect {
            return None;
        }
        self.data
            .as_ref()?
            .get("sid")?
            .as_str()
            .map(ToString::to_string)
    }

    /// Encode as the payload of an engine `message`
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized
    pub fn encode(&self) -> Result<String, PacketError> {
        let mut out = String::new();
        out.push(self.kind.digit());
        if self.namespace != DEFAULT_NAMESPACE {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&serde_json::to_string(data)?);
        }
        Ok(out)
    }

    /// Decode the payload of an engine `message`
    ///
    /// # Errors
    ///
    /// Returns error for unknown types, binary packets or invalid JSON
    pub fn decode(payload: &str) -> Result<Self, PacketError> {
        let mut chars = payload.chars();
        let kind = match chars.next().ok_or(PacketError::Empty)? {
            '0' => SocketPacketKind::Connect,
            '1' => SocketPacketKind::Disconnect,
            '2' => SocketPacketKind::Event,
            '3' => SocketPacketKind::Ack,
            '4' => SocketPacketKind::ConnectError,
            '5' | '6' => return Err(PacketError::BinaryUnsupported),
            other => return Err(PacketError::UnknownType(other)),
        };
        let mut rest = chars.as_str();

        let namespace = if rest.starts_with('/') {
            let end = rest.find(',').unwrap_or(rest.len());
            let nsp = rest[..end].to_string();
            rest = rest.get(end + 1..).unwrap_or("");
            nsp
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|_| PacketError::InvalidAckId)?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        Ok(Self {
            kind,
            namespace,
            ack_id,
            data,
        })
    }
}
