//! Peer identity
//!
//! The signaling server hands every connected participant an opaque identifier
//! (the socket id). The call layer never interprets it; it only stores it and
//! echoes it back in `to` fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a peer identifier cannot be constructed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Peer identifier must not be empty")]
pub struct EmptyPeerId;

/// Opaque identifier of a signaling participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier
    ///
    /// # Errors
    ///
    /// Returns [`EmptyPeerId`] if `id` is empty or whitespace
    pub fn new(id: impl Into<String>) -> Result<Self, EmptyPeerId> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(EmptyPeerId);
        }
        Ok(Self(id))
    }

    /// Identifier of the form `{prefix}-{n}`, for generated participants
    pub(crate) fn numbered(prefix: &str, n: u64) -> Self {
        Self(format!("{prefix}-{n}"))
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = EmptyPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = EmptyPeerId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}
