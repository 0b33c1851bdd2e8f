//! Relay protocol frame definitions.

use crate::error::{RelayError, Result};
use crate::{MAX_FRAME_SIZE, MAX_PEER_ID_LEN};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity a client registers under.
///
/// Opaque to the relay; the only constraints are non-empty and at most
/// [`MAX_PEER_ID_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap a peer id
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidPeerId` if the id is empty or longer than
    /// [`MAX_PEER_ID_LEN`] bytes.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(RelayError::InvalidPeerId("empty".to_string()));
        }
        if id.len() > MAX_PEER_ID_LEN {
            return Err(RelayError::InvalidPeerId(format!(
                "{} bytes (max {MAX_PEER_ID_LEN})",
                id.len()
            )));
        }
        Ok(Self(id))
    }

    /// The id as a string slice
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
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = RelayError;

    fn try_from(id: String) -> Result<Self> {
        Self::new(id)
    }
}

impl TryFrom<&str> for PeerId {
    type Error = RelayError;

    fn try_from(id: &str) -> Result<Self> {
        Self::new(id)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Relay protocol frames
///
/// `Data` and `Close` name the destination on client-to-server frames and
/// the source on server-to-client frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    /// Client registers under a peer id (first frame on every connection)
    Register {
        /// Requested peer id, validated by the server
        peer_id: String,
    },

    /// Server accepted the registration
    RegisterOk,

    /// Server refused the registration
    RegisterErr {
        /// Rejection code
        code: RegisterErrorCode,
        /// Human-readable reason
        reason: String,
    },

    /// Payload for one virtual connection
    Data {
        /// Destination (outbound) or source (inbound) peer
        peer_id: PeerId,
        /// Opaque payload
        payload: Vec<u8>,
    },

    /// One side closed its virtual connection
    Close {
        /// Destination (outbound) or source (inbound) peer
        peer_id: PeerId,
    },

    /// Liveness check, answered by the server
    Keepalive,
}

/// Registration rejection codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RegisterErrorCode {
    /// Another connection holds this peer id
    AlreadyRegistered = 1,
    /// Server at capacity
    ServerFull = 2,
    /// Peer id is empty or too long
    InvalidPeerId = 3,
    /// First frame was not a registration
    InvalidMessage = 4,
}

impl fmt::Display for RegisterErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterErrorCode::AlreadyRegistered => "already registered",
            RegisterErrorCode::ServerFull => "server full",
            RegisterErrorCode::InvalidPeerId => "invalid peer id",
            RegisterErrorCode::InvalidMessage => "invalid message",
        };
        f.write_str(name)
    }
}

fn encode_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

fn decode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_SIZE as u64)
}

impl Frame {
    /// Serialize frame to bytes
    ///
    /// # Errors
    ///
    /// Returns `RelayError::FrameTooLarge` if the encoding exceeds
    /// [`MAX_FRAME_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = encode_options()
            .serialize(self)
            .map_err(|e| RelayError::Serialization(e.to_string()))?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(RelayError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize frame from bytes
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is oversized, malformed, carries trailing
    /// bytes or names an invalid peer id.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(RelayError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        decode_options()
            .deserialize(bytes)
            .map_err(|e| RelayError::Deserialization(e.to_string()))
    }

    /// Get the frame type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "Register",
            Frame::RegisterOk => "RegisterOk",
            Frame::RegisterErr { .. } => "RegisterErr",
            Frame::Data { .. } => "Data",
            Frame::Close { .. } => "Close",
            Frame::Keepalive => "Keepalive",
        }
    }
}
