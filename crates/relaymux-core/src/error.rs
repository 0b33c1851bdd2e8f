//! Error types for the relay protocol
//!
//! Errors fall into four groups so callers can decide what to do with them:
//!
//! - **Registration**: a single `connect` failed; retrying may succeed
//! - **Transport**: the physical connection died; the client reconnects on
//!   its own and open virtual connections report transport-lost
//! - **Protocol**: a frame could not be encoded or decoded
//! - **Misuse**: the call was not valid in the current state

use crate::protocol::RegisterErrorCode;
use relaymux_transport::TransportError;
use thiserror::Error;

/// Errors returned by the relay client, server and virtual connections
#[derive(Debug, Error)]
pub enum RelayError {
    // ============ Registration Errors ============
    /// The server answered the registration with an error frame
    #[error("Registration rejected ({code}): {reason}")]
    RegistrationRejected {
        /// Rejection code sent by the server
        code: RegisterErrorCode,
        /// Human-readable reason sent by the server
        reason: String,
    },

    /// No registration answer within the registration timeout
    #[error("Registration timed out")]
    RegistrationTimeout,

    /// A frame arrived that is not valid at this point of the exchange
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    // ============ Transport Errors ============
    /// The physical connection failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The physical connection under a virtual connection was lost
    #[error("Relay transport lost")]
    TransportLost,

    // ============ Protocol Errors ============
    /// A frame exceeds the maximum frame size
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Encoded or announced frame size
        size: usize,
        /// Largest accepted frame
        max: usize,
    },

    /// Frame serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Frame deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // ============ Misuse Errors ============
    /// The virtual connection is closed
    #[error("Connection is closed")]
    ConnClosed,

    /// The relay client is closed
    #[error("Relay client is closed")]
    ClientClosed,

    /// The relay client is not registered with the server
    #[error("Relay client is not registered")]
    NotRegistered,

    /// The peer id is empty or too long
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),
}

impl RelayError {
    /// Returns true if the operation may succeed when retried later
    ///
    /// Registration failures and transport failures are transient; protocol
    /// and misuse errors are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::RegistrationRejected { .. }
                | RelayError::RegistrationTimeout
                | RelayError::UnexpectedFrame(_)
                | RelayError::Transport(_)
                | RelayError::TransportLost
        )
    }

    /// Returns true if the error means the physical connection is gone
    #[must_use]
    pub fn is_transport_lost(&self) -> bool {
        matches!(self, RelayError::Transport(_) | RelayError::TransportLost)
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
