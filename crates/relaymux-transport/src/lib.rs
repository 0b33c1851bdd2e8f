//! # RELAYMUX Transport
//!
//! Physical connections for the RELAYMUX relay protocol.
//!
//! This crate provides:
//! - The `Connection`, `Listener` and `Dialer` traits the relay is written against
//! - A TCP stream variant with read and write deadlines
//! - A secure UDP datagram variant (`XChaCha20-Poly1305` per datagram)
//! - An injectable endpoint cache for interned remote addresses

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod datagram;
pub mod endpoint;
pub mod stream;
pub mod transport;

pub use datagram::{
    DatagramConfig, DatagramDialer, DatagramListener, DatagramSession, MAX_DATAGRAM_PAYLOAD,
    NORMAL_CLOSURE, SessionKey,
};
pub use endpoint::{Endpoint, EndpointCache};
pub use stream::{StreamConnection, StreamDialer, StreamListener};
pub use transport::{
    CloseSignal, Connection, Dialer, Listener, TransportError, TransportKind, TransportResult,
    TransportStats,
};
