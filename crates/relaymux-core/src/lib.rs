//! # RELAYMUX Core
//!
//! Relay multiplexing for peers that cannot reach each other directly.
//!
//! Every endpoint keeps one physical connection open to a relay server and
//! registers under a peer id. Any number of virtual connections to other
//! peers are multiplexed over that single connection; the server routes
//! frames by peer id without looking at payloads.
//!
//! This crate provides:
//! - The wire protocol and its length-prefixed / per-datagram framing
//! - [`RelayServer`]: peer registry and frame router
//! - [`RelayClient`]: registration, demultiplexing and automatic reconnection
//! - [`VirtualConn`]: an ordered byte stream to one remote peer
//!
//! ```no_run
//! use relaymux_core::{PeerId, RelayClient};
//!
//! # async fn example() -> relaymux_core::Result<()> {
//! let client = RelayClient::new("relay.example.net:7478", PeerId::new("alice")?);
//! client.connect().await?;
//!
//! let conn = client.open_conn(&PeerId::new("bob")?)?;
//! conn.write(b"hello bob").await?;
//!
//! let mut buf = [0u8; 1024];
//! let n = conn.read(&mut buf).await?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::time::Duration;

pub mod client;
pub mod codec;
pub mod conn;
pub mod error;
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use client::{RelayClient, RelayClientConfig};
pub use conn::VirtualConn;
pub use error::{RelayError, Result};
pub use protocol::{Frame, PeerId, RegisterErrorCode};
pub use server::{RelayServer, RelayServerConfig};
pub use supervisor::{Supervisor, SupervisorState};

/// Default relay port
pub const DEFAULT_RELAY_PORT: u16 = 7478;

/// Maximum encoded frame size (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum payload carried by one `Data` frame
///
/// Small enough that a `Data` frame for the longest peer id still fits one
/// secure datagram. Larger writes are split.
pub const MAX_PAYLOAD_SIZE: usize = 63 * 1024;

/// Maximum peer id length in bytes
pub const MAX_PEER_ID_LEN: usize = 255;

/// Default keepalive interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default registration timeout (also bounds the dial)
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between reconnection attempts
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Default idle period after which a silent connection is considered dead
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
