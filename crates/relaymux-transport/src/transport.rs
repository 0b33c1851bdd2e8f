//! Transport trait abstraction for physical relay connections.
//!
//! This module defines the `Connection` trait that hides whether a physical
//! connection is a reliable ordered byte stream (TCP) or a secure best-effort
//! datagram session (UDP). The relay client and server are written against
//! this trait plus the `Dialer` and `Listener` traits, so either variant can
//! carry the relay protocol without changing the layers above.

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Address could not be parsed or resolved
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The variant does not implement this operation
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// A read or write deadline elapsed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// A single write does not fit one datagram
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size of the rejected write
        size: usize,
        /// Largest accepted write
        max: usize,
    },

    /// The remote side closed the session with a non-normal code
    #[error("Session closed by peer (code {code}): {reason}")]
    RemoteClosed {
        /// Application close code
        code: u32,
        /// Close reason sent by the peer
        reason: String,
    },

    /// Datagram failed authentication or was malformed
    #[error("Invalid datagram: {0}")]
    InvalidDatagram(&'static str),


    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Delivery model of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Reliable ordered byte stream; message boundaries are not preserved.
    Stream,
    /// One message per `write`, one message per `read`.
    Datagram,
}

/// A physical connection between a relay client and a relay server.
///
/// All methods take `&self` so that one task can sit in `read` while other
/// tasks `write`. Implementations serialize concurrent writers internally for
/// a single call, but callers that emit multi-part messages must add their
/// own lock.
///
/// # Read semantics
///
/// `Ok(0)` means end of stream: the connection was closed locally, or the
/// remote side closed it gracefully. Faults are reported as errors.
///
/// # Variants
///
/// - [`StreamConnection`](crate::stream::StreamConnection): `write` writes
///   the whole buffer, `read` returns any number of available bytes.
/// - [`DatagramSession`](crate::datagram::DatagramSession): each `write`
///   sends exactly one datagram, each `read` returns exactly one datagram
///   truncated to the buffer length.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Delivery model of this connection.
    fn kind(&self) -> TransportKind;

    /// Read into `buf`, returning the number of bytes read.
    ///
    /// # Errors
    /// Returns `TransportError` on faults and elapsed deadlines
    async fn read(&self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Write `buf`, returning the number of bytes written.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after `close`, or the underlying fault
    async fn write(&self, buf: &[u8]) -> TransportResult<usize>;

    /// Close the connection. Idempotent; unblocks any in-flight `read`.
    ///
    /// # Errors
    /// Returns `TransportError` if the close notification could not be issued
    async fn close(&self) -> TransportResult<()>;

    /// Check if the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Local address of the connection.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Remote address of the connection.
    fn remote_addr(&self) -> SocketAddr;

    /// Set or clear (`None`) the deadline for future `read` calls.
    ///
    /// # Errors
    /// Returns `TransportError::Unsupported` if the variant cannot honour it
    fn set_read_deadline(&self, deadline: Option<Instant>) -> TransportResult<()>;

    /// Set or clear (`None`) the deadline for future `write` calls.
    ///
    /// # Errors
    /// Returns `TransportError::Unsupported` if the variant cannot honour it
    fn set_write_deadline(&self, deadline: Option<Instant>) -> TransportResult<()>;

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Accepts inbound physical connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the listener is closed
    async fn accept(&self) -> TransportResult<Arc<dyn Connection>>;

    /// Address the listener is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting. Idempotent; unblocks a pending `accept`.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the listener has been closed.
    fn is_closed(&self) -> bool;
}

/// Establishes outbound physical connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` (`host:port`).
    ///
    /// # Errors
    /// Returns `TransportError` if the address is invalid or unreachable
    async fn dial(&self, addr: &str) -> TransportResult<Arc<dyn Connection>>;
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lock-free counters shared by the connection variants.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// One-way latch that wakes every waiter when tripped.
///
/// Cheap to clone; all clones observe the same latch.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    /// Create an untripped signal
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trip the latch. Returns `true` only for the call that tripped it.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Check if the latch has been tripped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the latch is tripped.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once tripped.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline slot settable from `&self`.
#[derive(Debug, Default)]
pub(crate) struct DeadlineCell(Mutex<Option<Instant>>);

impl DeadlineCell {
    pub(crate) fn get(&self) -> Option<Instant> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, deadline: Option<Instant>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }
}

/// Run `fut` to completion, or fail with `DeadlineExceeded` at `deadline`.
pub(crate) async fn with_deadline<F: Future>(
    deadline: Option<Instant>,
    fut: F,
) -> TransportResult<F::Output> {
    match deadline {
        None => Ok(fut.await),
        Some(deadline) => {
            tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut)
                .await
                .map_err(|_| TransportError::DeadlineExceeded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stats_counters() {
        let stats = StatsCounters::default();
        assert_eq!(stats.snapshot().bytes_sent, 0);

        stats.record_send(100);
        stats.record_send(50);
        stats.record_recv(200);
        stats.record_send_error();
        stats.record_recv_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_sent, 150);
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.bytes_received, 200);
        assert_eq!(snapshot.packets_received, 1);
        assert_eq!(snapshot.send_errors, 1);
        assert_eq!(snapshot.recv_errors, 1);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::Unsupported("write deadline");
        assert_eq!(err.to_string(), "Operation not supported: write deadline");

        let err = TransportError::MessageTooLarge { size: 70000, max: 65466 };
        assert!(err.to_string().contains("70000"));

        let err = TransportError::RemoteClosed {
            code: 3,
            reason: "going away".to_string(),
        };
        assert!(err.to_string().contains("going away"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = std::io::Error::other("test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
    }

    #[test]
    fn test_close_signal_trips_once() {
        let signal = CloseSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_closed());

        assert!(clone.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let signal = CloseSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.closed().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();

        // Already tripped: resolves immediately
        signal.closed().await;
    }

    #[tokio::test]
    async fn test_with_deadline() {
        let ok = with_deadline(None, async { 7 }).await.unwrap();
        assert_eq!(ok, 7);

        let past = Instant::now();
        let result = with_deadline(Some(past), std::future::pending::<()>()).await;
        assert!(matches!(result, Err(TransportError::DeadlineExceeded)));
    }
}
