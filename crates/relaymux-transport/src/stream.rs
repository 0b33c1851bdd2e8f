//! TCP stream transport.
//!
//! The stream variant of [`Connection`]: a reliable ordered byte stream with
//! read and write deadlines. Message framing is left to the caller.

use crate::transport::{
    CloseSignal, Connection, DeadlineCell, Dialer, Listener, StatsCounters, TransportError,
    TransportKind, TransportResult, TransportStats, with_deadline,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// A TCP connection exposed through the [`Connection`] trait.
///
/// Reads and writes use separate halves, so a reader blocked in `read` never
/// delays a writer. `close` shuts down the write half (the peer reads EOF)
/// and makes every pending or later `read` return `Ok(0)`.
pub struct StreamConnection {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    closed: CloseSignal,
    read_deadline: DeadlineCell,
    write_deadline: DeadlineCell,
    stats: StatsCounters,
}

impl StreamConnection {
    /// Wrap an established TCP stream.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the socket addresses are unavailable
    pub fn from_stream(stream: TcpStream) -> TransportResult<Self> {
        // Frames are small and latency matters more than coalescing
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            remote_addr,
            closed: CloseSignal::new(),
            read_deadline: DeadlineCell::default(),
            write_deadline: DeadlineCell::default(),
            stats: StatsCounters::default(),
        })
    }

    /// Connect to `addr` (`host:port`).
    ///
    /// # Errors
    /// Returns `TransportError::ConnectionFailed` if the connection is refused
    pub async fn connect(addr: &str) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        Self::from_stream(stream)
    }
}

#[async_trait]
impl Connection for StreamConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.closed.is_closed() {
            return Ok(0);
        }
        let deadline = self.read_deadline.get();

        let mut reader = tokio::select! {
            guard = self.reader.lock() => guard,
            () = self.closed.closed() => return Ok(0),
        };

        let result = tokio::select! {
            biased;
            () = self.closed.closed() => return Ok(0),
            result = with_deadline(deadline, reader.read(buf)) => result?,
        };

        match result {
            Ok(n) => {
                if n > 0 {
                    self.stats.record_recv(n);
                }
                Ok(n)
            }
            Err(_) if self.closed.is_closed() => Ok(0),
            Err(e) => {
                self.stats.record_recv_error();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }
        let deadline = self.write_deadline.get();

        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            () = self.closed.closed() => return Err(TransportError::Closed),
        };

        let result = tokio::select! {
            biased;
            () = self.closed.closed() => return Err(TransportError::Closed),
            result = with_deadline(deadline, writer.write_all(buf)) => result?,
        };

        match result {
            Ok(()) => {
                self.stats.record_send(buf.len());
                Ok(buf.len())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.closed.close() {
            return Ok(());
        }

        // Pending writers observe the signal and release the lock.
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!("Shutdown of {} failed: {}", self.remote_addr, e);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> TransportResult<()> {
        self.read_deadline.set(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> TransportResult<()> {
        self.write_deadline.set(deadline);
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

/// TCP listener producing [`StreamConnection`]s.
pub struct StreamListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    closed: CloseSignal,
}

impl StreamListener {
    /// Bind a listener on `addr` (`host:port`).
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address cannot be bound
    pub async fn bind(addr: &str) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            closed: CloseSignal::new(),
        })
    }
}

#[async_trait]
impl Listener for StreamListener {
    async fn accept(&self) -> TransportResult<Arc<dyn Connection>> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }

        let (stream, from) = tokio::select! {
            () = self.closed.closed() => return Err(TransportError::Closed),
            accepted = self.listener.accept() => accepted?,
        };
        tracing::trace!("Accepted stream connection from {}", from);

        Ok(Arc::new(StreamConnection::from_stream(stream)?))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

/// Dials [`StreamConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamDialer;

impl StreamDialer {
    /// Create a TCP dialer
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for StreamDialer {
    async fn dial(&self, addr: &str) -> TransportResult<Arc<dyn Connection>> {
        Ok(Arc::new(StreamConnection::connect(addr).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn connected_pair() -> (Arc<dyn Connection>, Arc<dyn Connection>) {
        let listener = StreamListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let dialer = StreamDialer::new();
        let (client, server) = tokio::join!(dialer.dial(&addr), listener.accept());
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_stream_write_read() {
        let (client, server) = connected_pair().await;
        assert_eq!(client.kind(), TransportKind::Stream);

        let sent = client.write(b"hello relay").await.unwrap();
        assert_eq!(sent, 11);

        let mut buf = [0u8; 64];
        let mut received = Vec::new();
        while received.len() < 11 {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"hello relay");

        assert_eq!(client.stats().bytes_sent, 11);
        assert_eq!(server.stats().bytes_received, 11);
    }

    #[tokio::test]
    async fn test_stream_close_unblocks_read() {
        let (client, _server) = connected_pair().await;

        let reader = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                client.read(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read not unblocked")
            .unwrap();
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_close_is_idempotent() {
        let (client, _server) = connected_pair().await;
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());

        let result = client.write(b"late").await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_stream_remote_close_reads_eof() {
        let (client, server) = connected_pair().await;
        client.close().await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_stream_read_deadline() {
        let (client, _server) = connected_pair().await;
        client
            .set_read_deadline(Some(Instant::now() + Duration::from_millis(30)))
            .unwrap();

        let mut buf = [0u8; 16];
        let result = client.read(&mut buf).await;
        assert!(matches!(result, Err(TransportError::DeadlineExceeded)));

        // Clearing the deadline is always accepted
        client.set_read_deadline(None).unwrap();
        client.set_write_deadline(None).unwrap();
    }

    #[tokio::test]
    async fn test_listener_close_unblocks_accept() {
        let listener = Arc::new(StreamListener::bind("127.0.0.1:0").await.unwrap());
        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), accepting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind and drop to obtain a port with nothing listening
        let addr = {
            let listener = StreamListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let result = StreamDialer::new().dial(&addr).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let result = StreamListener::bind("not-an-address").await;
        assert!(matches!(result, Err(TransportError::BindFailed(_))));
    }
}
