//! Secure datagram sessions over UDP.
//!
//! The datagram variant of [`Connection`]. Every session datagram is one UDP
//! datagram, sealed with `XChaCha20-Poly1305` under a key derived from a
//! pre-shared secret:
//!
//! ```text
//! kind (1) || nonce (24) || ciphertext + tag (body, aad = kind)
//! ```
//!
//! `kind` is either application data or a close notice whose body is
//! `code (4, big-endian) || reason (UTF-8)`. Code 0 is a normal closure and
//! reads as end of stream on the other side.
//!
//! ## Per-call contract
//!
//! - `write` sends exactly one datagram; writes larger than
//!   [`MAX_DATAGRAM_PAYLOAD`] fail with `MessageTooLarge`.
//! - `read` returns the next datagram, copying at most `buf.len()` bytes and
//!   silently discarding the rest.
//! - Read deadlines are supported. Write deadlines are not; only clearing
//!   one is accepted.
//! - Datagrams that fail authentication are dropped.

use crate::endpoint::{Endpoint, EndpointCache};
use crate::transport::{
    CloseSignal, Connection, DeadlineCell, Dialer, Listener, StatsCounters, TransportError,
    TransportKind, TransportResult, TransportStats, with_deadline,
};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use dashmap::DashMap;
use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Nonce length of the session cipher
pub const NONCE_SIZE: usize = 24;

/// Authentication tag length of the session cipher
pub const TAG_SIZE: usize = 16;

/// Bytes added to every payload on the wire
pub const DATAGRAM_OVERHEAD: usize = 1 + NONCE_SIZE + TAG_SIZE;

/// Largest UDP payload over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Largest accepted `write`
pub const MAX_DATAGRAM_PAYLOAD: usize = MAX_UDP_PAYLOAD - DATAGRAM_OVERHEAD;

/// Close code of a graceful shutdown
pub const NORMAL_CLOSURE: u32 = 0;

const KIND_DATA: u8 = 0x01;
const KIND_CLOSE: u8 = 0x02;

const KEY_CONTEXT: &str = "relaymux 2024-06 secure datagram session key";

/// Symmetric key shared by both ends of a datagram session.
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Use raw key bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a key from a shared secret (passphrase or random token)
    #[must_use]
    pub fn derive(secret: &[u8]) -> Self {
        Self(blake3::derive_key(KEY_CONTEXT, secret))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Datagram socket configuration
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    /// Receive buffer size
    pub recv_buffer_size: usize,
    /// Send buffer size
    pub send_buffer_size: usize,
    /// Datagrams queued per session before new ones are dropped
    pub session_queue: usize,
    /// Sessions queued for `accept` before new ones are refused
    pub accept_backlog: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 2 * 1024 * 1024,
            session_queue: 1024,
            accept_backlog: 128,
        }
    }
}

/// Decrypted session datagram
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Data(Vec<u8>),
    Close { code: u32, reason: String },
}

#[derive(Clone)]
struct SessionCipher {
    aead: XChaCha20Poly1305,
}

impl SessionCipher {
    fn new(key: &SessionKey) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(&key.0)),
        }
    }

    fn seal(&self, kind: u8, body: &[u8]) -> TransportResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce[..]);

        let ciphertext = self
            .aead
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: body,
                    aad: &[kind],
                },
            )
            .map_err(|_| TransportError::Other("datagram encryption failed".to_string()))?;

        let mut datagram = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        datagram.push(kind);
        datagram.extend_from_slice(&nonce);
        datagram.extend_from_slice(&ciphertext);
        Ok(datagram)
    }

    fn seal_close(&self, code: u32, reason: &str) -> TransportResult<Vec<u8>> {
        let mut body = Vec::with_capacity(4 + reason.len());
        body.extend_from_slice(&code.to_be_bytes());
        body.extend_from_slice(reason.as_bytes());
        self.seal(KIND_CLOSE, &body)
    }

    fn open(&self, datagram: &[u8]) -> TransportResult<Inbound> {
        if datagram.len() < DATAGRAM_OVERHEAD {
            return Err(TransportError::InvalidDatagram("too short"));
        }

        let kind = datagram[0];
        let body = self
            .aead
            .decrypt(
                XNonce::from_slice(&datagram[1..=NONCE_SIZE]),
                Payload {
                    msg: &datagram[1 + NONCE_SIZE..],
                    aad: &[kind],
                },
            )
            .map_err(|_| TransportError::InvalidDatagram("authentication failed"))?;

        match kind {
            // A zero-length read means the session closed
            KIND_DATA if body.is_empty() => Err(TransportError::InvalidDatagram("empty data")),
            KIND_DATA => Ok(Inbound::Data(body)),
            KIND_CLOSE => {
                let (code, reason) = body
                    .split_first_chunk::<4>()
                    .ok_or(TransportError::InvalidDatagram("truncated close notice"))?;
                Ok(Inbound::Close {
                    code: u32::from_be_bytes(*code),
                    reason: String::from_utf8_lossy(reason).into_owned(),
                })
            }
            _ => Err(TransportError::InvalidDatagram("unknown kind")),
        }
    }
}

/// Bind a UDP socket with tuned buffer sizes.
fn bind_udp(addr: SocketAddr, config: &DatagramConfig) -> TransportResult<UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };

    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| TransportError::BindFailed(e.to_string()))
}

/// Queue an inbound datagram without blocking the socket task.
///
/// Returns `false` once the session has gone away.
fn deliver(tx: &mpsc::Sender<Inbound>, inbound: Inbound, from: SocketAddr) -> bool {
    match tx.try_send(inbound) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::trace!("Session queue for {} full, dropping datagram", from);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// One secure datagram session with a single remote endpoint.
///
/// Sessions are produced by [`DatagramDialer::dial`] and
/// [`DatagramListener::accept`]. A background socket task decrypts inbound
/// datagrams into the session's queue; `read` pops from it.
pub struct DatagramSession {
    socket: Arc<UdpSocket>,
    peer: Arc<Endpoint>,
    cipher: SessionCipher,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    closed: CloseSignal,
    read_deadline: DeadlineCell,
    stats: StatsCounters,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DatagramSession {
    fn new(
        socket: Arc<UdpSocket>,
        peer: Arc<Endpoint>,
        cipher: SessionCipher,
        inbound: mpsc::Receiver<Inbound>,
        closed: CloseSignal,
    ) -> Self {
        Self {
            socket,
            peer,
            cipher,
            inbound: Mutex::new(inbound),
            closed,
            read_deadline: DeadlineCell::default(),
            stats: StatsCounters::default(),
            pump: std::sync::Mutex::new(None),
        }
    }

    /// Remote endpoint of the session
    #[must_use]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.peer
    }

    /// Close with an application code and reason.
    ///
    /// The peer reads end of stream for [`NORMAL_CLOSURE`] and
    /// `TransportError::RemoteClosed` for any other code.
    ///
    /// # Errors
    /// Returns `TransportError` if the close notice could not be sent
    pub async fn close_with(&self, code: u32, reason: &str) -> TransportResult<()> {
        if !self.closed.close() {
            return Ok(());
        }

        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }

        let notice = self.cipher.seal_close(code, reason)?;
        self.socket.send_to(&notice, self.peer.addr()).await?;
        Ok(())
    }
}

impl Drop for DatagramSession {
    fn drop(&mut self) {
        self.closed.close();
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

#[async_trait]
impl Connection for DatagramSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.closed.is_closed() {
            return Ok(0);
        }
        let deadline = self.read_deadline.get();

        let mut inbound = tokio::select! {
            guard = self.inbound.lock() => guard,
            () = self.closed.closed() => return Ok(0),
        };

        let next = tokio::select! {
            biased;
            () = self.closed.closed() => return Ok(0),
            next = with_deadline(deadline, inbound.recv()) => next?,
        };

        match next {
            Some(Inbound::Data(datagram)) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                self.stats.record_recv(datagram.len());
                Ok(n)
            }
            Some(Inbound::Close { code, reason }) => {
                self.closed.close();
                if code == NORMAL_CLOSURE {
                    Ok(0)
                } else {
                    Err(TransportError::RemoteClosed { code, reason })
                }
            }
            None => {
                // Socket task is gone, nothing more will ever arrive
                self.stats.record_recv_error();
                self.closed.close();
                Err(TransportError::Closed)
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(TransportError::MessageTooLarge {
                size: buf.len(),
                max: MAX_DATAGRAM_PAYLOAD,
            });
        }

        let datagram = self.cipher.seal(KIND_DATA, buf)?;
        match self.socket.send_to(&datagram, self.peer.addr()).await {
            Ok(_) => {
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
        self.close_with(NORMAL_CLOSURE, "normal closure").await
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer.addr()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> TransportResult<()> {
        self.read_deadline.set(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> TransportResult<()> {
        match deadline {
            None => Ok(()),
            Some(_) => Err(TransportError::Unsupported("write deadline on datagram session")),
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

/// Demultiplexer slot for one server-side session
struct SessionSlot {
    tx: mpsc::Sender<Inbound>,
    closed: CloseSignal,
}

/// UDP listener that demultiplexes one socket into [`DatagramSession`]s.
///
/// The first authenticated data datagram from an unknown source address
/// opens a new session, which is handed out by `accept`.
pub struct DatagramListener {
    local_addr: SocketAddr,
    accept_rx: Mutex<mpsc::Receiver<Arc<DatagramSession>>>,
    closed: CloseSignal,
    sessions: Arc<DashMap<SocketAddr, SessionSlot>>,
}

impl DatagramListener {
    /// Bind a listener on `addr` with default settings.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be bound
    pub async fn bind(addr: &str, key: SessionKey) -> TransportResult<Self> {
        Self::bind_with(
            addr,
            key,
            DatagramConfig::default(),
            Arc::new(EndpointCache::new()),
        )
        .await
    }

    /// Bind a listener with explicit socket settings and endpoint cache.
    ///
    /// # Errors
    /// Returns `TransportError` if `addr` is invalid or cannot be bound
    pub async fn bind_with(
        addr: &str,
        key: SessionKey,
        config: DatagramConfig,
        cache: Arc<EndpointCache>,
    ) -> TransportResult<Self> {
        let bind_addr = cache.resolve(addr).await?.addr();
        let socket = Arc::new(bind_udp(bind_addr, &config)?);
        let local_addr = socket.local_addr()?;

        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let closed = CloseSignal::new();
        let sessions = Arc::new(DashMap::new());

        tokio::spawn(Self::recv_loop(
            socket,
            SessionCipher::new(&key),
            sessions.clone(),
            accept_tx,
            cache,
            config.session_queue.max(1),
            closed.clone(),
        ));

        tracing::debug!("Datagram listener bound on {}", local_addr);

        Ok(Self {
            local_addr,
            accept_rx: Mutex::new(accept_rx),
            closed,
            sessions,
        })
    }

    /// Number of sessions currently tracked by the demultiplexer
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|slot| !slot.closed.is_closed())
            .count()
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        cipher: SessionCipher,
        sessions: Arc<DashMap<SocketAddr, SessionSlot>>,
        accept_tx: mpsc::Sender<Arc<DatagramSession>>,
        cache: Arc<EndpointCache>,
        session_queue: usize,
        closed: CloseSignal,
    ) {
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

        loop {
            let (len, from) = tokio::select! {
                () = closed.closed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!("Datagram listener receive error: {}", e);
                        continue;
                    }
                },
            };

            let inbound = match cipher.open(&buf[..len]) {
                Ok(inbound) => inbound,
                Err(e) => {
                    tracing::trace!("Dropping datagram from {}: {}", from, e);
                    continue;
                }
            };

            let live = sessions
                .get(&from)
                .filter(|slot| !slot.closed.is_closed())
                .map(|slot| slot.tx.clone());
            if let Some(tx) = live {
                if !deliver(&tx, inbound, from) {
                    sessions.remove(&from);
                }
                continue;
            }

            if matches!(inbound, Inbound::Close { .. }) {
                tracing::trace!("Ignoring close notice for unknown session {}", from);
                continue;
            }

            let (tx, rx) = mpsc::channel(session_queue);
            let session_closed = CloseSignal::new();
            let session = Arc::new(DatagramSession::new(
                socket.clone(),
                cache.endpoint(from),
                cipher.clone(),
                rx,
                session_closed.clone(),
            ));

            sessions.retain(|_, slot| !slot.closed.is_closed());
            sessions.insert(
                from,
                SessionSlot {
                    tx: tx.clone(),
                    closed: session_closed,
                },
            );
            deliver(&tx, inbound, from);

            if accept_tx.try_send(session).is_err() {
                tracing::warn!("Accept backlog full, refusing datagram session from {}", from);
                sessions.remove(&from);
            } else {
                tracing::debug!("New datagram session from {}", from);
            }
        }

        // Dropping the senders ends every session's inbound queue
        sessions.clear();
    }
}

#[async_trait]
impl Listener for DatagramListener {
    async fn accept(&self) -> TransportResult<Arc<dyn Connection>> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut accept_rx = tokio::select! {
            guard = self.accept_rx.lock() => guard,
            () = self.closed.closed() => return Err(TransportError::Closed),
        };

        tokio::select! {
            () = self.closed.closed() => Err(TransportError::Closed),
            session = accept_rx.recv() => match session {
                Some(session) => Ok(session as Arc<dyn Connection>),
                None => Err(TransportError::Closed),
            },
        }
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

/// Dials [`DatagramSession`]s from a fresh ephemeral UDP socket.
#[derive(Debug, Clone)]
pub struct DatagramDialer {
    key: SessionKey,
    config: DatagramConfig,
    cache: Arc<EndpointCache>,
}

impl DatagramDialer {
    /// Create a dialer with default socket settings
    #[must_use]
    pub fn new(key: SessionKey) -> Self {
        Self::with_config(key, DatagramConfig::default(), Arc::new(EndpointCache::new()))
    }

    /// Create a dialer with explicit socket settings and endpoint cache
    #[must_use]
    pub fn with_config(key: SessionKey, config: DatagramConfig, cache: Arc<EndpointCache>) -> Self {
        Self { key, config, cache }
    }

    async fn pump(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        cipher: SessionCipher,
        tx: mpsc::Sender<Inbound>,
        closed: CloseSignal,
    ) {
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

        loop {
            let (len, from) = tokio::select! {
                () = closed.closed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!("Datagram session receive error: {}", e);
                        continue;
                    }
                },
            };

            if from != peer {
                tracing::trace!("Ignoring datagram from unexpected source {}", from);
                continue;
            }

            match cipher.open(&buf[..len]) {
                Ok(inbound) => {
                    if !deliver(&tx, inbound, from) {
                        break;
                    }
                }
                Err(e) => tracing::trace!("Dropping datagram from {}: {}", from, e),
            }
        }
    }

    /// Open a session to `addr` (`host:port`).
    ///
    /// # Errors
    /// Returns `TransportError` if the address does not resolve or no local
    /// socket can be bound
    pub async fn connect(&self, addr: &str) -> TransportResult<Arc<DatagramSession>> {
        let peer = self.cache.resolve(addr).await?;
        let local: SocketAddr = if peer.addr().is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = Arc::new(
            bind_udp(local, &self.config)
                .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?,
        );

        let cipher = SessionCipher::new(&self.key);
        let (tx, rx) = mpsc::channel(self.config.session_queue.max(1));
        let closed = CloseSignal::new();

        let pump = tokio::spawn(Self::pump(
            socket.clone(),
            peer.addr(),
            cipher.clone(),
            tx,
            closed.clone(),
        ));

        let session = DatagramSession::new(socket, peer, cipher, rx, closed);
        *session.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        Ok(Arc::new(session))
    }
}

#[async_trait]
impl Dialer for DatagramDialer {
    async fn dial(&self, addr: &str) -> TransportResult<Arc<dyn Connection>> {
        let session: Arc<dyn Connection> = self.connect(addr).await?;
        Ok(session)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn test_key() -> SessionKey {
        SessionKey::derive(b"correct horse battery staple")
    }

    /// Dial a listener and complete the first exchange so the server side
    /// has a session to hand out.
    async fn session_pair() -> (Arc<DatagramSession>, Arc<dyn Connection>, DatagramListener) {
        let listener = DatagramListener::bind("127.0.0.1:0", test_key())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = DatagramDialer::new(test_key()).connect(&addr).await.unwrap();
        client.write(b"hello").await.unwrap();
        let server = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .expect("no session accepted")
            .unwrap();

        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        (client, server, listener)
    }

    #[test]
    fn test_seal_open() {
        let cipher = SessionCipher::new(&test_key());
        let sealed = cipher.seal(KIND_DATA, b"payload").unwrap();
        assert_eq!(sealed.len(), 7 + DATAGRAM_OVERHEAD);
        assert_eq!(
            cipher.open(&sealed).unwrap(),
            Inbound::Data(b"payload".to_vec())
        );

        let close = cipher.seal_close(7, "bye").unwrap();
        assert_eq!(
            cipher.open(&close).unwrap(),
            Inbound::Close {
                code: 7,
                reason: "bye".to_string()
            }
        );
    }

    #[test]
    fn test_open_rejects_tampering() {
        let cipher = SessionCipher::new(&test_key());
        let mut sealed = cipher.seal(KIND_DATA, b"payload").unwrap();

        // The kind byte is bound as associated data
        sealed[0] = KIND_CLOSE;
        assert!(cipher.open(&sealed).is_err());

        let other = SessionCipher::new(&SessionKey::derive(b"another secret"));
        let sealed = cipher.seal(KIND_DATA, b"payload").unwrap();
        assert!(other.open(&sealed).is_err());

        assert!(matches!(
            cipher.open(&[KIND_DATA; 8]),
            Err(TransportError::InvalidDatagram(_))
        ));
    }

    #[test]
    fn test_open_rejects_empty_data() {
        let cipher = SessionCipher::new(&test_key());
        let sealed = cipher.seal(KIND_DATA, &[]).unwrap();
        assert!(matches!(
            cipher.open(&sealed),
            Err(TransportError::InvalidDatagram("empty data"))
        ));
    }

    #[tokio::test]
    async fn test_empty_write_is_not_eof() {
        let (client, server, _listener) = session_pair().await;

        assert_eq!(client.write(&[]).await.unwrap(), 0);
        assert_eq!(client.stats().packets_sent, 1);

        // An empty datagram sealed with the right key is dropped on receipt
        let empty = client.cipher.seal(KIND_DATA, &[]).unwrap();
        client
            .socket
            .send_to(&empty, client.peer.addr())
            .await
            .unwrap();
        client.write(b"after").await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"after");
        assert!(!server.is_closed());
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = SessionKey::from_bytes([0x42; 32]);
        assert_eq!(format!("{key:?}"), "SessionKey(..)");
    }

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let (client, server, listener) = session_pair().await;
        assert_eq!(client.kind(), TransportKind::Datagram);
        assert_eq!(listener.session_count(), 1);
        assert_eq!(
            server.remote_addr().port(),
            client.local_addr().unwrap().port()
        );

        server.write(b"world").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(client.stats().bytes_received, 5);
    }

    #[tokio::test]
    async fn test_datagram_read_truncates() {
        let (client, server, _listener) = session_pair().await;

        client.write(&[7u8; 100]).await.unwrap();
        let mut small = [0u8; 10];
        let n = tokio::time::timeout(Duration::from_secs(1), server.read(&mut small))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 10);

        // The tail of the previous datagram is gone
        client.write(b"next").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"next");
    }

    #[tokio::test]
    async fn test_datagram_oversize_write() {
        let (client, _server, _listener) = session_pair().await;
        let result = client.write(&vec![0u8; MAX_DATAGRAM_PAYLOAD + 1]).await;
        assert!(matches!(
            result,
            Err(TransportError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_normal_close_reads_eof() {
        let (client, server, _listener) = session_pair().await;
        client.close().await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_remote_abnormal_close_is_error() {
        let (client, server, _listener) = session_pair().await;
        client.close_with(42, "going away").await.unwrap();

        let mut buf = [0u8; 16];
        let result = tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf))
            .await
            .unwrap();
        match result {
            Err(TransportError::RemoteClosed { code, reason }) => {
                assert_eq!(code, 42);
                assert_eq!(reason, "going away");
            }
            other => panic!("expected RemoteClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_close_unblocks_read() {
        let (client, _server, _listener) = session_pair().await;

        let reader = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                client.read(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await.unwrap();
        client.close().await.unwrap();

        let n = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(matches!(
            client.write(b"late").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_deadlines() {
        let (client, _server, _listener) = session_pair().await;

        client.set_write_deadline(None).unwrap();
        assert!(matches!(
            client.set_write_deadline(Some(Instant::now())),
            Err(TransportError::Unsupported(_))
        ));

        client
            .set_read_deadline(Some(Instant::now() + Duration::from_millis(30)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            client.read(&mut buf).await,
            Err(TransportError::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn test_listener_drops_unauthenticated() {
        let listener = DatagramListener::bind("127.0.0.1:0", test_key())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let intruder = DatagramDialer::new(SessionKey::derive(b"wrong"))
            .dial(&addr)
            .await
            .unwrap();
        intruder.write(b"let me in").await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err());
        assert_eq!(listener.session_count(), 0);
    }

    #[tokio::test]
    async fn test_listener_close_unblocks_accept() {
        let listener = Arc::new(
            DatagramListener::bind("127.0.0.1:0", test_key())
                .await
                .unwrap(),
        );
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
    }

    proptest! {
        /// Forged datagrams are rejected without panicking
        #[test]
        fn open_rejects_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..2048)) {
            let cipher = SessionCipher::new(&test_key());
            prop_assert!(cipher.open(&data).is_err());
        }

        /// Flipping any single bit of a sealed datagram breaks authentication
        #[test]
        fn open_detects_bit_flips(body in prop::collection::vec(any::<u8>(), 0..256), bit in any::<usize>()) {
            let cipher = SessionCipher::new(&test_key());
            let mut sealed = cipher.seal(KIND_DATA, &body).unwrap();
            let bit = bit % (sealed.len() * 8);
            sealed[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(cipher.open(&sealed).is_err());
        }
    }
}
