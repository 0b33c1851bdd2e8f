//! Relay server: peer registry and frame router.

use crate::codec::{FrameReader, FrameWriter};
use crate::error::Result;
use crate::protocol::{Frame, PeerId, RegisterErrorCode};
use crate::{IDLE_TIMEOUT, REGISTRATION_TIMEOUT};
use relaymux_transport::{CloseSignal, Connection, Listener, StreamListener, TransportKind};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Per-connection frame rate limiter (fixed one-second windows)
struct RateLimiter {
    /// Frames per window, 0 = unlimited
    limit: u32,
    /// Window duration
    window: Duration,
    /// Start of the current window
    window_start: Instant,
    /// Frames seen in the current window
    count: u32,
}

impl RateLimiter {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Check if another frame is allowed
    fn check(&mut self) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }

        if self.count >= self.limit {
            return false;
        }

        self.count += 1;
        true
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum number of concurrently registered clients
    pub max_clients: usize,
    /// Data/close frames per client per second (0 = unlimited)
    pub rate_limit: u32,
    /// Silence after which a registered client is dropped
    pub client_timeout: Duration,
    /// Time a new connection has to send its registration
    pub registration_timeout: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            rate_limit: 0,
            client_timeout: IDLE_TIMEOUT,
            registration_timeout: REGISTRATION_TIMEOUT,
        }
    }
}

/// Registry entry for one registered physical connection
struct PeerHandle {
    /// Distinguishes a re-registration from the entry it replaced
    conn_id: u64,
    writer: FrameWriter,
}

struct ServerInner {
    config: RelayServerConfig,
    registry: RwLock<HashMap<PeerId, Arc<PeerHandle>>>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    closed: CloseSignal,
    next_conn_id: AtomicU64,
}

/// Relay server.
///
/// Accepts physical connections, registers each under the peer id from its
/// first frame and forwards `Data` and `Close` frames between registered
/// peers. Payloads are never inspected. Frames for unknown peers are
/// dropped without telling the sender.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<ServerInner>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    /// Create a server with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RelayServerConfig::default())
    }

    /// Create a server with custom configuration
    #[must_use]
    pub fn with_config(config: RelayServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                registry: RwLock::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                local_addr: Mutex::new(None),
                closed: CloseSignal::new(),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Bind a TCP listener on `addr` and serve until [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// Returns an error only if the address cannot be bound.
    pub async fn listen(&self, addr: &str) -> Result<()> {
        if self.inner.closed.is_closed() {
            return Ok(());
        }
        let listener = StreamListener::bind(addr).await?;
        self.listen_on(Arc::new(listener)).await
    }

    /// Serve connections from an already bound listener until
    /// [`close`](Self::close).
    ///
    /// Each connection runs on its own task; failures are contained to that
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub async fn listen_on(&self, listener: Arc<dyn Listener>) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.is_closed() {
            close_listener(listener.as_ref()).await;
            return Ok(());
        }

        let local_addr = listener.local_addr()?;
        *inner
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener.clone());

        tracing::info!("Relay server listening on {}", local_addr);

        loop {
            let conn = tokio::select! {
                () = inner.closed.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(_) if listener.is_closed() || inner.closed.is_closed() => break,
                    Err(e) => {
                        tracing::warn!("Accept failed on {}: {}", local_addr, e);
                        continue;
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = server.inner.closed.closed() => close_conn(conn.as_ref()).await,
                    () = server.handle_connection(conn.clone()) => {}
                }
            });
        }

        close_listener(listener.as_ref()).await;
        Ok(())
    }

    /// Stop accepting, drop every registration and close its connection.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Never fails today.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.closed.close() {
            return Ok(());
        }

        let listeners: Vec<_> = inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for listener in listeners {
            close_listener(listener.as_ref()).await;
        }

        let handles: Vec<_> = inner
            .registry
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            close_conn(handle.writer.connection().as_ref()).await;
        }

        tracing::info!(
            "Relay server closed ({} clients disconnected)",
            handles.len()
        );
        Ok(())
    }

    /// Number of registered clients
    pub async fn client_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Check if `peer_id` is registered
    pub async fn is_registered(&self, peer_id: &PeerId) -> bool {
        self.inner.registry.read().await.contains_key(peer_id)
    }

    /// Address of the most recent listener, once listening
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if the server was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }

    async fn handle_connection(&self, conn: Arc<dyn Connection>) {
        let remote = conn.remote_addr();
        let writer = FrameWriter::new(conn.clone());
        let mut reader = FrameReader::new(conn.clone());

        let first =
            tokio::time::timeout(self.inner.config.registration_timeout, reader.read_frame())
                .await;
        let requested = match first {
            Ok(Ok(Some(Frame::Register { peer_id }))) => peer_id,
            Ok(Ok(Some(other))) => {
                reject(
                    &writer,
                    RegisterErrorCode::InvalidMessage,
                    format!("expected Register, got {}", other.message_type()),
                )
                .await;
                close_conn(conn.as_ref()).await;
                return;
            }
            Ok(Ok(None)) => {
                tracing::debug!("{} disconnected before registering", remote);
                close_conn(conn.as_ref()).await;
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!("Registration from {} failed: {}", remote, e);
                if !e.is_transport_lost() {
                    reject(&writer, RegisterErrorCode::InvalidMessage, e.to_string()).await;
                }
                close_conn(conn.as_ref()).await;
                return;
            }
            Err(_) => {
                tracing::debug!("Registration from {} timed out", remote);
                close_conn(conn.as_ref()).await;
                return;
            }
        };

        let peer_id = match PeerId::new(requested) {
            Ok(peer_id) => peer_id,
            Err(e) => {
                reject(&writer, RegisterErrorCode::InvalidPeerId, e.to_string()).await;
                close_conn(conn.as_ref()).await;
                return;
            }
        };

        let handle = Arc::new(PeerHandle {
            conn_id: self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed),
            writer,
        });

        // The ack must be the first frame the peer sees, even when another
        // peer forwards to it the moment it becomes reachable
        let held = handle.writer.hold().await;
        let refused = {
            let mut registry = self.inner.registry.write().await;
            if self.inner.closed.is_closed() {
                Some(None)
            } else if registry.contains_key(&peer_id) {
                Some(Some((
                    RegisterErrorCode::AlreadyRegistered,
                    format!("peer id {peer_id} is already registered"),
                )))
            } else if registry.len() >= self.inner.config.max_clients {
                Some(Some((
                    RegisterErrorCode::ServerFull,
                    "Server at capacity".to_string(),
                )))
            } else {
                registry.insert(peer_id.clone(), handle.clone());
                None
            }
        };

        if let Some(refusal) = refused {
            if let Some((code, reason)) = refusal {
                tracing::info!("Refused registration of {} from {}: {}", peer_id, remote, code);
                let refusal = Frame::RegisterErr { code, reason };
                if let Err(e) = held.send(&refusal).await {
                    tracing::debug!("Registration refusal not sent: {}", e);
                }
            }
            drop(held);
            close_conn(conn.as_ref()).await;
            return;
        }

        let acked = held.send(&Frame::RegisterOk).await;
        drop(held);
        if let Err(e) = acked {
            tracing::debug!("Registration ack to {} failed: {}", remote, e);
            self.unregister(&peer_id, handle.conn_id).await;
            close_conn(conn.as_ref()).await;
            return;
        }
        tracing::info!("Peer {} registered from {}", peer_id, remote);

        self.route(&peer_id, &handle, &mut reader, conn.kind()).await;

        self.unregister(&peer_id, handle.conn_id).await;
        close_conn(conn.as_ref()).await;
        tracing::info!("Peer {} unregistered", peer_id);
    }

    /// Forward frames from one registered peer until its connection ends
    async fn route(
        &self,
        source: &PeerId,
        handle: &PeerHandle,
        reader: &mut FrameReader,
        kind: TransportKind,
    ) {
        let mut limiter = RateLimiter::new(self.inner.config.rate_limit, Duration::from_secs(1));

        loop {
            let next =
                tokio::time::timeout(self.inner.config.client_timeout, reader.read_frame()).await;
            let frame = match next {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => break,
                Ok(Err(e)) if kind == TransportKind::Datagram && !e.is_transport_lost() => {
                    tracing::warn!("Dropping undecodable frame from {}: {}", source, e);
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::debug!("Read from {} failed: {}", source, e);
                    break;
                }
                Err(_) => {
                    tracing::info!("Peer {} timed out", source);
                    break;
                }
            };

            match frame {
                Frame::Data { peer_id, payload } => {
                    if !limiter.check() {
                        tracing::warn!("Rate limit exceeded for {}, dropping frame", source);
                        continue;
                    }
                    let forward = Frame::Data {
                        peer_id: source.clone(),
                        payload,
                    };
                    self.forward(source, &peer_id, &forward).await;
                }
                Frame::Close { peer_id } => {
                    if !limiter.check() {
                        tracing::warn!("Rate limit exceeded for {}, dropping frame", source);
                        continue;
                    }
                    let forward = Frame::Close {
                        peer_id: source.clone(),
                    };
                    self.forward(source, &peer_id, &forward).await;
                }
                Frame::Keepalive => {
                    tracing::trace!("Keepalive from {}", source);
                    if let Err(e) = handle.writer.send(&Frame::Keepalive).await {
                        tracing::debug!("Keepalive reply to {} failed: {}", source, e);
                        break;
                    }
                }
                other => {
                    tracing::debug!(
                        "Ignoring stray {} from registered peer {}",
                        other.message_type(),
                        source
                    );
                }
            }
        }
    }

    /// Send `frame` to `dest` if it is registered
    async fn forward(&self, source: &PeerId, dest: &PeerId, frame: &Frame) {
        // Clone the handle so the lock is released before writing
        let target = self.inner.registry.read().await.get(dest).cloned();

        match target {
            Some(target) => {
                if let Err(e) = target.writer.send(frame).await {
                    tracing::warn!(
                        "Forwarding {} from {} to {} failed: {}",
                        frame.message_type(),
                        source,
                        dest,
                        e
                    );
                }
            }
            None => {
                tracing::debug!("No route from {} to {}, dropping frame", source, dest);
            }
        }
    }

    /// Remove `peer_id` if the entry still belongs to connection `conn_id`
    async fn unregister(&self, peer_id: &PeerId, conn_id: u64) {
        let mut registry = self.inner.registry.write().await;
        if registry
            .get(peer_id)
            .is_some_and(|handle| handle.conn_id == conn_id)
        {
            registry.remove(peer_id);
        }
    }
}

async fn reject(writer: &FrameWriter, code: RegisterErrorCode, reason: String) {
    if let Err(e) = writer.send(&Frame::RegisterErr { code, reason }).await {
        tracing::debug!("Registration refusal not sent: {}", e);
    }
}

async fn close_conn(conn: &dyn Connection) {
    if let Err(e) = conn.close().await {
        tracing::trace!("Close of {} failed: {}", conn.remote_addr(), e);
    }
}

async fn close_listener(listener: &dyn Listener) {
    if let Err(e) = listener.close().await {
        tracing::trace!("Listener close failed: {}", e);
    }
}
