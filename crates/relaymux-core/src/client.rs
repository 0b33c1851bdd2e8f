//! Relay client: registration, demultiplexing and reconnection.

use crate::codec::{FrameReader, FrameWriter};
use crate::conn::{ConnShared, ConnTable, VirtualConn, lock_table};
use crate::error::{RelayError, Result};
use crate::protocol::{Frame, PeerId};
use crate::supervisor::{Supervisor, SupervisorState};
use crate::{IDLE_TIMEOUT, KEEPALIVE_INTERVAL, RECONNECT_INTERVAL, REGISTRATION_TIMEOUT};
use relaymux_transport::{CloseSignal, Connection, Dialer, StreamDialer, TransportKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Bound on dial plus registration handshake
    pub registration_timeout: Duration,
    /// Delay between reconnection attempts
    pub reconnect_interval: Duration,
    /// Keepalive period (zero disables keepalives)
    pub keepalive_interval: Duration,
    /// Silence after which the physical connection is considered dead
    pub idle_timeout: Duration,
    /// Per virtual connection inbound queue bound
    pub max_queued_bytes: usize,
    /// Inbound virtual connections waiting for `accept`
    pub accept_backlog: usize,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            registration_timeout: REGISTRATION_TIMEOUT,
            reconnect_interval: RECONNECT_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
            max_queued_bytes: 4 * 1024 * 1024,
            accept_backlog: 64,
        }
    }
}

/// Events reported by session tasks to the supervisor task
#[derive(Debug)]
enum SessionEvent {
    TransportLost { session_id: u64 },
}

/// One registered physical connection
struct Session {
    id: u64,
    writer: Arc<FrameWriter>,
    /// Tripped before the session's connections are torn down
    ended: CloseSignal,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.writer.connection().close().await {
            tracing::trace!("Closing relay connection failed: {}", e);
        }
    }
}

struct ClientInner {
    server_addr: String,
    peer_id: PeerId,
    config: RelayClientConfig,
    dialer: Arc<dyn Dialer>,
    supervisor: Mutex<Supervisor>,
    session: Mutex<Option<Session>>,
    conns: Arc<ConnTable>,
    accept_tx: mpsc::Sender<VirtualConn>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<VirtualConn>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    connect_lock: tokio::sync::Mutex<()>,
    closed: CloseSignal,
    next_session: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.closed.close();
        if let Some(session) = lock(&self.session).take() {
            for task in &session.tasks {
                task.abort();
            }
        }
    }
}

/// Client side of the relay protocol.
///
/// Holds one physical connection to the relay server, registered under the
/// local peer id, and multiplexes [`VirtualConn`]s to any number of remote
/// peers over it. After a transport failure the client keeps re-registering
/// every `reconnect_interval` until it succeeds or is closed.
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    /// Create a client for `server_addr` (`host:port`) over TCP with
    /// default settings. Nothing is dialed until [`connect`](Self::connect).
    #[must_use]
    pub fn new(server_addr: impl Into<String>, peer_id: PeerId) -> Self {
        Self::with_config(
            server_addr,
            peer_id,
            RelayClientConfig::default(),
            Arc::new(StreamDialer::new()),
        )
    }

    /// Create a client with explicit settings and transport
    #[must_use]
    pub fn with_config(
        server_addr: impl Into<String>,
        peer_id: PeerId,
        config: RelayClientConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(ClientInner {
                server_addr: server_addr.into(),
                peer_id,
                config,
                dialer,
                supervisor: Mutex::new(Supervisor::new()),
                session: Mutex::new(None),
                conns: Arc::new(Mutex::new(HashMap::new())),
                accept_tx,
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                connect_lock: tokio::sync::Mutex::new(()),
                closed: CloseSignal::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Dial the server and register.
    ///
    /// On success a read loop starts demultiplexing inbound frames and the
    /// client reconnects on its own after any later transport failure.
    /// Calling `connect` on a registered client is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::RegistrationTimeout` if dial plus handshake take
    /// longer than the registration timeout, `RegistrationRejected` if the
    /// server refuses the peer id, a transport error if the dial fails and
    /// `ClientClosed` after [`close`](Self::close).
    pub async fn connect(&self) -> Result<()> {
        self.inner.register().await?;
        self.inner.start_supervisor();
        Ok(())
    }

    /// Get the virtual connection to `remote`, creating it if needed.
    ///
    /// Purely local: the remote peer learns about the connection with the
    /// first payload. Succeeds even if `remote` is not registered anywhere.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotRegistered` while the client has no registered
    /// physical connection and `ClientClosed` after [`close`](Self::close).
    pub fn open_conn(&self, remote: &PeerId) -> Result<VirtualConn> {
        let inner = &self.inner;
        if inner.closed.is_closed() {
            return Err(RelayError::ClientClosed);
        }

        let (writer, ended) = lock(&inner.session)
            .as_ref()
            .map(|session| (session.writer.clone(), session.ended.clone()))
            .ok_or(RelayError::NotRegistered)?;

        let mut conns = lock_table(&inner.conns);
        // Teardown trips `ended` before it sweeps the table
        if ended.is_closed() {
            return Err(if inner.closed.is_closed() {
                RelayError::ClientClosed
            } else {
                RelayError::NotRegistered
            });
        }
        if let Some(existing) = conns.get(remote).filter(|shared| shared.is_open()) {
            return Ok(VirtualConn::new(existing.clone(), Arc::downgrade(&inner.conns)));
        }

        let shared = Arc::new(ConnShared::new(
            remote.clone(),
            writer,
            inner.config.max_queued_bytes,
        ));
        conns.insert(remote.clone(), shared.clone());
        tracing::debug!("Opened virtual connection {} -> {}", inner.peer_id, remote);

        Ok(VirtualConn::new(shared, Arc::downgrade(&inner.conns)))
    }

    /// Wait for a virtual connection opened by a remote peer.
    ///
    /// A connection is announced here when the first payload from a peer
    /// without a local connection arrives.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ClientClosed` once the client is closed.
    pub async fn accept(&self) -> Result<VirtualConn> {
        let inner = &self.inner;
        if inner.closed.is_closed() {
            return Err(RelayError::ClientClosed);
        }

        let mut accept_rx = tokio::select! {
            guard = inner.accept_rx.lock() => guard,
            () = inner.closed.closed() => return Err(RelayError::ClientClosed),
        };

        tokio::select! {
            () = inner.closed.closed() => Err(RelayError::ClientClosed),
            conn = accept_rx.recv() => conn.ok_or(RelayError::ClientClosed),
        }
    }

    /// Close the client.
    ///
    /// Every virtual connection is closed (blocked readers see EOF), the
    /// physical connection is closed and reconnection stops. Idempotent.
    ///
    /// # Errors
    ///
    /// Never fails today.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.closed.close() {
            return Ok(());
        }
        lock(&inner.supervisor).stop();

        let session = lock(&inner.session).take();
        if let Some(session) = &session {
            session.ended.close();
        }
        let conns: Vec<_> = lock_table(&inner.conns).drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.mark_client_closed();
        }
        if let Some(session) = session {
            session.shutdown().await;
        }

        tracing::info!("Relay client {} closed", inner.peer_id);
        Ok(())
    }

    /// Current reconnection state
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        lock(&self.inner.supervisor).state()
    }

    /// Check if registered with the server right now
    #[must_use]
    pub fn is_registered(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    /// Local peer id
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    /// Relay server address
    #[must_use]
    pub fn server_addr(&self) -> &str {
        &self.inner.server_addr
    }

    /// Number of tracked virtual connections
    #[must_use]
    pub fn conn_count(&self) -> usize {
        lock_table(&self.inner.conns).len()
    }

    /// Successful reconnections after transport failures
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        lock(&self.inner.supervisor).reconnects()
    }
}

impl ClientInner {
    /// One connect-and-register attempt
    async fn register(self: &Arc<Self>) -> Result<()> {
        let _attempt = self.connect_lock.lock().await;
        if self.closed.is_closed() {
            return Err(RelayError::ClientClosed);
        }
        if lock(&self.session).is_some() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + self.config.registration_timeout;
        let conn = tokio::time::timeout_at(deadline, self.dialer.dial(&self.server_addr))
            .await
            .map_err(|_| RelayError::RegistrationTimeout)??;

        let handshake = tokio::time::timeout_at(deadline, self.handshake(conn.clone())).await;
        let (writer, reader) = match handshake {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                close_quietly(&conn).await;
                return Err(e);
            }
            Err(_) => {
                close_quietly(&conn).await;
                return Err(RelayError::RegistrationTimeout);
            }
        };

        self.install(Arc::new(writer), reader, conn).await?;
        tracing::info!(
            "Registered with relay {} as {}",
            self.server_addr,
            self.peer_id
        );
        Ok(())
    }

    async fn handshake(&self, conn: Arc<dyn Connection>) -> Result<(FrameWriter, FrameReader)> {
        let writer = FrameWriter::new(conn.clone());
        let mut reader = FrameReader::new(conn);

        writer
            .send(&Frame::Register {
                peer_id: self.peer_id.to_string(),
            })
            .await?;

        match reader.read_frame().await? {
            Some(Frame::RegisterOk) => Ok((writer, reader)),
            Some(Frame::RegisterErr { code, reason }) => {
                Err(RelayError::RegistrationRejected { code, reason })
            }
            Some(other) => Err(RelayError::UnexpectedFrame(other.message_type())),
            None => Err(RelayError::TransportLost),
        }
    }

    /// Make a freshly registered connection the active session
    async fn install(
        self: &Arc<Self>,
        writer: Arc<FrameWriter>,
        reader: FrameReader,
        conn: Arc<dyn Connection>,
    ) -> Result<()> {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);

        // Connections from the previous session stay transport-lost
        lock_table(&self.conns).retain(|_, conn| conn.is_open());

        let installed = {
            let mut slot = lock(&self.session);
            if self.closed.is_closed() {
                false
            } else {
                let ended = CloseSignal::new();
                let mut tasks = vec![tokio::spawn(read_loop(ReadLoop {
                    session_id,
                    peer_id: self.peer_id.clone(),
                    reader,
                    writer: writer.clone(),
                    ended: ended.clone(),
                    kind: conn.kind(),
                    conns: self.conns.clone(),
                    accept_tx: self.accept_tx.clone(),
                    events_tx: self.events_tx.clone(),
                    closed: self.closed.clone(),
                    idle_timeout: self.config.idle_timeout,
                    max_queued_bytes: self.config.max_queued_bytes,
                }))];
                if !self.config.keepalive_interval.is_zero() {
                    tasks.push(tokio::spawn(keepalive_loop(
                        session_id,
                        writer.clone(),
                        self.config.keepalive_interval,
                        self.events_tx.clone(),
                        self.closed.clone(),
                    )));
                }

                *slot = Some(Session {
                    id: session_id,
                    writer,
                    ended,
                    tasks,
                });
                lock(&self.supervisor).on_registered();
                true
            }
        };

        if !installed {
            close_quietly(&conn).await;
            return Err(RelayError::ClientClosed);
        }
        Ok(())
    }

    /// Spawn the reconnection driver, once per client
    fn start_supervisor(self: &Arc<Self>) {
        let Some(events_rx) = lock(&self.events_rx).take() else {
            return;
        };
        tokio::spawn(supervise(
            Arc::downgrade(self),
            events_rx,
            self.closed.clone(),
            self.config.reconnect_interval,
        ));
    }

    /// Tear down session `session_id` after a transport failure.
    ///
    /// Returns `false` if that session is no longer the active one.
    async fn drop_session(&self, session_id: u64) -> bool {
        // The sweep runs under the session lock so a concurrent install
        // cannot slip new connections in before it
        let (session, affected) = {
            let mut slot = lock(&self.session);
            if !slot.as_ref().is_some_and(|session| session.id == session_id) {
                return false;
            }
            let Some(session) = slot.take() else {
                return false;
            };
            session.ended.close();

            let conns = lock_table(&self.conns);
            for conn in conns.values() {
                conn.mark_transport_lost();
            }
            (session, conns.len())
        };

        lock(&self.supervisor).on_transport_lost();
        session.shutdown().await;

        tracing::warn!(
            "Relay connection to {} lost ({} virtual connections affected)",
            self.server_addr,
            affected
        );
        true
    }
}

async fn close_quietly(conn: &Arc<dyn Connection>) {
    if let Err(e) = conn.close().await {
        tracing::trace!("Close of {} failed: {}", conn.remote_addr(), e);
    }
}

/// Reconnection driver
///
/// Holds only a weak reference so dropping every client handle ends it.
async fn supervise(
    client: Weak<ClientInner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    closed: CloseSignal,
    reconnect_interval: Duration,
) {
    loop {
        let event = tokio::select! {
            () = closed.closed() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let SessionEvent::TransportLost { session_id } = event;
        let Some(inner) = client.upgrade() else {
            return;
        };
        if !inner.drop_session(session_id).await {
            continue;
        }
        drop(inner);

        loop {
            tokio::select! {
                () = closed.closed() => return,
                () = tokio::time::sleep(reconnect_interval) => {}
            }

            let Some(inner) = client.upgrade() else {
                return;
            };
            if lock(&inner.session).is_some() {
                // Re-registered through an explicit connect()
                break;
            }
            if !lock(&inner.supervisor).begin_attempt() {
                if inner.closed.is_closed() {
                    return;
                }
                break;
            }

            match inner.register().await {
                Ok(()) => {
                    tracing::info!("Reconnected to relay {}", inner.server_addr);
                    break;
                }
                Err(e) => {
                    lock(&inner.supervisor).on_attempt_failed();
                    tracing::debug!(
                        "Reconnect to {} failed (attempt {}): {}",
                        inner.server_addr,
                        lock(&inner.supervisor).attempts(),
                        e
                    );
                }
            }
        }
    }
}

async fn keepalive_loop(
    session_id: u64,
    writer: Arc<FrameWriter>,
    interval: Duration,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    closed: CloseSignal,
) {
    loop {
        tokio::select! {
            () = closed.closed() => return,
            () = tokio::time::sleep(interval) => {}
        }

        if let Err(e) = writer.send(&Frame::Keepalive).await {
            tracing::debug!("Keepalive failed: {}", e);
            let _ = events_tx.send(SessionEvent::TransportLost { session_id });
            return;
        }
        tracing::trace!("Keepalive sent");
    }
}

struct ReadLoop {
    session_id: u64,
    peer_id: PeerId,
    reader: FrameReader,
    writer: Arc<FrameWriter>,
    ended: CloseSignal,
    kind: TransportKind,
    conns: Arc<ConnTable>,
    accept_tx: mpsc::Sender<VirtualConn>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    closed: CloseSignal,
    idle_timeout: Duration,
    max_queued_bytes: usize,
}

/// Demultiplex inbound frames until the physical connection fails
async fn read_loop(mut ctx: ReadLoop) {
    loop {
        let next = tokio::select! {
            () = ctx.closed.closed() => return,
            next = tokio::time::timeout(ctx.idle_timeout, ctx.reader.read_frame()) => next,
        };

        let frame = match next {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                tracing::debug!("Relay closed the connection");
                break;
            }
            Ok(Err(e)) if ctx.kind == TransportKind::Datagram && !e.is_transport_lost() => {
                tracing::warn!("Dropping undecodable datagram frame: {}", e);
                continue;
            }
            Ok(Err(e)) => {
                tracing::debug!("Relay read failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::warn!("Relay connection idle for {:?}", ctx.idle_timeout);
                break;
            }
        };

        match frame {
            Frame::Data { peer_id, payload } => ctx.deliver(peer_id, payload),
            Frame::Close { peer_id } => {
                let conn = lock_table(&ctx.conns).remove(&peer_id);
                if let Some(conn) = conn {
                    tracing::debug!("Peer {} closed its connection", peer_id);
                    conn.mark_remote_closed();
                }
            }
            Frame::Keepalive => tracing::trace!("Keepalive received"),
            other => tracing::debug!("Ignoring unexpected {} frame", other.message_type()),
        }
    }

    if !ctx.closed.is_closed() {
        let _ = ctx.events_tx.send(SessionEvent::TransportLost {
            session_id: ctx.session_id,
        });
    }
}

impl ReadLoop {
    fn deliver(&self, remote: PeerId, payload: Vec<u8>) {
        let (shared, created) = {
            let mut conns = lock_table(&self.conns);
            if self.ended.is_closed() {
                tracing::trace!("Session ended, dropping payload from {}", remote);
                return;
            }
            match conns.get(&remote).filter(|shared| shared.is_open()) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let shared = Arc::new(ConnShared::new(
                        remote.clone(),
                        self.writer.clone(),
                        self.max_queued_bytes,
                    ));
                    conns.insert(remote.clone(), shared.clone());
                    (shared, true)
                }
            }
        };

        shared.push(payload);

        if created {
            tracing::debug!("Inbound virtual connection {} -> {}", remote, self.peer_id);
            let conn = VirtualConn::new(shared, Arc::downgrade(&self.conns));
            if self.accept_tx.try_send(conn).is_err() {
                tracing::warn!(
                    "Accept backlog full, {} is only reachable through open_conn",
                    remote
                );
            }
        }
    }
}
