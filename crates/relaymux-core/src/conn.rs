//! Virtual connections multiplexed over one physical relay connection.

use crate::MAX_PAYLOAD_SIZE;
use crate::codec::FrameWriter;
use crate::error::{RelayError, Result};
use crate::protocol::{Frame, PeerId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;

/// Live virtual connections of one client, keyed by remote peer.
pub(crate) type ConnTable = Mutex<HashMap<PeerId, Arc<ConnShared>>>;

pub(crate) fn lock_table(table: &ConnTable) -> MutexGuard<'_, HashMap<PeerId, Arc<ConnShared>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnStatus {
    Open,
    /// Peer sent `Close`; queued bytes drain, then EOF
    RemoteClosed,
    /// Closed through this handle
    LocalClosed,
    /// The owning client was closed
    ClientClosed,
    /// The physical connection failed
    TransportLost,
}

struct ConnState {
    queue: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already handed out
    offset: usize,
    queued_bytes: usize,
    status: ConnStatus,
}

/// State shared by every handle of one virtual connection and the read loop.
pub(crate) struct ConnShared {
    remote: PeerId,
    writer: Arc<FrameWriter>,
    max_queued_bytes: usize,
    state: Mutex<ConnState>,
    notify: Notify,
}

impl ConnShared {
    pub(crate) fn new(remote: PeerId, writer: Arc<FrameWriter>, max_queued_bytes: usize) -> Self {
        Self {
            remote,
            writer,
            max_queued_bytes,
            state: Mutex::new(ConnState {
                queue: VecDeque::new(),
                offset: 0,
                queued_bytes: 0,
                status: ConnStatus::Open,
            }),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state().status == ConnStatus::Open
    }

    /// Queue an inbound payload. Payloads over the queue bound are dropped.
    pub(crate) fn push(&self, payload: Vec<u8>) {
        if payload.is_empty() {
            return;
        }

        {
            let mut state = self.state();
            if state.status != ConnStatus::Open {
                return;
            }
            if state.queued_bytes + payload.len() > self.max_queued_bytes {
                tracing::warn!(
                    "Inbound queue for {} full ({} bytes), dropping {} bytes",
                    self.remote,
                    state.queued_bytes,
                    payload.len()
                );
                return;
            }
            state.queued_bytes += payload.len();
            state.queue.push_back(payload);
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn mark_remote_closed(&self) {
        self.transition(|status| status == ConnStatus::Open, ConnStatus::RemoteClosed);
    }

    pub(crate) fn mark_transport_lost(&self) {
        self.transition(|status| status == ConnStatus::Open, ConnStatus::TransportLost);
    }

    pub(crate) fn mark_client_closed(&self) {
        self.transition(
            |status| status != ConnStatus::LocalClosed,
            ConnStatus::ClientClosed,
        );
    }

    fn transition(&self, allowed: impl Fn(ConnStatus) -> bool, next: ConnStatus) {
        {
            let mut state = self.state();
            if !allowed(state.status) {
                return;
            }
            state.status = next;
        }
        self.notify.notify_waiters();
    }
}

/// An ordered byte stream to one remote peer, carried over the client's
/// physical relay connection.
///
/// Handles are cheap clones sharing the same stream. Reads see EOF once the
/// peer closes its end, and `RelayError::TransportLost` if the physical
/// connection fails; a lost connection is never revived, open a new one
/// after the client re-registers.
#[derive(Clone)]
pub struct VirtualConn {
    shared: Arc<ConnShared>,
    table: Weak<ConnTable>,
}

impl VirtualConn {
    pub(crate) fn new(shared: Arc<ConnShared>, table: Weak<ConnTable>) -> Self {
        Self { shared, table }
    }

    /// Remote peer of this connection
    #[must_use]
    pub fn remote_peer(&self) -> &PeerId {
        &self.shared.remote
    }

    /// Check if the connection is still open in both directions
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Read queued bytes into `buf`.
    ///
    /// Blocks until data is available. Returns `Ok(0)` once the peer closed
    /// the connection and every queued byte was read.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ConnClosed` after a local `close` and
    /// `RelayError::TransportLost` if the physical connection failed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state();
                if state.status == ConnStatus::LocalClosed {
                    return Err(RelayError::ConnClosed);
                }
                if buf.is_empty() {
                    return Ok(0);
                }

                if let Some(front) = state.queue.front() {
                    let available = &front[state.offset..];
                    let n = available.len().min(buf.len());
                    buf[..n].copy_from_slice(&available[..n]);

                    if n == available.len() {
                        state.queue.pop_front();
                        state.offset = 0;
                    } else {
                        state.offset += n;
                    }
                    state.queued_bytes -= n;
                    return Ok(n);
                }

                match state.status {
                    ConnStatus::RemoteClosed | ConnStatus::ClientClosed => return Ok(0),
                    ConnStatus::TransportLost => return Err(RelayError::TransportLost),
                    ConnStatus::Open | ConnStatus::LocalClosed => {}
                }
            }

            notified.await;
        }
    }

    /// Write `buf` to the remote peer.
    ///
    /// Large buffers are split into several `Data` frames. Returns the number
    /// of bytes written, which is always `buf.len()` on success: once every
    /// frame went out the write succeeds even if the connection closes
    /// right after.
    ///
    /// # Errors
    ///
    /// Returns an error once the connection is closed (locally, by the peer
    /// or with the client) or the physical connection failed.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        for chunk in buf.chunks(MAX_PAYLOAD_SIZE) {
            self.check_writable()?;
            self.shared
                .writer
                .send(&Frame::Data {
                    peer_id: self.shared.remote.clone(),
                    payload: chunk.to_vec(),
                })
                .await?;
        }
        Ok(buf.len())
    }

    fn check_writable(&self) -> Result<()> {
        match self.shared.state().status {
            ConnStatus::Open => Ok(()),
            ConnStatus::RemoteClosed | ConnStatus::LocalClosed => Err(RelayError::ConnClosed),
            ConnStatus::ClientClosed => Err(RelayError::ClientClosed),
            ConnStatus::TransportLost => Err(RelayError::TransportLost),
        }
    }

    /// Close the connection.
    ///
    /// Pending and later reads and writes fail immediately. The peer is told
    /// with a best-effort `Close` frame. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for transports that report
    /// close errors.
    pub async fn close(&self) -> Result<()> {
        let was_open = {
            let mut state = self.shared.state();
            if state.status == ConnStatus::LocalClosed {
                return Ok(());
            }
            let was_open = state.status == ConnStatus::Open;
            state.status = ConnStatus::LocalClosed;
            state.queue.clear();
            state.offset = 0;
            state.queued_bytes = 0;
            was_open
        };
        self.shared.notify.notify_waiters();

        if let Some(table) = self.table.upgrade() {
            let mut conns = lock_table(&table);
            if conns
                .get(&self.shared.remote)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.shared))
            {
                conns.remove(&self.shared.remote);
            }
        }

        if was_open {
            let close = Frame::Close {
                peer_id: self.shared.remote.clone(),
            };
            if let Err(e) = self.shared.writer.send(&close).await {
                tracing::debug!("Close frame to {} not sent: {}", self.shared.remote, e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for VirtualConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConn")
            .field("remote", &self.shared.remote)
            .field("status", &self.shared.state().status)
            .finish()
    }
}
