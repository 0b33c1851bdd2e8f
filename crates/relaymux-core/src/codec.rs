//! Frame transmission over a physical connection.
//!
//! Stream connections carry frames as `length (4, big-endian) || frame`;
//! datagram connections carry exactly one frame per datagram.

use crate::MAX_FRAME_SIZE;
use crate::error::{RelayError, Result};
use crate::protocol::Frame;
use relaymux_transport::{Connection, TransportError, TransportKind};
use std::io;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Length prefix size on stream connections
pub const LENGTH_PREFIX_SIZE: usize = 4;

const READ_CHUNK: usize = 16 * 1024;

/// Encode a frame with its big-endian length prefix
///
/// # Errors
///
/// Returns `RelayError::FrameTooLarge` if the frame exceeds [`MAX_FRAME_SIZE`].
pub fn encode_length_prefixed(frame: &Frame) -> Result<Vec<u8>> {
    let body = frame.to_bytes()?;
    let len = u32::try_from(body.len()).map_err(|_| RelayError::FrameTooLarge {
        size: body.len(),
        max: MAX_FRAME_SIZE,
    })?;

    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Incremental decoder for length-prefixed frames.
///
/// Bytes may be fed in arbitrary chunks; frames come out once complete.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a frame
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the announced length exceeds [`MAX_FRAME_SIZE`] or
    /// the frame does not decode. The stream cannot be resynchronized after
    /// an error.
    pub fn decode_next(&mut self) -> Result<Option<Frame>> {
        let Some((prefix, rest)) = self.buf.split_first_chunk::<LENGTH_PREFIX_SIZE>() else {
            return Ok(None);
        };

        let len = u32::from_be_bytes(*prefix) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(RelayError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if rest.len() < len {
            return Ok(None);
        }

        let frame = Frame::from_bytes(&rest[..len])?;
        self.buf.drain(..LENGTH_PREFIX_SIZE + len);
        Ok(Some(frame))
    }
}

/// Serialized frame writer shared by every user of one physical connection.
///
/// One frame is handed to the transport in a single `write` call while the
/// internal lock is held, so frames from concurrent writers never interleave.
pub struct FrameWriter {
    conn: Arc<dyn Connection>,
    lock: Mutex<()>,
}

impl FrameWriter {
    /// Create a writer for `conn`
    #[must_use]
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            conn,
            lock: Mutex::new(()),
        }
    }

    /// Send one frame
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded or the transport write
    /// fails.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = self.encode(frame)?;
        let _guard = self.lock.lock().await;
        self.conn.write(&bytes).await?;
        Ok(())
    }

    /// Take exclusive use of the writer.
    ///
    /// Other senders wait until the returned guard is dropped, so the
    /// holder's frames go out before anything queued behind it.
    pub async fn hold(&self) -> HeldWriter<'_> {
        HeldWriter {
            writer: self,
            _guard: self.lock.lock().await,
        }
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        match self.conn.kind() {
            TransportKind::Stream => encode_length_prefixed(frame),
            TransportKind::Datagram => frame.to_bytes(),
        }
    }

    /// The underlying connection
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }
}

/// Exclusive access to a [`FrameWriter`], see [`FrameWriter::hold`]
pub struct HeldWriter<'a> {
    writer: &'a FrameWriter,
    _guard: MutexGuard<'a, ()>,
}

impl HeldWriter<'_> {
    /// Send one frame without giving up the writer
    ///
    /// # Errors
    ///
    /// Same as [`FrameWriter::send`].
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = self.writer.encode(frame)?;
        self.writer.conn.write(&bytes).await?;
        Ok(())
    }
}

/// Frame reader owned by the single read loop of a physical connection.
pub struct FrameReader {
    conn: Arc<dyn Connection>,
    decoder: FrameDecoder,
    scratch: Vec<u8>,
}

impl FrameReader {
    /// Create a reader for `conn`
    #[must_use]
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        let scratch_size = match conn.kind() {
            TransportKind::Stream => READ_CHUNK,
            TransportKind::Datagram => relaymux_transport::datagram::MAX_UDP_PAYLOAD,
        };

        Self {
            conn,
            decoder: FrameDecoder::new(),
            scratch: vec![0u8; scratch_size],
        }
    }

    /// Read the next frame
    ///
    /// Returns `Ok(None)` when the remote side closed the connection cleanly
    /// between frames.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, on a connection closed in the
    /// middle of a frame or on an undecodable frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        match self.conn.kind() {
            TransportKind::Stream => self.read_stream_frame().await,
            TransportKind::Datagram => self.read_datagram_frame().await,
        }
    }

    async fn read_stream_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode_next()? {
                return Ok(Some(frame));
            }

            let n = self.conn.read(&mut self.scratch).await?;
            if n == 0 {
                if self.decoder.buffered() == 0 {
                    return Ok(None);
                }
                return Err(RelayError::Transport(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))));
            }
            self.decoder.extend(&self.scratch[..n]);
        }
    }

    async fn read_datagram_frame(&mut self) -> Result<Option<Frame>> {
        let n = self.conn.read(&mut self.scratch).await?;
        if n == 0 {
            return Ok(None);
        }
        Frame::from_bytes(&self.scratch[..n]).map(Some)
    }
}
