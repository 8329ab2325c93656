//! One framed TCP connection: serialized writes, a read loop that dispatches
//! control/chunk/stream frames in arrival order, and idempotent close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use beam_core::wire::{self, Frame, FrameHeader, StreamHeader, HEADER_SIZE};
use beam_core::{Envelope, FrameDecodeError, FrameEncodeError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Bounded read/write size for raw stream bodies.
pub const STREAM_BUF_SIZE: usize = 64 * 1024;

pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Identifying,
    Active,
    Closed,
}

/// Identity a peer announced with `identify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub device_id: String,
    pub device_name: String,
}

/// Open `addr` with a connect timeout.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(ConnectionError::ConnectTimeout(addr)),
    }
}

pub struct PeerConnection {
    id: ConnId,
    remote: SocketAddr,
    peer: StdMutex<Option<PeerInfo>>,
    state: watch::Sender<ConnState>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
}

impl PeerConnection {
    /// Wrap an accepted or connected socket. The read half goes to `run_read_loop`.
    pub fn new(
        stream: TcpStream,
        state: ConnState,
    ) -> Result<(Arc<Self>, OwnedReadHalf), ConnectionError> {
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (state, _) = watch::channel(state);
        let conn = Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            peer: StdMutex::new(None),
            state,
            writer: Mutex::new(BufWriter::new(writer)),
        });
        Ok((conn, reader))
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Move to `next` unless already closed.
    pub fn set_state(&self, next: ConnState) {
        self.state.send_if_modified(|s| {
            if *s == ConnState::Closed || *s == next {
                return false;
            }
            *s = next;
            true
        });
    }

    pub fn peer(&self) -> Option<PeerInfo> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.peer().map(|p| p.device_id)
    }

    /// Bind this connection to an identity; returns the previous one.
    pub fn set_peer(&self, info: PeerInfo) -> Option<PeerInfo> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(info)
    }

    /// Mark closed and wake the read loop. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == ConnState::Closed {
                return false;
            }
            *s = ConnState::Closed;
            true
        })
    }

    async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnState::Closed).await;
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        let bytes = wire::encode_frame(frame)?;
        let mut w = self.lock_writer().await?;
        let written = tokio::select! {
            biased;
            _ = self.wait_closed() => None,
            r = async {
                w.write_all(&bytes).await?;
                w.flush().await
            } => Some(r.map_err(|e| self.fail(e))),
        };
        self.settle(&mut w, written).await
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        self.send_frame(&envelope.to_frame()?).await
    }

    /// Write a stream-open header followed by exactly `header.size` bytes from
    /// `source`. Holds the write lock throughout so nothing interleaves.
    /// `progress` is called with the running byte count after each write.
    pub async fn send_stream<R, F>(
        &self,
        header: &StreamHeader,
        source: R,
        progress: F,
    ) -> Result<u64, ConnectionError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(u64) + Send,
    {
        let head = wire::encode_frame(&Frame::StreamOpen(header.clone()))?;
        let mut w = self.lock_writer().await?;
        let written = tokio::select! {
            biased;
            _ = self.wait_closed() => None,
            r = self.write_stream(&mut w, &head, header.size, source, progress) => Some(r),
        };
        self.settle(&mut w, written).await
    }

    async fn write_stream<R, F>(
        &self,
        w: &mut BufWriter<OwnedWriteHalf>,
        head: &[u8],
        size: u64,
        mut source: R,
        mut progress: F,
    ) -> Result<u64, ConnectionError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(u64) + Send,
    {
        w.write_all(head).await.map_err(|e| self.fail(e))?;
        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        let mut sent = 0u64;
        while sent < size {
            let want = (size - sent).min(buf.len() as u64) as usize;
            let n = match source.read(&mut buf[..want]).await {
                Ok(n) => n,
                Err(e) => {
                    self.close();
                    return Err(ConnectionError::Io(e));
                }
            };
            if n == 0 {
                // The peer expects `size` bytes; the only way out is to drop the connection.
                self.close();
                return Err(ConnectionError::SourceShort {
                    expected: size,
                    sent,
                });
            }
            w.write_all(&buf[..n]).await.map_err(|e| self.fail(e))?;
            sent += n as u64;
            progress(sent);
        }
        if size == 0 {
            progress(0);
        }
        w.flush().await.map_err(|e| self.fail(e))?;
        Ok(sent)
    }

    /// Wait for the write lock, giving up once the connection closes.
    async fn lock_writer(
        &self,
    ) -> Result<MutexGuard<'_, BufWriter<OwnedWriteHalf>>, ConnectionError> {
        tokio::select! {
            biased;
            _ = self.wait_closed() => Err(ConnectionError::Closed),
            w = self.writer.lock() => Ok(w),
        }
    }

    /// `None` means `close()` interrupted the write. Whatever was half written
    /// is abandoned and the socket shut down so the peer sees the end.
    async fn settle<T>(
        &self,
        w: &mut BufWriter<OwnedWriteHalf>,
        written: Option<Result<T, ConnectionError>>,
    ) -> Result<T, ConnectionError> {
        match written {
            Some(r) => r,
            None => {
                debug!(conn = self.id, remote = %self.remote, "closed during write");
                let _ = w.get_mut().shutdown().await;
                Err(ConnectionError::Closed)
            }
        }
    }

    /// Any write error is fatal to the connection.
    fn fail(&self, e: std::io::Error) -> ConnectionError {
        debug!(conn = self.id, remote = %self.remote, error = %e, "write failed");
        self.close();
        ConnectionError::Io(e)
    }

    async fn shutdown_writer(&self) {
        // A writer holding the lock is interrupted by the close and shuts down itself.
        if let Ok(mut w) = self.writer.try_lock() {
            let _ = w.get_mut().shutdown().await;
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-frame callbacks from a connection's read loop. `on_closed` runs exactly once.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_control(&self, conn: &Arc<PeerConnection>, json: String);
    async fn on_chunk(&self, conn: &Arc<PeerConnection>, payload: Vec<u8>);
    /// `body` yields at most `header.size` bytes; whatever is left unread is drained afterwards.
    async fn on_stream(
        &self,
        conn: &Arc<PeerConnection>,
        header: StreamHeader,
        body: &mut (dyn AsyncRead + Unpin + Send),
    );
    async fn on_closed(&self, conn: &Arc<PeerConnection>);
}

/// Something outgoing traffic can be written to: the host's identified
/// clients, or the client's single connection.
#[async_trait]
pub trait Link: Send + Sync {
    async fn connections(&self) -> Vec<Arc<PeerConnection>>;

    async fn is_connected(&self) -> bool {
        !self.connections().await.is_empty()
    }

    /// Write `frame` to every live connection. Succeeds if at least one accepted it.
    async fn send_frame(&self, frame: &Frame) -> Result<usize, ConnectionError> {
        let mut accepted = 0;
        let mut last_err = None;
        for conn in self.connections().await {
            match conn.send_frame(frame).await {
                Ok(()) => accepted += 1,
                Err(e) => last_err = Some(e),
            }
        }
        match (accepted, last_err) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(ConnectionError::NotConnected),
            (n, _) => Ok(n),
        }
    }
}

/// Read frames until EOF, a protocol error, an I/O error or `close()`.
/// Closes the connection and calls `on_closed` once on the way out.
pub async fn run_read_loop<H>(conn: Arc<PeerConnection>, reader: OwnedReadHalf, handler: Arc<H>)
where
    H: ConnectionHandler + ?Sized,
{
    let mut reader = BufReader::new(reader);
    let result = loop {
        let step = tokio::select! {
            biased;
            _ = conn.wait_closed() => break Ok(()),
            step = read_and_dispatch(&conn, &mut reader, handler.as_ref()) => step,
        };
        match step {
            Ok(true) => continue,
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    match result {
        Ok(()) => debug!(conn = conn.id, remote = %conn.remote, "connection ended"),
        Err(e) => warn!(conn = conn.id, remote = %conn.remote, error = %e, "connection dropped"),
    }
    conn.close();
    conn.shutdown_writer().await;
    handler.on_closed(&conn).await;
}

/// Read one frame and hand it to `handler`. `Ok(false)` on clean EOF between frames.
async fn read_and_dispatch<R, H>(
    conn: &Arc<PeerConnection>,
    reader: &mut R,
    handler: &H,
) -> Result<bool, ConnectionError>
where
    R: AsyncRead + Unpin + Send,
    H: ConnectionHandler + ?Sized,
{
    let Some(header) = read_header(reader).await? else {
        return Ok(false);
    };
    let mut body = vec![0u8; header.body_len];
    reader.read_exact(&mut body).await?;
    match wire::decode_body(header.kind, body)? {
        Frame::Control(json) => handler.on_control(conn, json).await,
        Frame::Chunk(payload) => handler.on_chunk(conn, payload).await,
        Frame::StreamOpen(stream) => {
            let size = stream.size;
            let mut limited = (&mut *reader).take(size);
            handler.on_stream(conn, stream, &mut limited).await;
            tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
            if limited.limit() > 0 {
                return Err(ConnectionError::StreamTruncated {
                    expected: size,
                    missing: limited.limit(),
                });
            }
        }
    }
    Ok(true)
}

/// Read the 5-byte frame prefix; `None` on EOF before its first byte.
pub async fn read_header<R>(reader: &mut R) -> Result<Option<FrameHeader>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; HEADER_SIZE];
    if reader.read(&mut prefix[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[1..]).await?;
    Ok(Some(wire::decode_header(&prefix)?))
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("connection closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("source ended after {sent} of {expected} bytes")]
    SourceShort { expected: u64, sent: u64 },
    #[error("stream ended with {missing} of {expected} bytes missing")]
    StreamTruncated { expected: u64, missing: u64 },
}
