//! Server-side handle to one client connection.
//!
//! The handle owns the write half of the socket. The connection's own task
//! writes responses through it, and other tasks push relayed content and
//! presence updates through it. Every write is bounded by a timeout; a write
//! that times out or fails on the socket closes the connection, which wakes
//! the owning task so it can run disconnect cleanup. A frame the codec
//! refuses to encode is reported to the caller and nothing is written.

use crate::error::{Error, Result};
use crate::protocol::{Envelope, FrameCodec, ServerFrame};
use futures::SinkExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Unique id of an accepted connection, never reused within a process.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a client connection plus its close signal.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    writer: TokioMutex<FramedWrite<BoxedWriter, FrameCodec<Envelope<ServerFrame>>>>,
    closed: CancellationToken,
}

impl Connection {
    /// Wrap the write half of an accepted connection.
    pub fn new<W>(peer_addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            writer: TokioMutex::new(FramedWrite::new(writer, FrameCodec::new())),
            closed: CancellationToken::new(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address observed when the connection was accepted.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Write one frame, waiting at most `timeout` (lock + write + flush).
    ///
    /// Transport failures and timeouts close the connection before the error
    /// is returned; encoding failures leave it open.
    pub async fn send(&self, frame: Envelope<ServerFrame>, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let result = tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            writer.send(frame).await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_fatal() => {
                debug!(conn = self.id, addr = %self.peer_addr, error = %e, "write failed");
                self.close();
                Err(e)
            }
            Ok(Err(e)) => {
                debug!(conn = self.id, addr = %self.peer_addr, error = %e, "frame rejected");
                Err(e)
            }
            Err(_) => {
                debug!(conn = self.id, addr = %self.peer_addr, "write timed out");
                self.close();
                Err(Error::Timeout)
            }
        }
    }

    /// Signal the owning task to shut the connection down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Close and shut down the write half, bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.close();
        let _ = tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            let _ = writer.get_mut().shutdown().await;
        })
        .await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
