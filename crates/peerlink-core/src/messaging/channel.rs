//! Direct peer-to-peer channels.

use super::ClientEvent;
use crate::error::{Error, Result};
use crate::logging::RedactedContent;
use crate::protocol::{FrameCodec, PeerFrame};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An outbound connection to another peer's listener.
///
/// Frames the remote end writes back are surfaced as
/// [`ClientEvent::DirectMessage`]. Dropping the channel closes it.
pub struct DirectChannel {
    peer: String,
    addr: SocketAddr,
    writer: TokioMutex<FramedWrite<OwnedWriteHalf, FrameCodec<PeerFrame>>>,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl DirectChannel {
    /// Connect to `peer`'s listener at `addr`, waiting at most
    /// `connect_timeout`.
    pub async fn connect(
        peer: &str,
        addr: SocketAddr,
        connect_timeout: Duration,
        events: broadcast::Sender<ClientEvent>,
    ) -> Result<Self> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(peer = %peer, %addr, error = %e, "direct connect failed");
                return Err(e.into());
            }
            Err(_) => {
                debug!(peer = %peer, %addr, "direct connect timed out");
                return Err(Error::Timeout);
            }
        };
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let closed = CancellationToken::new();
        let reader = tokio::spawn(pump(read_half, addr, events, closed.clone()));

        debug!(peer = %peer, %addr, "direct channel open");
        Ok(Self {
            peer: peer.to_string(),
            addr,
            writer: TokioMutex::new(FramedWrite::new(write_half, FrameCodec::new())),
            closed,
            reader,
        })
    }

    /// Username this channel was opened to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Remote listener address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the channel has failed or been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Write one frame, waiting at most `timeout`. Any failure closes the
    /// channel.
    pub async fn send(&self, frame: PeerFrame, timeout: Duration) -> Result<()> {
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
            Ok(Err(e)) => {
                warn!(peer = %self.peer, addr = %self.addr, error = %e, "direct write failed");
                self.close();
                Err(e)
            }
            Err(_) => {
                warn!(peer = %self.peer, addr = %self.addr, "direct write timed out");
                self.close();
                Err(Error::Timeout)
            }
        }
    }

    /// Close the channel.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for DirectChannel {
    fn drop(&mut self) {
        self.closed.cancel();
        self.reader.abort();
    }
}

impl std::fmt::Debug for DirectChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectChannel")
            .field("peer", &self.peer)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read peer frames from `reader` and publish them as events until the
/// stream ends, fails, or `closed` fires. Cancels `closed` on exit.
pub(crate) async fn pump<R>(
    reader: R,
    remote: SocketAddr,
    events: broadcast::Sender<ClientEvent>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::<PeerFrame>::new());

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Ok(PeerFrame::P2pMessage { from, content, timestamp }))) => {
                    debug!(from = %from, %remote, size = %RedactedContent(&content), "direct message");
                    // No subscribers is not an error for the channel
                    let _ = events.send(ClientEvent::DirectMessage {
                        from,
                        content,
                        timestamp,
                        remote,
                    });
                }
                Some(Ok(Err(e))) => {
                    debug!(%remote, error = %e, "dropping malformed peer frame");
                }
                Some(Err(e)) => {
                    debug!(%remote, error = %e, "direct channel read failed");
                    break;
                }
                None => break,
            },
            _ = closed.cancelled() => break,
        }
    }

    debug!(%remote, "direct channel closed");
    closed.cancel();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::parse_line;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_and_read_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (events, mut rx) = broadcast::channel(8);

        let channel = DirectChannel::connect("bob", addr, Duration::from_secs(1), events)
            .await
            .expect("connect");
        let (stream, _) = listener.accept().await.expect("accept");
        let (remote_read, mut remote_write) = stream.into_split();

        channel
            .send(
                PeerFrame::P2pMessage {
                    from: "alice".into(),
                    content: "hi".into(),
                    timestamp: 1,
                },
                Duration::from_secs(1),
            )
            .await
            .expect("send");

        let mut line = String::new();
        BufReader::new(remote_read)
            .read_line(&mut line)
            .await
            .expect("read");
        let frame: PeerFrame = parse_line(line.trim_end().as_bytes()).expect("parse");
        assert!(matches!(frame, PeerFrame::P2pMessage { ref content, .. } if content == "hi"));

        remote_write
            .write_all(b"garbage\n{\"type\":\"P2P_MESSAGE\",\"from\":\"bob\",\"content\":\"yo\",\"timestamp\":2}\n")
            .await
            .expect("write");

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert!(matches!(event, ClientEvent::DirectMessage { ref from, ref content, .. }
            if from == "bob" && content == "yo"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port that is very likely closed
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr")
        };
        let (events, _rx) = broadcast::channel(8);

        let err = DirectChannel::connect("bob", addr, Duration::from_secs(1), events)
            .await
            .expect_err("refused");
        assert!(matches!(err, Error::Transport(_) | Error::Timeout));
    }

    #[tokio::test]
    async fn test_remote_close_marks_channel_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (events, _rx) = broadcast::channel(8);

        let channel = DirectChannel::connect("bob", addr, Duration::from_secs(1), events)
            .await
            .expect("connect");
        let (stream, _) = listener.accept().await.expect("accept");
        drop(stream);

        tokio::time::timeout(Duration::from_secs(2), channel.closed.cancelled())
            .await
            .expect("closed after EOF");
        assert!(channel.is_closed());
    }
}
