//! Inbound Direct Channels.

use super::channel::pump;
use super::ClientEvent;
use crate::error::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listens for Direct Channels from other peers.
///
/// Every `P2P_MESSAGE` received on an accepted channel is published as a
/// [`ClientEvent::DirectMessage`]. Dropping the listener stops accepting
/// and closes all accepted channels.
pub struct PeerListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl PeerListener {
    /// Bind to `addr` (port 0 picks an ephemeral port) and start accepting.
    pub async fn bind(addr: SocketAddr, events: broadcast::Sender<ClientEvent>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "peer listener bound");

        let task = tokio::spawn(accept_loop(listener, events));
        Ok(Self { local_addr, task })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port, as advertised to the rendezvous server.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        // Aborting drops the JoinSet, which aborts every channel task
        self.task.abort();
    }
}

impl std::fmt::Debug for PeerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, events: broadcast::Sender<ClientEvent>) {
    let mut channels = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "direct channel accepted");
                    let _ = stream.set_nodelay(true);
                    // Inbound channels are read-only here; the write half
                    // stays open so the initiator does not see EOF.
                    let (read_half, write_half) = stream.into_split();
                    let events = events.clone();
                    channels.spawn(async move {
                        pump(read_half, remote, events, CancellationToken::new()).await;
                        drop(write_half);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "peer accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = channels.join_next() => {}
        }
    }
}
