//! Per-message delivery decision: direct first, relay on any failure.
//!
//! ```text
//! send(to) ──REQUEST_P2P──▶ P2P_INFO ok ──▶ cached / new DirectChannel ──▶ P2P_MESSAGE
//!                │                                   │                          │
//!                └── ok:false / timeout ─────────────┴── connect / write error ─┴──▶ RELAY
//! ```
//!
//! A channel is reused for later messages to the same peer while it stays
//! open and the brokered address is unchanged, so messages on one channel
//! arrive in send order.

use super::{ClientEvent, Delivery, DirectChannel, RendezvousClient, RouterConfig};
use crate::error::{Error, Result};
use crate::logging::RedactedContent;
use crate::protocol::{unix_timestamp, PeerFrame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Routes outgoing messages over Direct Channels or the server relay.
pub struct MessageRouter {
    client: Arc<RendezvousClient>,
    config: RouterConfig,
    events: broadcast::Sender<ClientEvent>,
    channels: Mutex<HashMap<String, Arc<DirectChannel>>>,
}

impl MessageRouter {
    /// Create a router sending on behalf of `client`.
    pub fn new(client: Arc<RendezvousClient>, config: RouterConfig) -> Self {
        let events = client.event_sender();
        Self {
            client,
            config,
            events,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Arc<DirectChannel>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `content` to `to`, directly if possible.
    ///
    /// Returns the path that succeeded, or the relay's error if both
    /// failed.
    pub async fn send(&self, to: &str, content: &str) -> Result<Delivery> {
        let from = self.client.username().ok_or(Error::NotAuthenticated)?;

        match self.send_direct(&from, to, content).await {
            Ok(()) => {
                debug!(to = %to, size = %RedactedContent(content), "delivered directly");
                return Ok(Delivery::Direct);
            }
            Err(e) => {
                info!(to = %to, error = %e, "direct delivery unavailable, relaying");
            }
        }

        self.client.relay(to, content).await?;
        debug!(to = %to, size = %RedactedContent(content), "delivered via relay");
        Ok(Delivery::Relayed)
    }

    /// Whether an open Direct Channel to `peer` is cached.
    pub fn has_channel(&self, peer: &str) -> bool {
        self.channels()
            .get(peer)
            .map(|c| !c.is_closed())
            .unwrap_or(false)
    }

    /// Drop every cached channel.
    pub fn close_all(&self) {
        for (_, channel) in self.channels().drain() {
            channel.close();
        }
    }

    async fn send_direct(&self, from: &str, to: &str, content: &str) -> Result<()> {
        let peer = tokio::time::timeout(self.config.peer_info_timeout, self.client.request_p2p(to))
            .await
            .map_err(|_| Error::Timeout)??;

        let channel = self.channel_to(to, peer.socket_addr()).await?;
        let frame = PeerFrame::P2pMessage {
            from: from.to_string(),
            content: content.to_string(),
            timestamp: unix_timestamp(),
        };

        if let Err(e) = channel.send(frame, self.config.write_timeout).await {
            self.forget(to, &channel);
            return Err(e);
        }
        Ok(())
    }

    async fn channel_to(&self, peer: &str, addr: SocketAddr) -> Result<Arc<DirectChannel>> {
        let cached = self.channels().get(peer).cloned();
        if let Some(channel) = cached {
            if channel.addr() == addr && !channel.is_closed() {
                return Ok(channel);
            }
        }

        let channel = Arc::new(
            DirectChannel::connect(peer, addr, self.config.connect_timeout, self.events.clone())
                .await?,
        );
        self.channels()
            .insert(peer.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    fn forget(&self, peer: &str, channel: &Arc<DirectChannel>) {
        let mut channels = self.channels();
        if channels.get(peer).is_some_and(|c| Arc::ptr_eq(c, channel)) {
            channels.remove(peer);
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("config", &self.config)
            .field("channels", &self.channels().len())
            .finish()
    }
}
