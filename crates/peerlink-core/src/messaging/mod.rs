//! Client side of PeerLink messaging.
//!
//! - [`RendezvousClient`]: one connection to the rendezvous server, with
//!   request/response correlation and a stream of server pushes
//! - [`PeerListener`]: accepts Direct Channels from other peers
//! - [`DirectChannel`]: an outbound peer-to-peer connection
//! - [`MessageRouter`]: per-message choice between direct and relayed
//!   delivery
//!
//! Everything a client receives (presence pushes, peer offers, relayed
//! messages, direct messages, session loss) is surfaced as a [`ClientEvent`] on one
//! broadcast channel.

mod channel;
mod client;
mod listener;
mod router;

pub use channel::DirectChannel;
pub use client::RendezvousClient;
pub use listener::PeerListener;
pub use router::MessageRouter;

use crate::protocol::{PeerAddr, Reason};
use std::net::SocketAddr;
use std::time::Duration;

/// Default bound on a request/response round trip with the server.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on connecting a Direct Channel.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound on waiting for brokered peer info.
pub const DEFAULT_PEER_INFO_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a single write to a Direct Channel.
pub const DEFAULT_DIRECT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Capacity of the client event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The server pushed a new list of online users.
    UserList {
        /// Other online users, sorted.
        users: Vec<String>,
    },
    /// A message arrived through the server relay.
    RelayedMessage {
        /// Authenticated sender.
        from: String,
        /// Message content.
        content: String,
        /// Server relay time (Unix seconds).
        timestamp: i64,
    },
    /// A message arrived on a Direct Channel.
    DirectMessage {
        /// Sender, as claimed by the peer.
        from: String,
        /// Message content.
        content: String,
        /// Send time claimed by the peer (Unix seconds).
        timestamp: i64,
        /// Remote end of the channel.
        remote: SocketAddr,
    },
    /// Another user asked the server for this client's address and is
    /// about to open a Direct Channel.
    PeerOffer {
        /// Authenticated requester.
        from: String,
        /// Requester's listener, if it advertised one.
        peer: Option<PeerAddr>,
    },
    /// The server ended this session.
    SessionClosed {
        /// Why.
        reason: Reason,
    },
    /// The connection to the server is gone.
    Disconnected,
}

/// The path a message took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to a Direct Channel.
    Direct,
    /// Acknowledged by the server relay.
    Relayed,
}

/// Rendezvous client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on connecting and on each request/response round trip.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Message router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on connecting a Direct Channel.
    pub connect_timeout: Duration,
    /// Bound on the REQUEST_P2P round trip.
    pub peer_info_timeout: Duration,
    /// Bound on writing one message to a Direct Channel.
    pub write_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            peer_info_timeout: DEFAULT_PEER_INFO_TIMEOUT,
            write_timeout: DEFAULT_DIRECT_WRITE_TIMEOUT,
        }
    }
}
