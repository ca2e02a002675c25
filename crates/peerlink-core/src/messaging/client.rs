//! Connection to the rendezvous server.
//!
//! Requests carry an id; a background reader task routes each response to
//! the waiting caller by that id and publishes pushes as [`ClientEvent`]s.

use super::{ClientConfig, ClientEvent, PeerListener, EVENT_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::logging::{Redacted, RedactedContent};
use crate::protocol::{
    Envelope, FrameCodec, PeerAddr, Reason, Request, RequestId, ServerFrame,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerFrame>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<ServerFrame>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a pending entry when the waiting request finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// A client connection to the rendezvous server.
pub struct RendezvousClient {
    server_addr: SocketAddr,
    config: ClientConfig,
    writer: TokioMutex<FramedWrite<OwnedWriteHalf, FrameCodec<Envelope<Request>>>>,
    pending: Pending,
    next_id: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
    username: Mutex<Option<String>>,
    disconnected: CancellationToken,
    reader: JoinHandle<()>,
}

impl RendezvousClient {
    /// Connect to the server at `addr`.
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.request_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let disconnected = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            events.clone(),
            disconnected.clone(),
        ));

        info!(server = %addr, "connected to rendezvous server");
        Ok(Self {
            server_addr: addr,
            config,
            writer: TokioMutex::new(FramedWrite::new(write_half, FrameCodec::new())),
            pending,
            next_id: AtomicU64::new(1),
            events,
            username: Mutex::new(None),
            disconnected,
            reader,
        })
    }

    /// Server address.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Subscribe to pushes and connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event channel, for components that publish into
    /// the same stream (listeners, Direct Channels).
    pub fn event_sender(&self) -> broadcast::Sender<ClientEvent> {
        self.events.clone()
    }

    /// Username this connection is logged in as.
    pub fn username(&self) -> Option<String> {
        self.username.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether the server connection is gone.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_cancelled()
    }

    /// Create an account. Does not log in.
    pub async fn register(&self, username: &str, password: &str) -> Result<()> {
        debug!(user = %username, password = %Redacted(password), "register");
        let request = Request::Register {
            username: username.to_string(),
            password: password.to_string(),
        };

        match self.request(request).await? {
            ServerFrame::RegisterRes { ok: true, .. } => Ok(()),
            ServerFrame::RegisterRes { ok: false, reason } => Err(failure(reason)),
            other => Err(unexpected(other)),
        }
    }

    /// Authenticate, optionally advertising a listener port up front.
    pub async fn login(&self, username: &str, password: &str, listen_port: Option<u16>) -> Result<()> {
        debug!(user = %username, password = %Redacted(password), "login");
        let request = Request::Login {
            username: username.to_string(),
            password: password.to_string(),
            listen_port,
        };

        match self.request(request).await? {
            ServerFrame::LoginRes { ok: true, .. } => {
                *self.username.lock().unwrap_or_else(|e| e.into_inner()) = Some(username.to_string());
                info!(user = %username, "logged in");
                Ok(())
            }
            ServerFrame::LoginRes { ok: false, reason } => Err(failure(reason)),
            other => Err(unexpected(other)),
        }
    }

    /// Advertise the port of this client's peer listener.
    pub async fn update_presence(&self, listen_port: u16) -> Result<()> {
        let request = Request::UpdatePresence {
            username: self.username(),
            listen_port,
        };

        match self.request(request).await? {
            ServerFrame::PresenceAck { ok: true, .. } => Ok(()),
            ServerFrame::PresenceAck { ok: false, reason } => Err(failure(reason)),
            other => Err(unexpected(other)),
        }
    }

    /// Advertise `listener`'s port.
    pub async fn advertise_listener(&self, listener: &PeerListener) -> Result<()> {
        self.update_presence(listener.port()).await
    }

    /// Other users currently online, sorted.
    pub async fn get_users(&self) -> Result<Vec<String>> {
        match self.request(Request::GetUsers).await? {
            ServerFrame::UserList { users } => Ok(users),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the server where `to`'s listener is.
    pub async fn request_p2p(&self, to: &str) -> Result<PeerAddr> {
        let request = Request::RequestP2p {
            to: to.to_string(),
            from: self.username(),
        };

        match self.request(request).await? {
            ServerFrame::P2pInfo {
                ok: true,
                peer: Some(peer),
                ..
            } => Ok(peer),
            ServerFrame::P2pInfo { reason, .. } => Err(failure(reason)),
            other => Err(unexpected(other)),
        }
    }

    /// Send `content` to `to` through the server.
    pub async fn relay(&self, to: &str, content: &str) -> Result<()> {
        debug!(to = %to, size = %RedactedContent(content), "relay");
        let request = Request::Relay {
            to: to.to_string(),
            from: self.username(),
            content: content.to_string(),
        };

        match self.request(request).await? {
            ServerFrame::RelayAck { ok: true, .. } => Ok(()),
            ServerFrame::RelayAck { ok: false, reason } => Err(failure(reason)),
            other => Err(unexpected(other)),
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, body: Request) -> Result<ServerFrame> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // Checked after registering so a concurrent disconnect cannot
        // strand the entry.
        if self.is_disconnected() {
            return Err(Error::Closed);
        }

        let timeout = self.config.request_timeout;
        tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            writer.send(Envelope::with_id(id, body)).await
        })
        .await
        .map_err(|_| Error::Timeout)??;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ServerFrame::Error { reason })) => Err(reason.into_error()),
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Close the connection to the server.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = SinkExt::<Envelope<Request>>::close(&mut *writer).await {
            debug!(error = %e, "closing server connection failed");
        }
    }
}

impl Drop for RendezvousClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for RendezvousClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousClient")
            .field("server_addr", &self.server_addr)
            .field("username", &self.username())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

fn failure(reason: Option<Reason>) -> Error {
    reason.unwrap_or(Reason::Internal).into_error()
}

fn unexpected(frame: ServerFrame) -> Error {
    let kind = match frame {
        ServerFrame::RegisterRes { .. } => "REGISTER_RES",
        ServerFrame::LoginRes { .. } => "LOGIN_RES",
        ServerFrame::PresenceAck { .. } => "PRESENCE_ACK",
        ServerFrame::UserList { .. } => "USER_LIST",
        ServerFrame::P2pInfo { .. } => "P2P_INFO",
        ServerFrame::RelayAck { .. } => "RELAY_ACK",
        ServerFrame::RelayIn { .. } => "RELAY_IN",
        ServerFrame::PeerOffer { .. } => "PEER_OFFER",
        ServerFrame::SessionClosed { .. } => "SESSION_CLOSED",
        ServerFrame::Error { .. } => "ERROR",
    };
    Error::Protocol(format!("unexpected response {}", kind))
}

async fn read_loop(
    reader: OwnedReadHalf,
    pending: Pending,
    events: broadcast::Sender<ClientEvent>,
    disconnected: CancellationToken,
) {
    let mut frames = FramedRead::new(reader, FrameCodec::<Envelope<ServerFrame>>::new());

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Ok(Envelope { id: Some(id), body })) => {
                let waiter = lock(&pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => debug!(id, "response for abandoned request"),
                }
            }
            Ok(Ok(Envelope { id: None, body })) => publish(&events, body),
            Ok(Err(e)) => debug!(error = %e, "dropping malformed server frame"),
            Err(e) => {
                warn!(error = %e, "server connection read failed");
                break;
            }
        }
    }

    disconnected.cancel();
    lock(&pending).clear();
    info!("disconnected from rendezvous server");
    let _ = events.send(ClientEvent::Disconnected);
}

fn publish(events: &broadcast::Sender<ClientEvent>, frame: ServerFrame) {
    let event = match frame {
        ServerFrame::UserList { users } => ClientEvent::UserList { users },
        ServerFrame::RelayIn {
            from,
            content,
            timestamp,
        } => ClientEvent::RelayedMessage {
            from,
            content,
            timestamp,
        },
        ServerFrame::PeerOffer { from, peer } => {
            debug!(from = %from, ?peer, "peer offer");
            ClientEvent::PeerOffer { from, peer }
        }
        ServerFrame::SessionClosed { reason } => {
            warn!(%reason, "session closed by server");
            ClientEvent::SessionClosed { reason }
        }
        other => {
            debug!(frame = %unexpected(other), "ignoring push");
            return;
        }
    };
    let _ = events.send(event);
}
