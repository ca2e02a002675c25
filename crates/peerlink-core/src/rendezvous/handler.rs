//! Per-connection rendezvous protocol state machine.
//!
//! ```text
//! Unauthenticated ──LOGIN ok──▶ Authenticated ──EOF / error / close──▶ Closed
//!        │                                                              ▲
//!        └──────────────────────EOF / error─────────────────────────────┘
//! ```
//!
//! REGISTER and LOGIN are accepted in any state; everything else needs an
//! authenticated session. The sender identity and address attached to
//! relayed content and brokered peer info always come from the server's own
//! view of the connection, never from client-declared fields.

use super::connection::Connection;
use super::ServerContext;
use crate::error::{Error, Result};
use crate::logging::{sanitize_for_log, Redacted, RedactedContent};
use crate::protocol::{
    unix_timestamp, Envelope, FrameCodec, PeerAddr, Reason, Request, RequestId, ServerFrame,
    MAX_FRAME_SIZE,
};
use crate::rendezvous::registry::Session;
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

/// Bytes a `RELAY_IN` frame adds around the sender name and content, with
/// the widest possible timestamp.
const RELAY_IN_OVERHEAD: usize =
    r#"{"type":"RELAY_IN","from":"","content":"","timestamp":}"#.len() + 20;

/// Authentication state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Only REGISTER and LOGIN are served.
    Unauthenticated,
    /// Logged in as `username`.
    Authenticated {
        /// The authenticated username.
        username: String,
    },
    /// Cleanup has run; no further frames are processed.
    Closed,
}

/// Serves the frames of a single client connection.
pub(crate) struct ProtocolHandler {
    ctx: Arc<ServerContext>,
    connection: Arc<Connection>,
    state: ConnectionState,
}

impl ProtocolHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>, connection: Arc<Connection>) -> Self {
        Self {
            ctx,
            connection,
            state: ConnectionState::Unauthenticated,
        }
    }

    /// Read frames until the client goes away or the connection is closed,
    /// then run disconnect cleanup.
    pub(crate) async fn run<R>(mut self, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::<Envelope<Request>>::new());
        let connection = Arc::clone(&self.connection);
        let addr = connection.peer_addr();

        let result = loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(Ok(envelope))) => match self.handle(envelope).await {
                        Err(e) if e.is_fatal() => break Err(e),
                        Err(e) => warn!(%addr, error = %e, "request failed"),
                        Ok(()) => {}
                    },
                    Some(Ok(Err(e))) => {
                        debug!(%addr, error = %sanitize_for_log(&e.to_string()), "dropping malformed frame");
                    }
                    Some(Err(e)) => {
                        warn!(%addr, error = %e, "read failed");
                        break Err(e);
                    }
                    None => break Ok(()),
                },
                _ = connection.closed() => break Ok(()),
            }
        };

        self.close().await;
        result
    }

    /// Dispatch one request and write its single terminal response.
    pub(crate) async fn handle(&mut self, envelope: Envelope<Request>) -> Result<()> {
        let Envelope { id, body } = envelope;
        debug!(addr = %self.connection.peer_addr(), request = body.kind(), ?id, "request");

        let response = match body {
            Request::Register { username, password } => self.register(&username, &password),
            Request::Login {
                username,
                password,
                listen_port,
            } => self.login(username, &password, listen_port),
            request => match self.state.clone() {
                ConnectionState::Authenticated { username } => {
                    self.authenticated(&username, request).await
                }
                _ => ServerFrame::Error {
                    reason: Reason::NotAuthenticated,
                },
            },
        };

        self.respond(id, response).await
    }

    async fn authenticated(&self, username: &str, request: Request) -> ServerFrame {
        match request {
            Request::UpdatePresence { listen_port, .. } => {
                self.update_presence(username, listen_port)
            }
            Request::GetUsers => ServerFrame::UserList {
                users: self.ctx.registry.list_others(username),
            },
            Request::RequestP2p { to, .. } => self.request_p2p(username, &to),
            Request::Relay { to, content, .. } => self.relay(username, &to, content).await,
            Request::Register { .. } | Request::Login { .. } => ServerFrame::Error {
                reason: Reason::InvalidRequest,
            },
        }
    }

    fn register(&self, username: &str, password: &str) -> ServerFrame {
        if username.trim().is_empty() || password.is_empty() {
            return ServerFrame::RegisterRes {
                ok: false,
                reason: Some(Reason::InvalidRequest),
            };
        }

        match self.ctx.store.register(username, password) {
            Ok(()) => {
                info!(user = %username, addr = %self.connection.peer_addr(), "registered");
                ServerFrame::RegisterRes {
                    ok: true,
                    reason: None,
                }
            }
            Err(e) => {
                let reason = Reason::from(&e);
                if reason == Reason::Internal {
                    error!(user = %username, error = %e, "register failed");
                } else {
                    info!(user = %username, %reason, "register rejected");
                }
                ServerFrame::RegisterRes {
                    ok: false,
                    reason: Some(reason),
                }
            }
        }
    }

    fn login(&mut self, username: String, password: &str, listen_port: Option<u16>) -> ServerFrame {
        let addr = self.connection.peer_addr();
        let failure = |reason| ServerFrame::LoginRes {
            ok: false,
            reason: Some(reason),
        };

        if self.state != ConnectionState::Unauthenticated {
            return failure(Reason::AlreadyAuthenticated);
        }

        debug!(user = %username, password = %Redacted(password), %addr, "login attempt");
        match self.ctx.store.verify(&username, password) {
            Ok(true) => {}
            Ok(false) => {
                warn!(user = %username, %addr, "login failed");
                return failure(Reason::InvalidCredentials);
            }
            Err(e) => {
                error!(user = %username, error = %e, "credential check failed");
                return failure(Reason::Internal);
            }
        }

        let listen_port = listen_port.filter(|port| *port != 0);
        let session = Session::new(username.clone(), Arc::clone(&self.connection), listen_port);
        let superseded = self.ctx.registry.put(session);
        self.state = ConnectionState::Authenticated {
            username: username.clone(),
        };

        if let Err(e) = self.ctx.store.touch(&username) {
            warn!(user = %username, error = %e, "failed to record last seen");
        }

        if let Some(previous) = superseded {
            if previous.connection.id() != self.connection.id() {
                self.ctx.broadcaster.evict(previous);
            }
        }

        info!(user = %username, %addr, port = ?listen_port, "logged in");
        self.ctx.broadcaster.broadcast_user_lists(Some(&username));

        ServerFrame::LoginRes {
            ok: true,
            reason: None,
        }
    }

    fn update_presence(&self, username: &str, listen_port: u16) -> ServerFrame {
        if listen_port == 0 {
            return ServerFrame::PresenceAck {
                ok: false,
                reason: Some(Reason::InvalidRequest),
            };
        }

        if self
            .ctx
            .registry
            .set_advertised_port(username, self.connection.id(), listen_port)
        {
            debug!(user = %username, port = listen_port, "presence updated");
            ServerFrame::PresenceAck {
                ok: true,
                reason: None,
            }
        } else {
            // Superseded by another login; this connection is on its way out.
            ServerFrame::PresenceAck {
                ok: false,
                reason: Some(Reason::NotAuthenticated),
            }
        }
    }

    fn request_p2p(&self, requester: &str, target: &str) -> ServerFrame {
        let failure = |reason| ServerFrame::P2pInfo {
            ok: false,
            peer_username: target.to_string(),
            peer: None,
            reason: Some(reason),
        };

        let Some(session) = self.ctx.registry.get(target) else {
            debug!(from = %requester, to = %target, "peer lookup: offline");
            return failure(Reason::Offline);
        };
        let Some(port) = session.advertised_port else {
            debug!(from = %requester, to = %target, "peer lookup: no listener");
            return failure(Reason::NoListener);
        };
        let peer = PeerAddr {
            ip: session.source_address,
            port,
        };

        if target != requester {
            let requester_addr = self
                .ctx
                .registry
                .peer_addr(requester)
                .and_then(|(ip, port)| port.map(|port| PeerAddr { ip, port }));
            self.ctx.broadcaster.offer(session, requester, requester_addr);
        }

        debug!(from = %requester, to = %target, "peer lookup: ok");
        ServerFrame::P2pInfo {
            ok: true,
            peer_username: target.to_string(),
            peer: Some(peer),
            reason: None,
        }
    }

    async fn relay(&self, sender: &str, target: &str, content: String) -> ServerFrame {
        let Some(recipient) = self.ctx.registry.get(target) else {
            debug!(from = %sender, to = %target, "relay target offline");
            return ServerFrame::RelayAck {
                ok: false,
                reason: Some(Reason::RecipientOffline),
            };
        };

        let size = RedactedContent(&content).to_string();
        if content.len() + sender.len() + RELAY_IN_OVERHEAD > MAX_FRAME_SIZE {
            debug!(from = %sender, to = %target, %size, "relay too large to forward");
            return ServerFrame::RelayAck {
                ok: false,
                reason: Some(Reason::InvalidRequest),
            };
        }

        let push = Envelope::bare(ServerFrame::RelayIn {
            from: sender.to_string(),
            content,
            timestamp: unix_timestamp(),
        });

        match recipient
            .connection
            .send(push, self.ctx.config.write_timeout)
            .await
        {
            Ok(()) => {
                debug!(from = %sender, to = %target, %size, "relayed");
                ServerFrame::RelayAck {
                    ok: true,
                    reason: None,
                }
            }
            Err(Error::Protocol(e)) => {
                // Escaping pushed the frame over the limit; nothing was written
                debug!(from = %sender, to = %target, %size, error = %e, "relay too large to forward");
                ServerFrame::RelayAck {
                    ok: false,
                    reason: Some(Reason::InvalidRequest),
                }
            }
            Err(e) => {
                warn!(from = %sender, to = %target, error = %e, "relay delivery failed");
                ServerFrame::RelayAck {
                    ok: false,
                    reason: Some(Reason::DeliveryFailed),
                }
            }
        }
    }

    async fn respond(&self, id: Option<RequestId>, frame: ServerFrame) -> Result<()> {
        self.connection
            .send(Envelope { id, body: frame }, self.ctx.config.write_timeout)
            .await
    }

    /// Transition to Closed: drop the registry entry (if still ours),
    /// announce the departure, release the socket.
    async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Closed);

        if let ConnectionState::Authenticated { username } = previous {
            if self.ctx.registry.remove(&username, self.connection.id()) {
                info!(user = %username, addr = %self.connection.peer_addr(), "disconnected");
                self.ctx.broadcaster.broadcast_user_lists(None);
            }
        } else {
            debug!(addr = %self.connection.peer_addr(), "unauthenticated connection closed");
        }

        self.connection.shutdown(self.ctx.config.write_timeout).await;
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &ConnectionState {
        &self.state
    }
}
