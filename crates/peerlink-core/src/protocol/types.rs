//! Frame types for the rendezvous and peer protocols.
//!
//! Every frame is a JSON object discriminated by its `"type"` field.
//! Requests and responses may be wrapped in an [`Envelope`] carrying an
//! optional request id; pushes never carry one.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Correlates a response with the request that caused it.
pub type RequestId = u64;

/// A frame plus the optional request id it answers (or asks under).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Request id, echoed back in the matching response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// The frame itself.
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    /// Wrap a frame with a request id.
    pub fn with_id(id: RequestId, body: T) -> Self {
        Self { id: Some(id), body }
    }

    /// Wrap a frame without an id (pushes, legacy clients).
    pub fn bare(body: T) -> Self {
        Self { id: None, body }
    }
}

/// Client → server requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Create an account.
    Register {
        /// Desired username.
        username: String,
        /// Password.
        password: String,
    },
    /// Authenticate this connection.
    Login {
        /// Username.
        username: String,
        /// Password.
        password: String,
        /// Port of the client's peer listener, if already bound.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen_port: Option<u16>,
    },
    /// Advertise the port of the client's peer listener.
    UpdatePresence {
        /// Client-declared username. Ignored by the server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// Listening port.
        listen_port: u16,
    },
    /// List the other online users.
    GetUsers,
    /// Ask for a peer's address.
    #[serde(rename = "REQUEST_P2P")]
    RequestP2p {
        /// Target username.
        to: String,
        /// Client-declared sender. Ignored by the server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    /// Deliver content through the server.
    Relay {
        /// Recipient username.
        to: String,
        /// Client-declared sender. Ignored by the server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Message content.
        content: String,
    },
}

impl Request {
    /// Wire name of the request, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Register { .. } => "REGISTER",
            Request::Login { .. } => "LOGIN",
            Request::UpdatePresence { .. } => "UPDATE_PRESENCE",
            Request::GetUsers => "GET_USERS",
            Request::RequestP2p { .. } => "REQUEST_P2P",
            Request::Relay { .. } => "RELAY",
        }
    }
}

/// Server → client frames: responses and pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Response to REGISTER.
    RegisterRes {
        /// Whether the account was created.
        ok: bool,
        /// Failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
    },
    /// Response to LOGIN.
    LoginRes {
        /// Whether the connection is now authenticated.
        ok: bool,
        /// Failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
    },
    /// Response to UPDATE_PRESENCE.
    PresenceAck {
        /// Whether the port was recorded.
        ok: bool,
        /// Failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
    },
    /// Online users other than the recipient. Response to GET_USERS when
    /// it carries an id, presence push otherwise.
    UserList {
        /// Sorted usernames.
        users: Vec<String>,
    },
    /// Response to REQUEST_P2P.
    #[serde(rename = "P2P_INFO")]
    P2pInfo {
        /// Whether `peer` is present.
        ok: bool,
        /// The user that was looked up.
        peer_username: String,
        /// Server-observed IP and advertised port.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<PeerAddr>,
        /// Failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
    },
    /// Response to RELAY.
    RelayAck {
        /// Whether the content was written to the recipient.
        ok: bool,
        /// Failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
    },
    /// Relayed content pushed to the recipient.
    RelayIn {
        /// Authenticated sender.
        from: String,
        /// Message content.
        content: String,
        /// Unix timestamp (seconds) at which the server relayed it.
        timestamp: i64,
    },
    /// Pushed to the target of a successful REQUEST_P2P: `from` is about to
    /// connect to this client directly.
    PeerOffer {
        /// Authenticated requester.
        from: String,
        /// Requester's own listener, when it has advertised one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<PeerAddr>,
    },
    /// The server is closing this session.
    SessionClosed {
        /// Why.
        reason: Reason,
    },
    /// Terminal response to a request that could not be dispatched.
    Error {
        /// Why.
        reason: Reason,
    },
}

/// Peer → peer frames sent over a Direct Channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerFrame {
    /// A chat message.
    #[serde(rename = "P2P_MESSAGE")]
    P2pMessage {
        /// Sender username, as claimed by the sender.
        from: String,
        /// Message content.
        content: String,
        /// Unix timestamp (seconds) at which it was sent.
        timestamp: i64,
    },
}

/// Address of a peer's listener: server-observed IP plus advertised port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    /// IP observed by the server on the peer's connection.
    pub ip: IpAddr,
    /// Port the peer says its listener is bound to.
    pub port: u16,
}

impl PeerAddr {
    /// Socket address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Machine-readable failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// REGISTER for a name that exists.
    DuplicateUser,
    /// LOGIN with a bad username/password.
    InvalidCredentials,
    /// Missing or empty required fields.
    InvalidRequest,
    /// LOGIN on an already authenticated connection.
    AlreadyAuthenticated,
    /// Request needs a logged-in session.
    NotAuthenticated,
    /// REQUEST_P2P target is not online.
    Offline,
    /// REQUEST_P2P target never advertised a listener.
    NoListener,
    /// RELAY target is not online.
    RecipientOffline,
    /// RELAY target's connection did not accept the push in time.
    DeliveryFailed,
    /// A newer login for the same username replaced this session.
    Superseded,
    /// Server-side failure (e.g. the credential store).
    Internal,
}

impl Reason {
    /// Convert a failure reason into the error the caller sees.
    pub fn into_error(self) -> Error {
        match self {
            Reason::DuplicateUser => Error::DuplicateUser,
            Reason::InvalidCredentials => Error::InvalidCredentials,
            Reason::NotAuthenticated => Error::NotAuthenticated,
            Reason::Offline | Reason::NoListener | Reason::RecipientOffline => {
                Error::PeerUnavailable(self.to_string())
            }
            Reason::DeliveryFailed => Error::Delivery(self.to_string()),
            Reason::Superseded => Error::Closed,
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reason::DuplicateUser => "duplicate_user",
            Reason::InvalidCredentials => "invalid_credentials",
            Reason::InvalidRequest => "invalid_request",
            Reason::AlreadyAuthenticated => "already_authenticated",
            Reason::NotAuthenticated => "not_authenticated",
            Reason::Offline => "offline",
            Reason::NoListener => "no_listener",
            Reason::RecipientOffline => "recipient_offline",
            Reason::DeliveryFailed => "delivery_failed",
            Reason::Superseded => "superseded",
            Reason::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl From<&Error> for Reason {
    fn from(e: &Error) -> Self {
        match e {
            Error::DuplicateUser => Reason::DuplicateUser,
            Error::InvalidCredentials => Reason::InvalidCredentials,
            Error::NotAuthenticated => Reason::NotAuthenticated,
            _ => Reason::Internal,
        }
    }
}
