//! Server-originated notifications.
//!
//! After a login or disconnect changes the registry, every other online
//! session is pushed a fresh `USER_LIST` computed for that recipient. The
//! target of a brokered peer lookup is pushed a `PEER_OFFER`. Each push runs
//! in its own task with the server's write timeout, so a stalled client
//! delays nobody; a push that fails closes the recipient's connection, which
//! schedules its disconnect cleanup.

use super::connection::Connection;
use super::registry::{Session, SessionRegistry};
use crate::protocol::{Envelope, PeerAddr, Reason, ServerFrame};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pushes presence changes and peer offers to online sessions.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    write_timeout: Duration,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    pub fn new(registry: Arc<SessionRegistry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    /// Push each online session (except `exclude`) its current user list.
    ///
    /// Returns how many pushes were scheduled. Does not wait for them.
    pub fn broadcast_user_lists(&self, exclude: Option<&str>) -> usize {
        let snapshot = self.registry.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|(name, _)| name.as_str()).collect();
        let mut scheduled = 0;

        for (recipient, connection) in &snapshot {
            if exclude == Some(recipient.as_str()) {
                continue;
            }

            let users = names
                .iter()
                .filter(|name| **name != recipient.as_str())
                .map(|name| name.to_string())
                .collect();

            self.push(
                recipient.clone(),
                Arc::clone(connection),
                ServerFrame::UserList { users },
            );
            scheduled += 1;
        }

        debug!(recipients = scheduled, "presence broadcast scheduled");
        scheduled
    }

    /// Tell `target` that `from` is about to connect to it directly.
    pub fn offer(&self, target: Session, from: &str, peer: Option<PeerAddr>) {
        debug!(from = %from, to = %target.username, "peer offer scheduled");
        self.push(
            target.username,
            target.connection,
            ServerFrame::PeerOffer {
                from: from.to_string(),
                peer,
            },
        );
    }

    /// Tell a superseded session why it is going away, then close it.
    pub fn evict(&self, session: Session) {
        let write_timeout = self.write_timeout;
        info!(
            user = %session.username,
            addr = %session.connection.peer_addr(),
            "session superseded by newer login"
        );

        tokio::spawn(async move {
            let frame = Envelope::bare(ServerFrame::SessionClosed {
                reason: Reason::Superseded,
            });
            let _ = session.connection.send(frame, write_timeout).await;
            session.connection.close();
        });
    }

    fn push(&self, recipient: String, connection: Arc<Connection>, frame: ServerFrame) {
        let write_timeout = self.write_timeout;

        tokio::spawn(async move {
            if let Err(e) = connection.send(Envelope::bare(frame), write_timeout).await {
                // send() has already closed the connection
                warn!(
                    user = %recipient,
                    addr = %connection.peer_addr(),
                    error = %e,
                    "push failed, dropping session"
                );
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::{parse_line, Envelope};
    use std::net::SocketAddr;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    fn online(registry: &SessionRegistry, name: &str, buffer: usize) -> (Arc<Connection>, DuplexStream) {
        let addr: SocketAddr = "127.0.0.1:4000".parse().expect("addr");
        let (writer, reader) = tokio::io::duplex(buffer);
        let conn = Arc::new(Connection::new(addr, writer));
        registry.put(Session::new(name.to_string(), Arc::clone(&conn), None));
        (conn, reader)
    }

    async fn next_frame(reader: &mut BufReader<DuplexStream>) -> ServerFrame {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("frame in time")
            .expect("read");
        parse_line::<Envelope<ServerFrame>>(line.trim_end().as_bytes())
            .expect("valid frame")
            .body
    }

    #[tokio::test]
    async fn test_each_recipient_gets_its_own_list() {
        let registry = Arc::new(SessionRegistry::new());
        let (_a, a_rx) = online(&registry, "alice", 1024);
        let (_b, b_rx) = online(&registry, "bob", 1024);
        let (_c, _c_rx) = online(&registry, "carol", 1024);

        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_secs(1));
        assert_eq!(broadcaster.broadcast_user_lists(Some("carol")), 2);

        let mut a_rx = BufReader::new(a_rx);
        let mut b_rx = BufReader::new(b_rx);
        assert_eq!(
            next_frame(&mut a_rx).await,
            ServerFrame::UserList {
                users: vec!["bob".into(), "carol".into()]
            }
        );
        assert_eq!(
            next_frame(&mut b_rx).await,
            ServerFrame::UserList {
                users: vec!["alice".into(), "carol".into()]
            }
        );
    }

    #[tokio::test]
    async fn test_stalled_recipient_is_closed() {
        let registry = Arc::new(SessionRegistry::new());
        let (stalled, _held) = online(&registry, "stalled", 4);
        let (healthy, healthy_rx) = online(&registry, "healthy", 1024);

        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_millis(50));
        broadcaster.broadcast_user_lists(None);

        tokio::time::timeout(Duration::from_secs(2), stalled.closed())
            .await
            .expect("stalled connection closed");

        let mut healthy_rx = BufReader::new(healthy_rx);
        assert_eq!(
            next_frame(&mut healthy_rx).await,
            ServerFrame::UserList {
                users: vec!["stalled".into()]
            }
        );
        assert!(!healthy.is_closed());
    }

    #[tokio::test]
    async fn test_offer_reaches_only_the_target() {
        let registry = Arc::new(SessionRegistry::new());
        let (_a, a_rx) = online(&registry, "alice", 1024);
        let (_b, _b_rx) = online(&registry, "bob", 1024);
        let target = registry.get("alice").expect("online");

        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_secs(1));
        let peer = PeerAddr {
            ip: "10.0.0.8".parse().expect("ip"),
            port: 7000,
        };
        broadcaster.offer(target, "bob", Some(peer));

        let mut a_rx = BufReader::new(a_rx);
        assert_eq!(
            next_frame(&mut a_rx).await,
            ServerFrame::PeerOffer {
                from: "bob".into(),
                peer: Some(peer)
            }
        );
    }

    #[tokio::test]
    async fn test_evict_notifies_then_closes() {
        let registry = Arc::new(SessionRegistry::new());
        let (conn, rx) = online(&registry, "alice", 1024);
        let session = registry.get("alice").expect("online");

        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_secs(1));
        broadcaster.evict(session);

        let mut rx = BufReader::new(rx);
        assert_eq!(
            next_frame(&mut rx).await,
            ServerFrame::SessionClosed {
                reason: Reason::Superseded
            }
        );
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("closed");
    }
}
