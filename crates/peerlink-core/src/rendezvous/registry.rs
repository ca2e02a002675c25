//! Session registry: who is online, where, and on which connection.
//!
//! The registry is the only shared mutable state on the server. All access
//! goes through one `std::sync::Mutex` that is never held across an
//! `.await`, so critical sections stay short and there is no lock ordering
//! to get wrong when an operation touches two sessions.

use super::connection::{Connection, ConnectionId};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// One authenticated, currently connected user.
#[derive(Debug, Clone)]
pub struct Session {
    /// Username, fixed for the session's lifetime.
    pub username: String,
    /// Handle used to push server-originated frames.
    pub connection: Arc<Connection>,
    /// IP observed on the accepted connection.
    pub source_address: IpAddr,
    /// Port the user's peer listener is bound to, as declared by the client.
    pub advertised_port: Option<u16>,
    /// Unix timestamp of login or the latest presence update.
    pub last_seen: i64,
}

impl Session {
    /// Create a session for a freshly authenticated connection.
    pub fn new(username: String, connection: Arc<Connection>, advertised_port: Option<u16>) -> Self {
        let source_address = connection.peer_addr().ip();
        Self {
            username,
            connection,
            source_address,
            advertised_port,
            last_seen: chrono::Utc::now().timestamp(),
        }
    }
}

/// Online sessions keyed by username.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<String, Session>> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every mutation is a single insert/remove.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the session for `session.username`.
    ///
    /// Returns the session it superseded, if any.
    pub fn put(&self, session: Session) -> Option<Session> {
        self.sessions().insert(session.username.clone(), session)
    }

    /// Current session for a username.
    pub fn get(&self, username: &str) -> Option<Session> {
        self.sessions().get(username).cloned()
    }

    /// Remove `username` only if it is still bound to `connection`.
    ///
    /// A stale disconnect for a connection that has since been superseded by
    /// a newer login leaves the newer session in place.
    pub fn remove(&self, username: &str, connection: ConnectionId) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(username) {
            Some(session) if session.connection.id() == connection => {
                sessions.remove(username);
                true
            }
            _ => false,
        }
    }

    /// Sorted usernames of everyone online except `excluding`.
    pub fn list_others(&self, excluding: &str) -> Vec<String> {
        self.sessions()
            .keys()
            .filter(|name| name.as_str() != excluding)
            .cloned()
            .collect()
    }

    /// Record the listener port for `username`, if still bound to
    /// `connection`, and refresh its last-seen time.
    pub fn set_advertised_port(&self, username: &str, connection: ConnectionId, port: u16) -> bool {
        let mut sessions = self.sessions();
        match sessions.get_mut(username) {
            Some(session) if session.connection.id() == connection => {
                session.advertised_port = Some(port);
                session.last_seen = chrono::Utc::now().timestamp();
                true
            }
            _ => false,
        }
    }

    /// Observed IP and advertised port of `username`, read together.
    pub fn peer_addr(&self, username: &str) -> Option<(IpAddr, Option<u16>)> {
        self.sessions()
            .get(username)
            .map(|s| (s.source_address, s.advertised_port))
    }

    /// Every online username with its connection, for broadcasting.
    pub fn snapshot(&self) -> Vec<(String, Arc<Connection>)> {
        self.sessions()
            .values()
            .map(|s| (s.username.clone(), Arc::clone(&s.connection)))
            .collect()
    }

    /// Number of online sessions.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    /// Whether nobody is online.
    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn connection(addr: &str) -> Arc<Connection> {
        let addr: SocketAddr = addr.parse().expect("addr");
        let (writer, _reader) = tokio::io::duplex(64);
        Arc::new(Connection::new(addr, writer))
    }

    fn session(name: &str, conn: &Arc<Connection>) -> Session {
        Session::new(name.to_string(), Arc::clone(conn), None)
    }

    #[test]
    fn test_put_get_and_source_address() {
        let registry = SessionRegistry::new();
        let conn = connection("10.1.2.3:5555");

        assert!(registry.put(session("alice", &conn)).is_none());

        let got = registry.get("alice").expect("online");
        assert_eq!(got.source_address, "10.1.2.3".parse::<IpAddr>().expect("ip"));
        assert_eq!(got.connection.id(), conn.id());
        assert!(registry.get("bob").is_none());
    }

    #[test]
    fn test_list_others_is_sorted_and_excludes_self() {
        let registry = SessionRegistry::new();
        for name in ["carol", "alice", "bob"] {
            registry.put(session(name, &connection("127.0.0.1:1")));
        }

        assert_eq!(registry.list_others("bob"), vec!["alice", "carol"]);
        assert_eq!(registry.list_others("nobody"), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_stale_remove_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let old = connection("127.0.0.1:1");
        let new = connection("127.0.0.1:2");

        registry.put(session("alice", &old));
        let superseded = registry.put(session("alice", &new)).expect("replaced");
        assert_eq!(superseded.connection.id(), old.id());

        // Disconnect handler of the old connection fires late
        assert!(!registry.remove("alice", old.id()));
        assert_eq!(registry.get("alice").expect("still online").connection.id(), new.id());

        assert!(registry.remove("alice", new.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_advertised_port_travels_with_address() {
        let registry = SessionRegistry::new();
        let conn = connection("192.168.1.20:40000");
        registry.put(session("alice", &conn));

        assert_eq!(
            registry.peer_addr("alice"),
            Some(("192.168.1.20".parse().expect("ip"), None))
        );

        assert!(registry.set_advertised_port("alice", conn.id(), 9001));
        assert_eq!(
            registry.peer_addr("alice"),
            Some(("192.168.1.20".parse().expect("ip"), Some(9001)))
        );

        // Wrong connection cannot update someone else's presence
        let other = connection("192.168.1.21:40000");
        assert!(!registry.set_advertised_port("alice", other.id(), 1234));
        assert_eq!(registry.peer_addr("alice").map(|(_, p)| p), Some(Some(9001)));
    }

    #[test]
    fn test_snapshot() {
        let registry = SessionRegistry::new();
        let a = connection("127.0.0.1:1");
        let b = connection("127.0.0.1:2");
        registry.put(session("alice", &a));
        registry.put(session("bob", &b));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "alice");
        assert_eq!(snapshot[1].1.id(), b.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_put_and_list() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                let conn = connection("127.0.0.1:1");
                registry.put(session(&format!("user{}", i), &conn));
                registry.list_others("user0").len()
            }));
        }

        for handle in handles {
            assert!(handle.join().expect("thread") <= 8);
        }
        assert_eq!(registry.len(), 8);
    }
}
