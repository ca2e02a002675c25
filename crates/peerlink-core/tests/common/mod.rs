//! Shared helpers for end-to-end tests: a real server on an ephemeral port,
//! real clients, and a raw line-level client for wire-format checks.

#![allow(dead_code)]

use peerlink_core::messaging::{ClientConfig, ClientEvent, RendezvousClient};
use peerlink_core::rendezvous::{RendezvousServer, ServerConfig, SessionRegistry};
use peerlink_core::storage::{CredentialStore, Database};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(3);

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
}

pub async fn start_server() -> TestServer {
    let store: Arc<dyn CredentialStore> = Arc::new(Database::open_in_memory().expect("db"));
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().expect("addr"),
        write_timeout: Duration::from_secs(1),
    };
    let server = RendezvousServer::bind(config, store).await.expect("bind");
    let addr = server.local_addr().expect("local addr");
    let registry = server.registry();
    tokio::spawn(server.run());
    TestServer { addr, registry }
}

pub async fn connect(addr: SocketAddr) -> RendezvousClient {
    RendezvousClient::connect(addr, ClientConfig::default())
        .await
        .expect("connect")
}

/// Register `name` (password `pw-<name>`) and log in.
pub async fn online(addr: SocketAddr, name: &str, listen_port: Option<u16>) -> RendezvousClient {
    let client = connect(addr).await;
    let password = format!("pw-{}", name);
    client.register(name, &password).await.expect("register");
    client.login(name, &password, listen_port).await.expect("login");
    client
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

/// Poll `get_users` until it returns `expected`.
pub async fn wait_for_users(client: &RendezvousClient, expected: &[&str]) {
    tokio::time::timeout(WAIT, async {
        loop {
            let users = client.get_users().await.expect("get_users");
            if users == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("user list converged");
}

/// A client speaking raw JSON lines.
pub struct RawClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
    }

    pub async fn try_write_raw(&mut self, bytes: &[u8]) -> bool {
        self.writer.write_all(bytes).await.is_ok()
    }

    pub async fn send(&mut self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.write_raw(line.as_bytes()).await;
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("frame in time")
            .expect("read")
            .expect("connection open");
        serde_json::from_str(&line).expect("server sent JSON")
    }

    /// Next frame whose `type` is `kind`.
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    /// Whether the server has closed the connection, draining any frames.
    pub async fn closed_by_server(&mut self) -> bool {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.lines.next_line().await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => return true,
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}
