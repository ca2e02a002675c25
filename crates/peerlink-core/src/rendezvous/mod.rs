//! Rendezvous server.
//!
//! Accepts client connections, authenticates them against a
//! [`CredentialStore`], keeps the online [`SessionRegistry`], brokers peer
//! addresses for direct connections and relays content when a direct
//! connection is not possible.
//!
//! ## Concurrency
//!
//! Each accepted connection is served by its own task. The registry is the
//! only state shared between tasks. Writes to a connection from other tasks
//! (relayed content, presence pushes) go through its [`Connection`] handle
//! and are bounded by [`ServerConfig::write_timeout`].

mod broadcast;
mod connection;
mod handler;
mod registry;

pub use broadcast::Broadcaster;
pub use connection::{Connection, ConnectionId};
pub use handler::ConnectionState;
pub use registry::{Session, SessionRegistry};

use crate::error::Result;
use crate::storage::CredentialStore;
use handler::ProtocolHandler;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default bound on any single write to a client.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Bound on each write to a client connection.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// State shared by every connection task.
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) broadcaster: Broadcaster,
}

impl ServerContext {
    pub(crate) fn new(config: ServerConfig, store: Arc<dyn CredentialStore>) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), config.write_timeout);
        Arc::new(Self {
            config,
            registry,
            store,
            broadcaster,
        })
    }
}

/// A bound rendezvous server.
pub struct RendezvousServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl RendezvousServer {
    /// Bind the listening socket.
    pub async fn bind(config: ServerConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            listener,
            ctx: ServerContext::new(config, store),
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Online sessions.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "rendezvous server listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, addr, ctx).await {
                            debug!(%addr, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    // Typically fd exhaustion; keep serving existing clients
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

async fn serve(stream: TcpStream, addr: SocketAddr, ctx: Arc<ServerContext>) -> Result<()> {
    debug!(%addr, "connection accepted");
    let _ = stream.set_nodelay(true);

    let (reader, writer) = stream.into_split();
    let connection = Arc::new(Connection::new(addr, writer));
    ProtocolHandler::new(ctx, connection).run(reader).await
}
