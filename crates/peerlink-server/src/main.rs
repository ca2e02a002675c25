//! PeerLink Rendezvous Server
//!
//! Accounts, presence and peer-address brokering for PeerLink clients, plus
//! relay delivery when peers cannot reach each other directly.
//!
//! ## Server Properties
//!
//! - Peer addresses are observed, never taken from the client
//! - Relayed content is forwarded immediately and never stored
//! - One login per username; a newer login supersedes the older one

use anyhow::{Context, Result};
use clap::Parser;
use peerlink_core::rendezvous::{RendezvousServer, ServerConfig, DEFAULT_LISTEN_ADDR};
use peerlink_core::storage::{CredentialStore, Database, DatabaseConfig, DEFAULT_DB_NAME};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// PeerLink rendezvous and relay server
#[derive(Parser, Debug)]
#[command(name = "peerlink-server")]
#[command(author, version, about)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: SocketAddr,

    /// Account database path
    #[arg(short, long, default_value = DEFAULT_DB_NAME)]
    database: String,

    /// Keep accounts in memory only
    #[arg(long)]
    in_memory: bool,

    /// Bound on each write to a client, in milliseconds
    #[arg(long, default_value = "5000")]
    write_timeout_ms: u64,

    /// Interval between status log lines, in seconds
    #[arg(long, default_value = "60")]
    status_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            path: self.database.clone(),
            in_memory: self.in_memory,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let db_config = args.database_config();
    let database = Arc::new(
        Database::open(&db_config)
            .with_context(|| format!("failed to open account database {}", db_config.path))?,
    );
    let location = if db_config.in_memory {
        ":memory:"
    } else {
        db_config.path.as_str()
    };
    tracing::info!(
        path = %location,
        accounts = database.user_count().unwrap_or(0),
        "account database ready"
    );

    let store: Arc<dyn CredentialStore> = Arc::clone(&database) as Arc<dyn CredentialStore>;
    let server = RendezvousServer::bind(args.server_config(), store)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    // Start status task
    let registry = server.registry();
    let status_interval = Duration::from_secs(args.status_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(status_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            tracing::info!(
                online = registry.len(),
                accounts = database.user_count().unwrap_or(0),
                "status"
            );
        }
    });

    tracing::info!(
        address = %server.local_addr()?,
        write_timeout_ms = args.write_timeout_ms,
        "PeerLink server started"
    );

    server.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["peerlink-server"]);
        assert_eq!(args.listen, "0.0.0.0:8080".parse::<SocketAddr>().expect("addr"));
        assert_eq!(args.database, DEFAULT_DB_NAME);
        assert!(!args.in_memory);

        let config = args.server_config();
        assert_eq!(config.write_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_custom_args() {
        let args = Args::parse_from([
            "peerlink-server",
            "--listen",
            "127.0.0.1:9000",
            "--in-memory",
            "--write-timeout-ms",
            "250",
            "-v",
        ]);
        assert_eq!(args.server_config().listen_addr.port(), 9000);
        assert_eq!(args.server_config().write_timeout, Duration::from_millis(250));
        assert!(args.database_config().in_memory);
        assert!(args.verbose);
    }

    #[test]
    fn test_rejects_bad_listen_address() {
        assert!(Args::try_parse_from(["peerlink-server", "--listen", "not-an-address"]).is_err());
    }
}
