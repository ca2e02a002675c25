//! Credential storage for PeerLink.
//!
//! The rendezvous core only needs three operations from its account store:
//! register, verify and touch. They sit behind [`CredentialStore`] so the
//! server never depends on the backing database; [`Database`] is the SQLite
//! implementation.
//!
//! ## Guarantees
//!
//! - Register is atomic with respect to duplicate-username detection
//!   (UNIQUE constraint, single statement)
//! - Implementations provide their own internal locking
//! - Passwords are stored salted and hashed, never in the clear

mod database;
mod schema;

pub use database::{CredentialStore, Database, DatabaseConfig};

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "peerlink.db";

/// Salt length in bytes for stored password hashes.
pub const PASSWORD_SALT_LEN: usize = 16;
