//! # PeerLink Core Library
//!
//! A rendezvous server plus the client side of a hybrid delivery protocol:
//! peers discover each other through the server, message each other over
//! direct TCP connections when they can, and fall back to relaying through
//! the server when they cannot.
//!
//! ## Delivery Model
//!
//! - Accounts and presence live on the rendezvous server
//! - Peer addresses are the server's observation of the peer's connection,
//!   never what the peer claims
//! - Direct delivery is attempted first, with a bounded connect timeout
//! - Any direct-path failure falls back to exactly one relay attempt
//! - Delivery is at most once; nothing is stored for offline users
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   rendezvous (server)  │  messaging     │
//! │                        │  (client)      │
//! ├─────────────────────────────────────────┤
//! │   protocol (wire)      │  storage       │
//! ├─────────────────────────────────────────┤
//! │          error  │  logging              │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod messaging;
pub mod protocol;
pub mod rendezvous;
pub mod storage;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum message size in bytes (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 65536;
