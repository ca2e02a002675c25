//! Wire protocol for PeerLink.
//!
//! Newline-delimited UTF-8 JSON over TCP, one object per line, discriminated
//! by a `"type"` field. The same framing is used on the client ↔ server
//! connection and on direct peer ↔ peer channels.
//!
//! ## Protocol Rules
//!
//! - Receivers buffer partial reads and split on `\n`
//! - Malformed lines are dropped; the connection continues
//! - Lines longer than [`MAX_FRAME_SIZE`] end the connection
//! - Every request gets exactly one terminal response; pushes have none
//!
//! ```text
//! {"type":"LOGIN","id":1,"username":"alice","password":"...","listen_port":9001}\n
//! {"type":"LOGIN_RES","id":1,"ok":true}\n
//! ```

mod codec;
mod types;

pub use codec::{parse_line, FrameCodec};
pub use types::{Envelope, PeerAddr, PeerFrame, Reason, Request, RequestId, ServerFrame};

/// Maximum encoded frame size in bytes (64 KiB), excluding the terminator.
pub const MAX_FRAME_SIZE: usize = crate::MAX_MESSAGE_SIZE;

/// Current Unix time in seconds, as carried in `timestamp` fields.
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
