//! pm Protocol - Wire protocol for daemon communication
//!
//! Newline-delimited JSON over the daemon's Unix socket. Every client
//! message carries the protocol version; the first message on a
//! connection must be `Connect`.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, ErrorCode, MessageType};
pub use version::{ProtocolVersion, VersionError};
