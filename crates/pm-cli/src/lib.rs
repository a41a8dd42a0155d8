//! pm client library
//!
//! Everything the `pm` front-end needs to talk to the daemon:
//!
//! - `client`: `DaemonClient`, one connection with request/response helpers
//! - `daemon`: health probing and auto-starting `pmd`
//! - `error`: `ClientError`, carrying the daemon's error codes
//!
//! Requests are strictly sequential on one connection. Run several clients
//! for concurrency; the daemon serves each connection on its own task.

pub mod client;
pub mod daemon;
pub mod error;

// Re-export commonly used types
pub use client::{DaemonClient, Health};
pub use error::{ClientError, Result};
