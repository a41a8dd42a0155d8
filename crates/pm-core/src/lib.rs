//! pm Core - Shared types for the pm process manager
//!
//! This crate provides the domain types shared between
//! the daemon (pmd) and the client (pm).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod process;
pub mod status;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use process::{ProcId, ProcMetadata, ProcRecord};
pub use status::ProcStatus;
