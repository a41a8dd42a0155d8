//! pm Daemon - background process supervisor
//!
//! This crate provides the core infrastructure for the pm daemon:
//! - `store` - SQLite-backed process registry with name/tag indices
//! - `registry` - Actor serializing every state change
//! - `launcher` - Spawns supervised processes with redirected logs
//! - `reaper` - SIGCHLD-driven exit reconciliation
//! - `server` - Unix socket control plane for clients
//! - `monitor` - Periodic usage sampling and event draining
//! - `daemonize` - Re-exec based detachment and pid-file locking
//! - `supervisor` - Wires all of the above together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        pmd daemon                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │────▶│     RegistryActor           │    │
//! │  │ (Unix Socket)   │     │  (process state owner)      │    │
//! │  └────────┬────────┘     └──┬───────────┬──────────┬───┘    │
//! │           │                 │           │          │        │
//! │           │ connections     ▼           ▼          ▼        │
//! │           ▼           ProcessStore  Launcher   EventQueue   │
//! │  ┌─────────────────┐        ▲                      │        │
//! │  │ConnectionHandler│        │                      ▼        │
//! │  │  (per client)   │   ChildReaper (SIGCHLD)    Monitor     │
//! │  └─────────────────┘                                        │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod daemonize;
pub mod launcher;
pub mod monitor;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod store;
pub mod supervisor;
