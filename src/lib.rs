//! Keystone - a strongly-consistent coordination service.
//!
//! A Keystone cluster replicates a hierarchical key/value store through Raft
//! consensus and exposes primitive locks, watches, sessions and user
//! accounts on top of it. Clients use it to elect masters, publish
//! configuration, and receive change notifications.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Keystone                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  Client API: Put/Get/Del/Scan | Lock/Watch | Sessions    │
//! ├──────────────────────────────────────────────────────────┤
//! │  Consensus: Election | BinLog | Replicators | Apply Loop │
//! ├──────────────────────────────────────────────────────────┤
//! │  Storage: Meta | BinLog | Per-user State Store (RocksDB) │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use keystone::config::KeystoneConfig;
//!
//! #[tokio::main]
//! async fn main() -> keystone::Result<()> {
//!     let config = KeystoneConfig::default();
//!     keystone::run(config).await
//! }
//! ```

pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod perf;
pub mod raft;
pub mod server;
pub mod session;
pub mod store;
pub mod types;
pub mod user;
pub mod watch;

// Re-exports
pub use config::KeystoneConfig;
pub use error::{KeystoneError, Result, Status};
pub use raft::Replica;

/// Run a replica with the given configuration until ctrl-c.
pub async fn run(config: KeystoneConfig) -> Result<()> {
    server::run_server(config).await
}
