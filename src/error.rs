//! Error types for the Keystone coordination service.
//!
//! [`KeystoneError`] is the unified internal error type; [`Status`] is the
//! wire-level result code carried on client responses. The two are kept
//! separate on purpose: internal errors describe what broke inside a
//! replica, while statuses describe what the client should do next.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Main error type for Keystone operations.
///
/// Leader redirection and quorum outcomes are not errors here: they travel
/// as `leader_id` hints and [`Status`] codes on the wire responses.
#[derive(Error, Debug)]
pub enum KeystoneError {
    // Consensus errors
    #[error("Bad log slot: {0}")]
    BadSlot(i64),

    #[error("Binlog error: {0}")]
    Binlog(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown user namespace: {0}")]
    UnknownUser(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    // Cluster / network errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    // Configuration errors
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeystoneError {
    /// Check if the error is retryable from a client's point of view.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeystoneError::Network(_))
    }
}

impl From<rocksdb::Error> for KeystoneError {
    fn from(e: rocksdb::Error) -> Self {
        KeystoneError::RocksDb(e.to_string())
    }
}

impl From<bincode::Error> for KeystoneError {
    fn from(e: bincode::Error) -> Self {
        KeystoneError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for KeystoneError {
    fn from(e: serde_json::Error) -> Self {
        KeystoneError::Serialization(e.to_string())
    }
}

/// Result type alias for Keystone operations.
pub type Result<T> = std::result::Result<T, KeystoneError>;

/// Wire-level result code surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
    ClusterDown,
    NoSuchKey,
    Timeout,
    LockFail,
    CleanBinlogFail,
    UserExists,
    PermissionDenied,
    PasswordError,
    UnknownUser,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Error
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "Ok",
            Status::Error => "Error",
            Status::ClusterDown => "ClusterDown",
            Status::NoSuchKey => "NoSuchKey",
            Status::Timeout => "Timeout",
            Status::LockFail => "LockFail",
            Status::CleanBinlogFail => "CleanBinlogFail",
            Status::UserExists => "UserExists",
            Status::PermissionDenied => "PermissionDenied",
            Status::PasswordError => "PasswordError",
            Status::UnknownUser => "UnknownUser",
        };
        write!(f, "{}", name)
    }
}
