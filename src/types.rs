//! Core type definitions for Keystone.
//!
//! # Type Aliases
//!
//! - [`ServerId`] = `String`: a replica's `host:port` endpoint, which doubles
//!   as its cluster-wide identity.
//! - [`Term`] = `i64`: election epoch.
//! - [`SlotIndex`] = `i64`: position in the replicated binlog. `-1` is the
//!   sentinel for "nothing yet" (empty log, no commit, nothing applied).

use serde::{Deserialize, Serialize};

/// A replica's endpoint and identity within the cluster.
pub type ServerId = String;

/// Election epoch. Monotonic; at most one leader per term.
pub type Term = i64;

/// Index of a binlog slot. Monotonic from 0 within a replica.
pub type SlotIndex = i64;

/// Operation carried by a log entry and, as a one-byte tag, by every value
/// in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogOp {
    Nop = 0,
    Put = 1,
    Del = 2,
    Lock = 3,
    Unlock = 4,
    Login = 5,
    Logout = 6,
    Register = 7,
}

impl LogOp {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(tag: u8) -> Option<LogOp> {
        match tag {
            0 => Some(LogOp::Nop),
            1 => Some(LogOp::Put),
            2 => Some(LogOp::Del),
            3 => Some(LogOp::Lock),
            4 => Some(LogOp::Unlock),
            5 => Some(LogOp::Login),
            6 => Some(LogOp::Logout),
            7 => Some(LogOp::Register),
            _ => None,
        }
    }
}

/// A single replicated log entry.
///
/// `user` is the acting user's stable uuid, or empty for the anonymous
/// namespace. For `Login` entries it carries the uuid minted by the leader so
/// every replica applies the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub op: LogOp,
    pub user: String,
    pub key: String,
    pub value: String,
    pub term: Term,
}

impl LogEntry {
    pub fn new(op: LogOp, term: Term) -> Self {
        Self {
            op,
            user: String::new(),
            key: String::new(),
            value: String::new(),
            term,
        }
    }
}

impl Default for LogEntry {
    fn default() -> Self {
        Self::new(LogOp::Nop, -1)
    }
}

/// Role of a replica in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Passive; responds to RPCs, redirects clients to the leader.
    Follower,
    /// Actively seeking election.
    Candidate,
    /// Handling client requests and log replication.
    Leader,
}

impl NodeRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeRole::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, NodeRole::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, NodeRole::Candidate)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "Follower"),
            NodeRole::Candidate => write!(f, "Candidate"),
            NodeRole::Leader => write!(f, "Leader"),
        }
    }
}

/// Compute the parent of a hierarchical key: everything before the last `/`.
/// Keys without a `/` have no parent.
pub fn parent_key(key: &str) -> Option<&str> {
    key.rfind('/').map(|idx| &key[..idx])
}

/// Bind a key to its owning user namespace, producing the event key used by
/// the watch tables.
pub fn bind_key_and_user(user: &str, key: &str) -> String {
    format!("{}::{}", user, key)
}

/// Recover the bare key from an event key produced by [`bind_key_and_user`].
pub fn key_from_event(event_key: &str) -> &str {
    match event_key.find("::") {
        Some(idx) => &event_key[idx + 2..],
        None => event_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_op_tags() {
        for op in [
            LogOp::Nop,
            LogOp::Put,
            LogOp::Del,
            LogOp::Lock,
            LogOp::Unlock,
            LogOp::Login,
            LogOp::Logout,
            LogOp::Register,
        ] {
            assert_eq!(LogOp::from_u8(op.as_u8()), Some(op));
        }
        assert_eq!(LogOp::from_u8(8), None);
    }

    #[test]
    fn test_parent_key() {
        assert_eq!(parent_key("/lock/master"), Some("/lock"));
        assert_eq!(parent_key("/m"), Some(""));
        assert_eq!(parent_key("plain"), None);
        assert_eq!(parent_key(""), None);
    }

    #[test]
    fn test_event_key_binding() {
        let bound = bind_key_and_user("alice", "/cfg/db");
        assert_eq!(bound, "alice::/cfg/db");
        assert_eq!(key_from_event(&bound), "/cfg/db");
        // Anonymous namespace binds with an empty user.
        assert_eq!(key_from_event(&bind_key_and_user("", "/k")), "/k");
    }

    #[test]
    fn test_entry_roundtrip_is_exact() {
        let entry = LogEntry {
            op: LogOp::Lock,
            user: "u-1".into(),
            key: "/lock/master".into(),
            value: "host#sess".into(),
            term: 7,
        };
        let bytes = bincode::serialize(&entry).unwrap();
        let back: LogEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, entry);
        // Framing must be stable: re-serializing yields identical bytes.
        assert_eq!(bincode::serialize(&back).unwrap(), bytes);
    }
}
