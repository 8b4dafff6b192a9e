//! Raft consensus and replication engine for the Keystone cluster.
//!
//! This module owns leader election, the durable binlog, per-follower log
//! shipping, commit-index advancement, and the apply loop that turns
//! committed entries into key/value, lock, session, and watch effects.

// unwrap() panics here can break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod binlog;
mod meta;
mod node;
pub mod rpc;
mod state;

pub use binlog::{BinLog, BinLogOptions};
pub use meta::Meta;
pub use node::Replica;
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, CleanBinlogRequest, CleanBinlogResponse,
    ClusterRpc, NullRpc, RpcStatRequest, RpcStatResponse, ShowStatusRequest, ShowStatusResponse,
    StatInfo, VoteRequest, VoteResponse,
};
pub use state::{AckKind, ReplicaState};
