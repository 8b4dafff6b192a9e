//! Consensus RPC message definitions and the cluster transport trait.

use crate::api::{KeepAliveRequest, KeepAliveResponse};
use crate::types::{LogEntry, NodeRole, ServerId, SlotIndex, Term};
use serde::{Deserialize, Serialize};

/// Vote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: SlotIndex,
    pub last_log_term: Term,
}

/// Vote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Responder's term, for the candidate to update itself.
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments; empty `entries` is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: ServerId,
    /// Slot immediately preceding the batch; `-1` when shipping from slot 0
    /// and for heartbeats.
    #[serde(default = "neg_one")]
    pub prev_log_index: SlotIndex,
    #[serde(default = "neg_one")]
    pub prev_log_term: Term,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    pub leader_commit_index: SlotIndex,
}

fn neg_one() -> i64 {
    -1
}

/// AppendEntries RPC response. `log_length` lets the leader clamp its
/// back-off; `is_busy` signals apply backpressure without a `next_index`
/// adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub current_term: Term,
    pub success: bool,
    pub log_length: SlotIndex,
    #[serde(default)]
    pub is_busy: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShowStatusRequest {}

/// A replica's consensus position, used by clients and by the GC round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowStatusResponse {
    pub status: NodeRole,
    pub term: Term,
    pub last_log_index: SlotIndex,
    pub last_log_term: Term,
    pub commit_index: SlotIndex,
    pub last_applied: SlotIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanBinlogRequest {
    /// Slots below this index are garbage once every replica has applied it.
    pub end_index: SlotIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanBinlogResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcStatRequest {
    /// Wire ids of the operations to sample (1..=8); empty means all.
    #[serde(default)]
    pub ops: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatInfo {
    pub current_stat: i64,
    pub average_stat: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStatResponse {
    pub stats: Vec<StatInfo>,
    pub status: NodeRole,
}

/// Peer-to-peer transport. The consensus engine never talks HTTP directly;
/// it goes through this trait so tests can wire replicas in process.
#[async_trait::async_trait]
pub trait ClusterRpc: Send + Sync {
    async fn vote(&self, target: &str, request: VoteRequest) -> crate::Result<VoteResponse>;

    async fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
    ) -> crate::Result<AppendEntriesResponse>;

    async fn show_status(
        &self,
        target: &str,
        request: ShowStatusRequest,
    ) -> crate::Result<ShowStatusResponse>;

    async fn clean_binlog(
        &self,
        target: &str,
        request: CleanBinlogRequest,
    ) -> crate::Result<CleanBinlogResponse>;

    /// Leader-to-follower keep-alive forwarding.
    async fn keep_alive(
        &self,
        target: &str,
        request: KeepAliveRequest,
    ) -> crate::Result<KeepAliveResponse>;
}

/// A transport that drops everything, for single-node tests.
pub struct NullRpc;

#[async_trait::async_trait]
impl ClusterRpc for NullRpc {
    async fn vote(&self, target: &str, _request: VoteRequest) -> crate::Result<VoteResponse> {
        Err(crate::KeystoneError::NodeNotFound(target.to_string()))
    }

    async fn append_entries(
        &self,
        target: &str,
        _request: AppendEntriesRequest,
    ) -> crate::Result<AppendEntriesResponse> {
        Err(crate::KeystoneError::NodeNotFound(target.to_string()))
    }

    async fn show_status(
        &self,
        target: &str,
        _request: ShowStatusRequest,
    ) -> crate::Result<ShowStatusResponse> {
        Err(crate::KeystoneError::NodeNotFound(target.to_string()))
    }

    async fn clean_binlog(
        &self,
        target: &str,
        _request: CleanBinlogRequest,
    ) -> crate::Result<CleanBinlogResponse> {
        Err(crate::KeystoneError::NodeNotFound(target.to_string()))
    }

    async fn keep_alive(
        &self,
        target: &str,
        _request: KeepAliveRequest,
    ) -> crate::Result<KeepAliveResponse> {
        Err(crate::KeystoneError::NodeNotFound(target.to_string()))
    }
}
