//! HTTP wiring: the axum router exposing the replica's RPC surface, and the
//! reqwest-based peer transport.
//!
//! Consensus endpoints live under `/cluster/*`, the data plane under
//! `/api/*`. Everything is JSON over POST; the wire structs are the same
//! serde types the engine uses internally.

use crate::api::{
    DelRequest, DelResponse, GetRequest, GetResponse, KeepAliveRequest, KeepAliveResponse,
    LockRequest, LockResponse, LoginRequest, LoginResponse, LogoutRequest, LogoutResponse,
    PutRequest, PutResponse, RegisterRequest, RegisterResponse, ScanRequest, ScanResponse,
    UnLockRequest, UnLockResponse, WatchRequest, WatchResponse,
};
use crate::config::KeystoneConfig;
use crate::error::{KeystoneError, Result};
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, CleanBinlogRequest, CleanBinlogResponse,
    ClusterRpc, RpcStatRequest, RpcStatResponse, ShowStatusRequest, ShowStatusResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::Replica;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Per-call timeout for elections, heartbeats and control RPCs.
const CONTROL_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-call timeout for log-shipping AppendEntries.
const REPLICATION_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Peer transport over HTTP + JSON.
pub struct HttpRpc {
    client: reqwest::Client,
}

impl HttpRpc {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONTROL_RPC_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    async fn post_json<Req, Resp>(
        &self,
        target: &str,
        endpoint: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = format!("http://{}/{}", target, endpoint);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| KeystoneError::Network(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| KeystoneError::Serialization(e.to_string()))
    }
}

impl Default for HttpRpc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ClusterRpc for HttpRpc {
    async fn vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse> {
        self.post_json(target, "cluster/vote", &request, CONTROL_RPC_TIMEOUT)
            .await
    }

    async fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        // Heartbeats and read-quorum probes are latency-sensitive; shipped
        // batches may be large.
        let timeout = if request.entries.is_empty() {
            CONTROL_RPC_TIMEOUT
        } else {
            REPLICATION_RPC_TIMEOUT
        };
        self.post_json(target, "cluster/append_entries", &request, timeout)
            .await
    }

    async fn show_status(
        &self,
        target: &str,
        request: ShowStatusRequest,
    ) -> Result<ShowStatusResponse> {
        self.post_json(target, "cluster/show_status", &request, CONTROL_RPC_TIMEOUT)
            .await
    }

    async fn clean_binlog(
        &self,
        target: &str,
        request: CleanBinlogRequest,
    ) -> Result<CleanBinlogResponse> {
        self.post_json(target, "cluster/clean_binlog", &request, CONTROL_RPC_TIMEOUT)
            .await
    }

    async fn keep_alive(
        &self,
        target: &str,
        request: KeepAliveRequest,
    ) -> Result<KeepAliveResponse> {
        self.post_json(target, "api/keep_alive", &request, CONTROL_RPC_TIMEOUT)
            .await
    }
}

/// Build the full RPC surface for one replica.
pub fn router(replica: Arc<Replica>) -> Router {
    Router::new()
        // Cluster / consensus
        .route("/cluster/vote", post(handle_vote))
        .route("/cluster/append_entries", post(handle_append_entries))
        .route("/cluster/show_status", post(handle_show_status))
        .route("/cluster/clean_binlog", post(handle_clean_binlog))
        .route("/cluster/rpc_stat", post(handle_rpc_stat))
        // Data plane
        .route("/api/put", post(handle_put))
        .route("/api/get", post(handle_get))
        .route("/api/del", post(handle_del))
        .route("/api/scan", post(handle_scan))
        .route("/api/lock", post(handle_lock))
        .route("/api/unlock", post(handle_unlock))
        .route("/api/watch", post(handle_watch))
        // Session / user
        .route("/api/keep_alive", post(handle_keep_alive))
        .route("/api/login", post(handle_login))
        .route("/api/logout", post(handle_logout))
        .route("/api/register", post(handle_register))
        .with_state(replica)
}

/// Run a replica and serve its RPC surface until ctrl-c.
pub async fn run_server(config: KeystoneConfig) -> Result<()> {
    let bind_addr = config.server_id.clone();
    let rpc = Arc::new(HttpRpc::new());
    let replica = Replica::open(config, rpc)?;
    replica.start();

    let app = router(Arc::clone(&replica));
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "keystone replica listening");

    let shutdown_replica = Arc::clone(&replica);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            shutdown_replica.shutdown();
        })
        .await
        .map_err(|e| KeystoneError::Network(e.to_string()))?;
    Ok(())
}

// Cluster handlers

async fn handle_vote(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<VoteRequest>,
) -> Json<VoteResponse> {
    Json(replica.handle_vote(request))
}

async fn handle_append_entries(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    Json(replica.handle_append_entries(request))
}

async fn handle_show_status(
    State(replica): State<Arc<Replica>>,
    Json(_request): Json<ShowStatusRequest>,
) -> Json<ShowStatusResponse> {
    Json(replica.show_status())
}

async fn handle_clean_binlog(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<CleanBinlogRequest>,
) -> Json<CleanBinlogResponse> {
    Json(replica.handle_clean_binlog(request))
}

async fn handle_rpc_stat(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<RpcStatRequest>,
) -> Json<RpcStatResponse> {
    Json(replica.rpc_stat(request))
}

// Data-plane handlers

async fn handle_put(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<PutRequest>,
) -> Json<PutResponse> {
    Json(replica.put(request).await)
}

async fn handle_get(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<GetRequest>,
) -> Json<GetResponse> {
    Json(replica.get(request).await)
}

async fn handle_del(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<DelRequest>,
) -> Json<DelResponse> {
    Json(replica.del(request).await)
}

async fn handle_scan(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<ScanRequest>,
) -> Json<ScanResponse> {
    Json(replica.scan(request))
}

async fn handle_lock(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<LockRequest>,
) -> Json<LockResponse> {
    Json(replica.lock(request).await)
}

async fn handle_unlock(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<UnLockRequest>,
) -> Json<UnLockResponse> {
    Json(replica.unlock(request).await)
}

async fn handle_watch(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<WatchRequest>,
) -> Json<WatchResponse> {
    Json(replica.watch(request).await)
}

// Session / user handlers

async fn handle_keep_alive(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<KeepAliveRequest>,
) -> Json<KeepAliveResponse> {
    Json(replica.keep_alive(request))
}

async fn handle_login(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<LoginRequest>,
) -> Json<LoginResponse> {
    Json(replica.login(request).await)
}

async fn handle_logout(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<LogoutRequest>,
) -> Json<LogoutResponse> {
    Json(replica.logout(request).await)
}

async fn handle_register(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    Json(replica.register(request).await)
}
