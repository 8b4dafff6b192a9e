//! Thin client for the CLI and tests: follows leader hints, falls back to
//! trying every member, and reports cluster-down when nobody will serve.

use crate::api::{
    DelRequest, DelResponse, GetRequest, GetResponse, KeepAliveRequest, KeepAliveResponse,
    LockRequest, LockResponse, LoginRequest, LoginResponse, LogoutRequest, LogoutResponse,
    PutRequest, PutResponse, RegisterRequest, RegisterResponse, ScanItem, ScanRequest,
    ScanResponse, UnLockRequest, UnLockResponse, WatchRequest, WatchResponse,
};
use crate::error::{KeystoneError, Result, Status};
use crate::raft::rpc::{RpcStatRequest, RpcStatResponse, ShowStatusRequest, ShowStatusResponse};
use crate::user::hash_password;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

const CLIENT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Long-poll budget for a watch call.
const WATCH_RPC_TIMEOUT: Duration = Duration::from_secs(120);

fn cluster_down() -> KeystoneError {
    KeystoneError::Network("cluster is down or has no reachable leader".to_string())
}

/// A client handle over the cluster member list.
pub struct KeystoneClient {
    members: Vec<String>,
    leader_hint: Mutex<Option<String>>,
    http: reqwest::Client,
}

impl KeystoneClient {
    pub fn new(members: Vec<String>) -> Result<Self> {
        if members.is_empty() {
            return Err(KeystoneError::Config("empty member list".to_string()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| KeystoneError::Network(e.to_string()))?;
        Ok(Self {
            members,
            leader_hint: Mutex::new(None),
            http,
        })
    }

    /// Parse a comma-separated member list.
    pub fn from_members_arg(members: &str) -> Result<Self> {
        let members: Vec<String> = members
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        Self::new(members)
    }

    fn candidates(&self) -> VecDeque<String> {
        let mut out = VecDeque::new();
        if let Some(hint) = self.leader_hint.lock().clone() {
            out.push_back(hint);
        }
        for member in &self.members {
            if !out.contains(member) {
                out.push_back(member.clone());
            }
        }
        out
    }

    async fn post_json<Req, Resp>(
        &self,
        server: &str,
        endpoint: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = format!("http://{}/{}", server, endpoint);
        let response = self
            .http
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

    /// Run one request against the cluster, following `leader_id` hints.
    /// `judge` decides whether a reply is final; a hint hop does not count as
    /// a failure.
    async fn call<Req, Resp, F>(&self, endpoint: &str, request: &Req, judge: F) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        F: Fn(&Resp) -> (bool, String),
    {
        let mut candidates = self.candidates();
        let mut hops = self.members.len() * 2 + 2;
        while let Some(server) = candidates.pop_front() {
            if hops == 0 {
                break;
            }
            hops -= 1;
            match self
                .post_json::<Req, Resp>(&server, endpoint, request, CLIENT_RPC_TIMEOUT)
                .await
            {
                Ok(response) => {
                    let (done, leader_id) = judge(&response);
                    if done {
                        *self.leader_hint.lock() = Some(server);
                        return Ok(response);
                    }
                    if !leader_id.is_empty() && leader_id != server {
                        candidates.push_front(leader_id);
                    }
                }
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "rpc failed, trying next member");
                }
            }
        }
        *self.leader_hint.lock() = None;
        Err(cluster_down())
    }

    pub async fn put(&self, key: &str, value: &str, uuid: &str) -> Result<()> {
        let request = PutRequest {
            key: key.to_string(),
            value: value.to_string(),
            uuid: uuid.to_string(),
        };
        let response: PutResponse = self
            .call("api/put", &request, |r: &PutResponse| {
                (r.success || r.uuid_expired, r.leader_id.clone())
            })
            .await?;
        if response.uuid_expired {
            return Err(KeystoneError::NotFound("uuid expired".to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, key: &str, uuid: &str) -> Result<Option<String>> {
        let request = GetRequest {
            key: key.to_string(),
            uuid: uuid.to_string(),
        };
        let response: GetResponse = self
            .call("api/get", &request, |r: &GetResponse| {
                (r.success || r.uuid_expired, r.leader_id.clone())
            })
            .await?;
        if response.hit {
            Ok(Some(response.value))
        } else {
            Ok(None)
        }
    }

    pub async fn del(&self, key: &str, uuid: &str) -> Result<()> {
        let request = DelRequest {
            key: key.to_string(),
            uuid: uuid.to_string(),
        };
        self.call("api/del", &request, |r: &DelResponse| {
            (r.success || r.uuid_expired, r.leader_id.clone())
        })
        .await?;
        Ok(())
    }

    pub async fn scan(
        &self,
        start_key: &str,
        end_key: &str,
        size_limit: usize,
        uuid: &str,
    ) -> Result<(Vec<ScanItem>, bool)> {
        let request = ScanRequest {
            start_key: start_key.to_string(),
            end_key: end_key.to_string(),
            size_limit,
            uuid: uuid.to_string(),
        };
        let response: ScanResponse = self
            .call("api/scan", &request, |r: &ScanResponse| {
                (r.success || r.uuid_expired, r.leader_id.clone())
            })
            .await?;
        Ok((response.items, response.has_more))
    }

    pub async fn lock(&self, key: &str, session_id: &str, uuid: &str) -> Result<bool> {
        let request = LockRequest {
            key: key.to_string(),
            session_id: session_id.to_string(),
            uuid: uuid.to_string(),
        };
        // A refused lock comes back success=false with no hint; only a
        // redirect is worth another hop, so judge on the hint instead.
        let response: LockResponse = self
            .call("api/lock", &request, |r: &LockResponse| {
                (r.success || r.leader_id.is_empty(), r.leader_id.clone())
            })
            .await?;
        Ok(response.success)
    }

    pub async fn unlock(&self, key: &str, session_id: &str, uuid: &str) -> Result<()> {
        let request = UnLockRequest {
            key: key.to_string(),
            session_id: session_id.to_string(),
            uuid: uuid.to_string(),
        };
        self.call("api/unlock", &request, |r: &UnLockResponse| {
            (r.success || r.uuid_expired, r.leader_id.clone())
        })
        .await?;
        Ok(())
    }

    pub async fn watch(&self, request: WatchRequest) -> Result<WatchResponse> {
        let mut candidates = self.candidates();
        while let Some(server) = candidates.pop_front() {
            match self
                .post_json::<WatchRequest, WatchResponse>(
                    &server,
                    "api/watch",
                    &request,
                    WATCH_RPC_TIMEOUT,
                )
                .await
            {
                Ok(response) => {
                    if response.success || response.canceled || response.uuid_expired {
                        return Ok(response);
                    }
                    if !response.leader_id.is_empty() && response.leader_id != server {
                        candidates.push_front(response.leader_id.clone());
                    }
                }
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "watch rpc failed");
                }
            }
        }
        Err(cluster_down())
    }

    pub async fn keep_alive(
        &self,
        session_id: &str,
        uuid: &str,
        timeout_ms: Option<u64>,
        locks: Vec<String>,
    ) -> Result<()> {
        let request = KeepAliveRequest {
            session_id: session_id.to_string(),
            uuid: uuid.to_string(),
            timeout_milliseconds: timeout_ms,
            locks,
            forward_from_leader: false,
        };
        self.call("api/keep_alive", &request, |r: &KeepAliveResponse| {
            (r.success, r.leader_id.clone())
        })
        .await?;
        Ok(())
    }

    /// Register a user. The plaintext password is hashed here; only the hex
    /// SHA-1 travels.
    pub async fn register(&self, username: &str, password: &str) -> Result<Status> {
        let request = RegisterRequest {
            username: username.to_string(),
            passwd: hash_password(password),
        };
        let response: RegisterResponse = self
            .call("api/register", &request, |r: &RegisterResponse| {
                (r.status != Status::Error, r.leader_id.clone())
            })
            .await?;
        Ok(response.status)
    }

    /// Log in and return the user's uuid on success.
    pub async fn login(&self, username: &str, password: &str) -> Result<(Status, String)> {
        let request = LoginRequest {
            username: username.to_string(),
            passwd: hash_password(password),
        };
        let response: LoginResponse = self
            .call("api/login", &request, |r: &LoginResponse| {
                (r.status != Status::Error, r.leader_id.clone())
            })
            .await?;
        Ok((response.status, response.uuid))
    }

    pub async fn logout(&self, uuid: &str) -> Result<Status> {
        let request = LogoutRequest {
            uuid: uuid.to_string(),
        };
        let response: LogoutResponse = self
            .call("api/logout", &request, |r: &LogoutResponse| {
                (r.status != Status::Error, r.leader_id.clone())
            })
            .await?;
        Ok(response.status)
    }

    /// Consensus position of a single member (no redirects).
    pub async fn show_status(&self, server: &str) -> Result<ShowStatusResponse> {
        self.post_json(
            server,
            "cluster/show_status",
            &ShowStatusRequest::default(),
            CLIENT_RPC_TIMEOUT,
        )
        .await
    }

    pub async fn rpc_stat(&self, server: &str, ops: Vec<u32>) -> Result<RpcStatResponse> {
        self.post_json(
            server,
            "cluster/rpc_stat",
            &RpcStatRequest { ops },
            CLIENT_RPC_TIMEOUT,
        )
        .await
    }

    /// Ask one member to drop its binlog prefix below `end_index`.
    pub async fn clean_binlog(&self, server: &str, end_index: i64) -> Result<bool> {
        let response: crate::raft::rpc::CleanBinlogResponse = self
            .post_json(
                server,
                "cluster/clean_binlog",
                &crate::raft::rpc::CleanBinlogRequest { end_index },
                CLIENT_RPC_TIMEOUT,
            )
            .await?;
        Ok(response.success)
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_list_parsing() {
        let client = KeystoneClient::from_members_arg("a:1, b:2 ,c:3,").unwrap();
        assert_eq!(client.members(), &["a:1", "b:2", "c:3"]);
        assert!(KeystoneClient::from_members_arg("  ,").is_err());
    }

    #[test]
    fn test_candidates_prefer_hint() {
        let client = KeystoneClient::from_members_arg("a:1,b:2").unwrap();
        *client.leader_hint.lock() = Some("b:2".to_string());
        let candidates: Vec<String> = client.candidates().into_iter().collect();
        assert_eq!(candidates, vec!["b:2", "a:1"]);
    }
}
