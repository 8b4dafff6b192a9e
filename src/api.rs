//! Client-facing request/response types.
//!
//! Every failure response carries a `leader_id` hint: the known leader's
//! endpoint, or empty when unknown. Clients follow non-empty hints without
//! counting the hop as a failure.

use crate::error::Status;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
    #[serde(default)]
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub success: bool,
    pub hit: bool,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelRequest {
    pub key: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelResponse {
    pub success: bool,
    #[serde(default)]
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub start_key: String,
    pub end_key: String,
    pub size_limit: usize,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub success: bool,
    #[serde(default)]
    pub items: Vec<ScanItem>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub key: String,
    pub session_id: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub success: bool,
    #[serde(default)]
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnLockRequest {
    pub key: String,
    pub session_id: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnLockResponse {
    pub success: bool,
    #[serde(default)]
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRequest {
    pub key: String,
    pub session_id: String,
    #[serde(default)]
    pub old_value: String,
    #[serde(default)]
    pub key_exist: bool,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResponse {
    pub success: bool,
    #[serde(default)]
    pub watch_key: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub timeout_milliseconds: Option<u64>,
    #[serde(default)]
    pub locks: Vec<String>,
    #[serde(default)]
    pub forward_from_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub success: bool,
    #[serde(default)]
    pub leader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    /// Lower-case hex SHA-1 of the plaintext password.
    pub passwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub status: Status,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub leader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub status: Status,
    #[serde(default)]
    pub leader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    /// Lower-case hex SHA-1 of the plaintext password.
    pub passwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: Status,
    #[serde(default)]
    pub leader_id: String,
}
