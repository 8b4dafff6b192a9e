//! Configuration for a Keystone replica.

use crate::error::{KeystoneError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for a single replica.
///
/// All timeouts are in the unit named by the field; `session_expire_timeout`
/// is milliseconds (the session TTL default and the uptime guard window for
/// lock and scan requests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoneConfig {
    /// This replica's `host:port` endpoint. Must appear in `cluster_members`.
    pub server_id: String,
    /// Every member of the cluster, self included.
    pub cluster_members: Vec<String>,
    /// Root directory for the meta column, binlog and state store.
    pub data_dir: PathBuf,
    /// Minimum randomized election timeout (ms).
    pub elect_timeout_min: u64,
    /// Maximum randomized election timeout (ms).
    pub elect_timeout_max: u64,
    /// Leader heartbeat period (ms).
    pub heartbeat_interval: u64,
    /// Default session TTL and new-leader lock guard window (ms).
    pub session_expire_timeout: u64,
    /// Maximum entries shipped per AppendEntries batch.
    pub log_rep_batch_max: i64,
    /// Sleep between replication retries after a failure or busy reply (ms).
    pub replication_retry_timespan: u64,
    /// Cap on outstanding client acks on the leader.
    pub max_write_pending: usize,
    /// Largest commit/apply gap a follower accepts before replying busy.
    pub max_commit_pending: i64,
    /// Period of the leader's binlog garbage collection round (s).
    pub gc_interval: u64,
    /// Probability of logging any single data-plane request.
    pub trace_ratio: f64,
    /// Binlog compression toggle.
    pub binlog_compress: bool,
    /// Binlog block size (KiB).
    pub binlog_block_size: usize,
    /// Binlog write buffer size (MiB).
    pub binlog_write_buffer_size: usize,
    /// Capacity of the per-operation performance counters.
    pub performance_buffer_size: usize,
    /// Refuse to start clusters larger than this.
    pub max_cluster_size: usize,
    /// Log level handed to the tracing subscriber.
    pub log_level: String,
}

impl Default for KeystoneConfig {
    fn default() -> Self {
        Self {
            server_id: "127.0.0.1:8868".to_string(),
            cluster_members: vec!["127.0.0.1:8868".to_string()],
            data_dir: PathBuf::from("/var/lib/keystone"),
            elect_timeout_min: 150,
            elect_timeout_max: 300,
            heartbeat_interval: 50,
            session_expire_timeout: 6_000,
            log_rep_batch_max: 500,
            replication_retry_timespan: 400,
            max_write_pending: 10_000,
            max_commit_pending: 10_000,
            gc_interval: 60,
            trace_ratio: 0.001,
            binlog_compress: false,
            binlog_block_size: 32,
            binlog_write_buffer_size: 32,
            performance_buffer_size: 60,
            max_cluster_size: 10,
            log_level: "info".to_string(),
        }
    }
}

impl KeystoneConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KeystoneError::Config(format!("failed to read config file: {}", e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| KeystoneError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. A replica that is not in the member list, or a
    /// cluster larger than `max_cluster_size`, refuses to start.
    pub fn validate(&self) -> Result<()> {
        if self.server_id.is_empty() {
            return Err(KeystoneError::InvalidConfig {
                field: "server_id".to_string(),
                reason: "server id must be non-empty".to_string(),
            });
        }
        if !self.cluster_members.iter().any(|m| *m == self.server_id) {
            return Err(KeystoneError::InvalidConfig {
                field: "cluster_members".to_string(),
                reason: format!("this node ({}) is not in the cluster membership", self.server_id),
            });
        }
        if self.cluster_members.len() > self.max_cluster_size {
            return Err(KeystoneError::InvalidConfig {
                field: "cluster_members".to_string(),
                reason: format!(
                    "cluster size {} is larger than max_cluster_size {}",
                    self.cluster_members.len(),
                    self.max_cluster_size
                ),
            });
        }
        if self.elect_timeout_min == 0 || self.elect_timeout_max < self.elect_timeout_min {
            return Err(KeystoneError::InvalidConfig {
                field: "elect_timeout_max".to_string(),
                reason: "election timeout range must be non-empty".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.trace_ratio) {
            return Err(KeystoneError::InvalidConfig {
                field: "trace_ratio".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }

    /// True when this replica is the only cluster member.
    pub fn single_node(&self) -> bool {
        self.cluster_members.len() == 1
    }

    /// Cluster peers, i.e. every member except this replica.
    pub fn peers(&self) -> Vec<String> {
        self.cluster_members
            .iter()
            .filter(|m| **m != self.server_id)
            .cloned()
            .collect()
    }

    /// Directory layout under `data_dir`, one subtree per durable area.
    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("meta")
    }

    pub fn binlog_dir(&self) -> PathBuf {
        self.data_dir.join("binlog")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid_single_node() {
        let config = KeystoneConfig::default();
        config.validate().unwrap();
        assert!(config.single_node());
        assert!(config.peers().is_empty());
    }

    #[test]
    fn test_self_must_be_member() {
        let config = KeystoneConfig {
            server_id: "10.0.0.1:8868".to_string(),
            cluster_members: vec!["10.0.0.2:8868".to_string(), "10.0.0.3:8868".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cluster_size_cap() {
        let members: Vec<String> = (0..11).map(|i| format!("10.0.0.{}:8868", i)).collect();
        let config = KeystoneConfig {
            server_id: members[0].clone(),
            cluster_members: members,
            max_cluster_size: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peers_excludes_self() {
        let config = KeystoneConfig {
            server_id: "a:1".to_string(),
            cluster_members: vec!["a:1".to_string(), "b:1".to_string(), "c:1".to_string()],
            ..Default::default()
        };
        assert_eq!(config.peers(), vec!["b:1".to_string(), "c:1".to_string()]);
    }
}
