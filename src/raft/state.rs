//! Replica state guarded by the primary mutex.

use crate::api::{
    DelResponse, LockResponse, LoginResponse, LogoutResponse, PutResponse, RegisterResponse,
    UnLockResponse,
};
use crate::error::Status;
use crate::types::{NodeRole, ServerId, SlotIndex, Term};
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;

/// A pending client acknowledgment, keyed by the slot its entry landed in.
/// The apply loop consumes and completes exactly one per applied slot.
pub enum AckKind {
    Put(oneshot::Sender<PutResponse>),
    Del(oneshot::Sender<DelResponse>),
    Lock(oneshot::Sender<LockResponse>),
    Unlock(oneshot::Sender<UnLockResponse>),
    Login(oneshot::Sender<LoginResponse>),
    Logout(oneshot::Sender<LogoutResponse>),
    Register(oneshot::Sender<RegisterResponse>),
}

impl AckKind {
    /// Complete the ack after its slot applied. `status` and `new_uuid` are
    /// only meaningful for the user-management variants.
    pub fn complete(self, status: Status, new_uuid: &str) {
        match self {
            AckKind::Put(tx) => {
                let _ = tx.send(PutResponse {
                    success: true,
                    leader_id: String::new(),
                    uuid_expired: false,
                });
            }
            AckKind::Del(tx) => {
                let _ = tx.send(DelResponse {
                    success: true,
                    leader_id: String::new(),
                    uuid_expired: false,
                });
            }
            AckKind::Lock(tx) => {
                let _ = tx.send(LockResponse {
                    success: true,
                    leader_id: String::new(),
                    uuid_expired: false,
                });
            }
            AckKind::Unlock(tx) => {
                let _ = tx.send(UnLockResponse {
                    success: true,
                    leader_id: String::new(),
                    uuid_expired: false,
                });
            }
            AckKind::Login(tx) => {
                let _ = tx.send(LoginResponse {
                    status,
                    uuid: new_uuid.to_string(),
                    leader_id: String::new(),
                });
            }
            AckKind::Logout(tx) => {
                let _ = tx.send(LogoutResponse {
                    status,
                    leader_id: String::new(),
                });
            }
            AckKind::Register(tx) => {
                let _ = tx.send(RegisterResponse {
                    status,
                    leader_id: String::new(),
                });
            }
        }
    }

    /// Fail the ack: the entry was dropped on step-down.
    pub fn fail(self) {
        match self {
            AckKind::Put(tx) => {
                let _ = tx.send(PutResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                });
            }
            AckKind::Del(tx) => {
                let _ = tx.send(DelResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                });
            }
            AckKind::Lock(tx) => {
                let _ = tx.send(LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                });
            }
            AckKind::Unlock(tx) => {
                let _ = tx.send(UnLockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                });
            }
            AckKind::Login(tx) => {
                let _ = tx.send(LoginResponse {
                    status: Status::Error,
                    uuid: String::new(),
                    leader_id: String::new(),
                });
            }
            AckKind::Logout(tx) => {
                let _ = tx.send(LogoutResponse {
                    status: Status::Error,
                    leader_id: String::new(),
                });
            }
            AckKind::Register(tx) => {
                let _ = tx.send(RegisterResponse {
                    status: Status::Error,
                    leader_id: String::new(),
                });
            }
        }
    }
}

/// Everything guarded by the replica's primary mutex: role, terms, votes,
/// replication progress, commit/apply positions, and the client-ack table.
pub struct ReplicaState {
    pub role: NodeRole,
    pub current_term: Term,
    pub voted_for: HashMap<Term, ServerId>,
    pub vote_grants: HashMap<Term, usize>,
    pub current_leader: Option<ServerId>,
    pub heartbeat_count: u64,
    pub in_safe_mode: bool,
    pub commit_index: SlotIndex,
    pub last_applied: SlotIndex,
    pub next_index: HashMap<ServerId, SlotIndex>,
    pub match_index: HashMap<ServerId, SlotIndex>,
    /// Followers with a live replication worker, so re-election does not
    /// spawn duplicates.
    pub replicating: HashSet<ServerId>,
    pub client_acks: HashMap<SlotIndex, AckKind>,
    pub last_safe_clean_index: SlotIndex,
    pub stopped: bool,
}

impl ReplicaState {
    pub fn new(current_term: Term, voted_for: HashMap<Term, ServerId>, last_applied: SlotIndex) -> Self {
        Self {
            role: NodeRole::Follower,
            current_term,
            voted_for,
            vote_grants: HashMap::new(),
            current_leader: None,
            heartbeat_count: 0,
            in_safe_mode: true,
            commit_index: -1,
            last_applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            replicating: HashSet::new(),
            client_acks: HashMap::new(),
            last_safe_clean_index: -1,
            stopped: false,
        }
    }

    /// The leader-visible hint clients should retry against.
    pub fn leader_hint(&self) -> String {
        self.current_leader.clone().unwrap_or_default()
    }

    /// Count of cluster members (leader included) known to hold slot `n`.
    pub fn replicated_count(&self, n: SlotIndex) -> usize {
        1 + self
            .match_index
            .values()
            .filter(|&&m| m >= n)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicated_count_includes_leader() {
        let mut state = ReplicaState::new(1, HashMap::new(), -1);
        state.match_index.insert("b:1".to_string(), 4);
        state.match_index.insert("c:1".to_string(), 2);

        assert_eq!(state.replicated_count(4), 2); // leader + b
        assert_eq!(state.replicated_count(2), 3); // leader + b + c
        assert_eq!(state.replicated_count(9), 1); // leader only
    }

    #[test]
    fn test_fail_is_observable() {
        let (tx, mut rx) = oneshot::channel();
        AckKind::Put(tx).fail();
        let resp = rx.try_recv().unwrap();
        assert!(!resp.success);
        assert!(resp.leader_id.is_empty());
    }

    #[test]
    fn test_complete_login_carries_uuid() {
        let (tx, mut rx) = oneshot::channel();
        AckKind::Login(tx).complete(Status::Ok, "uuid-1");
        let resp = rx.try_recv().unwrap();
        assert!(resp.status.is_ok());
        assert_eq!(resp.uuid, "uuid-1");
    }
}
