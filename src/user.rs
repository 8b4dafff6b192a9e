//! User accounts and login tracking.
//!
//! A user record is `{name, password hash, uuid}` where the hash is the
//! lower-case hex SHA-1 the client sent on the wire and the uuid is derived
//! deterministically from the name (UUIDv5), so every replica mints the same
//! identity when it applies a `Login` entry. Records are durable in the
//! anonymous namespace of the state store under a reserved key prefix; the
//! logged-in map is volatile and rebuilt by applied `Login`/`Logout` entries.

use crate::error::{Result, Status};
use crate::store::{StateStore, ANONYMOUS_USER, TAG_USER_PREFIX};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub passwd_hash: String,
    pub uuid: String,
}

impl UserRecord {
    pub fn new(name: &str, passwd_hash: &str) -> Self {
        Self {
            name: name.to_string(),
            passwd_hash: passwd_hash.to_string(),
            uuid: calc_uuid(name),
        }
    }
}

/// Deterministic uuid for a username. Every replica computes the same value.
pub fn calc_uuid(name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Lower-case hex SHA-1 of a plaintext password; the wire and storage format.
pub fn hash_password(plain: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(plain.as_bytes());
    hex::encode(hasher.finalize())
}

/// Registered users plus the set of currently logged-in uuids.
pub struct UserManager {
    store: Arc<StateStore>,
    users: RwLock<HashMap<String, UserRecord>>,
    logged_in: RwLock<HashMap<String, String>>,
}

impl UserManager {
    /// Load durable user records and seed the root account.
    pub fn new(store: Arc<StateStore>, root: UserRecord) -> Result<Self> {
        let mut users = HashMap::new();
        for item in store.scan_from(ANONYMOUS_USER, TAG_USER_PREFIX)? {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            if !key.starts_with(TAG_USER_PREFIX) {
                break;
            }
            let record: UserRecord = bincode::deserialize(&value)?;
            users.insert(record.name.clone(), record);
        }
        users.entry(root.name.clone()).or_insert(root);

        Ok(Self {
            store,
            users: RwLock::new(users),
            logged_in: RwLock::new(HashMap::new()),
        })
    }

    pub fn is_valid_user(&self, name: &str) -> bool {
        self.users.read().contains_key(name)
    }

    pub fn is_logged_in(&self, uuid: &str) -> bool {
        self.logged_in.read().contains_key(uuid)
    }

    /// Resolve a uuid to its namespace name. Empty or unknown uuids map to
    /// the anonymous namespace.
    pub fn username_from_uuid(&self, uuid: &str) -> String {
        if uuid.is_empty() {
            return String::new();
        }
        self.logged_in.read().get(uuid).cloned().unwrap_or_default()
    }

    /// Apply a `Register` entry: create the record if absent. Names that
    /// would land in the reserved key range or alias the anonymous namespace
    /// are refused.
    pub fn register(&self, name: &str, passwd_hash: &str) -> Status {
        if name.is_empty() || name.starts_with('#') || crate::store::is_reserved_namespace(name) {
            return Status::Error;
        }
        let mut users = self.users.write();
        if users.contains_key(name) {
            return Status::UserExists;
        }
        let record = UserRecord::new(name, passwd_hash);
        if let Err(e) = self.persist(&record) {
            tracing::error!(user = name, error = %e, "failed to persist user record");
            return Status::Error;
        }
        users.insert(name.to_string(), record);
        Status::Ok
    }

    /// Apply a `Login` entry: validate the password and mark `uuid` live.
    pub fn login(&self, name: &str, passwd_hash: &str, uuid: &str) -> Status {
        let users = self.users.read();
        let record = match users.get(name) {
            Some(r) => r,
            None => return Status::UnknownUser,
        };
        if record.passwd_hash != passwd_hash {
            return Status::PasswordError;
        }
        self.logged_in
            .write()
            .insert(uuid.to_string(), name.to_string());
        Status::Ok
    }

    /// Apply a `Logout` entry: invalidate `uuid`.
    pub fn logout(&self, uuid: &str) -> Status {
        if self.logged_in.write().remove(uuid).is_some() {
            Status::Ok
        } else {
            Status::UnknownUser
        }
    }

    fn persist(&self, record: &UserRecord) -> Result<()> {
        let key = format!("{}{}", TAG_USER_PREFIX, record.name);
        let value = bincode::serialize(record)?;
        self.store.put(ANONYMOUS_USER, &key, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(store: Arc<StateStore>) -> UserManager {
        let root = UserRecord::new("root", &hash_password(""));
        UserManager::new(store, root).unwrap()
    }

    #[test]
    fn test_uuid_is_deterministic() {
        assert_eq!(calc_uuid("alice"), calc_uuid("alice"));
        assert_ne!(calc_uuid("alice"), calc_uuid("bob"));
    }

    #[test]
    fn test_password_hash_format() {
        let h = hash_password("secret");
        assert_eq!(h.len(), 40);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_register_login_logout() {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let users = manager(store);

        let hash = hash_password("pw");
        assert_eq!(users.register("alice", &hash), Status::Ok);
        assert_eq!(users.register("alice", &hash), Status::UserExists);

        let uuid = calc_uuid("alice");
        assert_eq!(users.login("alice", &hash_password("wrong"), &uuid), Status::PasswordError);
        assert_eq!(users.login("nobody", &hash, &uuid), Status::UnknownUser);
        assert_eq!(users.login("alice", &hash, &uuid), Status::Ok);
        assert!(users.is_logged_in(&uuid));
        assert_eq!(users.username_from_uuid(&uuid), "alice");

        assert_eq!(users.logout(&uuid), Status::Ok);
        assert_eq!(users.logout(&uuid), Status::UnknownUser);
        assert!(!users.is_logged_in(&uuid));
    }

    #[test]
    fn test_reserved_names_rejected() {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let users = manager(store);
        assert_eq!(users.register("", "x"), Status::Error);
        assert_eq!(users.register("#TAG_evil", "x"), Status::Error);
        // "default" would alias the anonymous column family.
        assert_eq!(users.register("default", "x"), Status::Error);
        assert!(!users.is_valid_user("default"));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = Arc::new(StateStore::open(dir.path()).unwrap());
            let users = manager(store);
            assert_eq!(users.register("alice", &hash_password("pw")), Status::Ok);
        }
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let users = manager(store);
        assert!(users.is_valid_user("alice"));
        // Login state is volatile: rebuilt only by applied entries.
        assert!(!users.is_logged_in(&calc_uuid("alice")));
    }

    #[test]
    fn test_anonymous_resolution() {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let users = manager(store);
        assert_eq!(users.username_from_uuid(""), "");
        assert_eq!(users.username_from_uuid("not-a-session"), "");
    }
}
