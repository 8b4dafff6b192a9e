//! State store adapter: per-user sorted namespaces over RocksDB.
//!
//! Each user gets a column family named after their username; the anonymous
//! namespace maps to the default column family and additionally holds the
//! replica-local reserved keys (the `last_applied` marker and the durable
//! user records). The literal family name `default` is therefore reserved:
//! registration refuses it (see [`is_reserved_namespace`]) so no account can
//! alias the anonymous namespace. Every stored value is a one-byte [`LogOp`]
//! tag followed by the payload, so readers can classify lock values without
//! a second lookup.

use crate::error::{KeystoneError, Result};
use crate::types::LogOp;
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};
use std::collections::HashSet;
use std::path::Path;

/// The anonymous user namespace (no login).
pub const ANONYMOUS_USER: &str = "";

/// Reserved key holding the highest applied slot index.
pub const TAG_LAST_APPLIED: &str = "#TAG_LAST_APPLIED_INDEX#";

/// Reserved key prefix for durable user records.
pub const TAG_USER_PREFIX: &str = "#TAG_USER#";

/// Every reserved key starts with this prefix; scans skip them.
pub const RESERVED_PREFIX: &str = "#TAG_";

const DEFAULT_CF: &str = "default";

type Db = DBWithThreadMode<MultiThreaded>;

/// Per-user sorted key/value store.
pub struct StateStore {
    db: Db,
    // Names of column families known to exist, so namespace checks don't hit
    // rocksdb on every call.
    families: Mutex<HashSet<String>>,
}

fn cf_name(user: &str) -> &str {
    if user.is_empty() {
        DEFAULT_CF
    } else {
        user
    }
}

impl StateStore {
    /// Open (or create) the store at `path`, reattaching every column family
    /// present on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let existing = Db::list_cf(&opts, &path).unwrap_or_else(|_| vec![DEFAULT_CF.to_string()]);
        let db = Db::open_cf(&opts, &path, &existing)?;
        let families = existing.into_iter().collect();

        Ok(Self {
            db,
            families: Mutex::new(families),
        })
    }

    fn cf(&self, user: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>> {
        let name = cf_name(user);
        self.db
            .cf_handle(name)
            .ok_or_else(|| KeystoneError::UnknownUser(user.to_string()))
    }

    /// Point lookup. `Ok(None)` means the key is absent; an unknown user
    /// namespace is an error so callers can open it and retry.
    pub fn get(&self, user: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(user)?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?)
    }

    pub fn put(&self, user: &str, key: &str, value: &[u8]) -> Result<()> {
        let cf = self.cf(user)?;
        self.db.put_cf(&cf, key.as_bytes(), value)?;
        Ok(())
    }

    pub fn delete(&self, user: &str, key: &str) -> Result<()> {
        let cf = self.cf(user)?;
        self.db.delete_cf(&cf, key.as_bytes())?;
        Ok(())
    }

    /// Lazily create a user namespace. Returns true when the namespace exists
    /// after the call.
    pub fn open_database(&self, user: &str) -> bool {
        let name = cf_name(user);
        {
            let families = self.families.lock();
            if families.contains(name) {
                return true;
            }
        }
        let opts = Options::default();
        match self.db.create_cf(name, &opts) {
            Ok(()) => {
                self.families.lock().insert(name.to_string());
                true
            }
            Err(e) => {
                // Another caller may have raced the creation.
                if self.db.cf_handle(name).is_some() {
                    self.families.lock().insert(name.to_string());
                    true
                } else {
                    tracing::error!(user, error = %e, "failed to open user namespace");
                    false
                }
            }
        }
    }

    /// Ordered iteration over a user namespace starting at `start`.
    pub fn scan_from<'a>(
        &'a self,
        user: &str,
        start: &str,
    ) -> Result<impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>)>> + 'a> {
        let cf = self.cf(user)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(start.as_bytes(), Direction::Forward));
        Ok(iter.map(|item| item.map_err(KeystoneError::from)))
    }

    /// Read the persisted `last_applied` marker, if any.
    pub fn read_last_applied(&self) -> Result<Option<i64>> {
        match self.get(ANONYMOUS_USER, TAG_LAST_APPLIED)? {
            Some(raw) => {
                let text = String::from_utf8_lossy(&raw);
                text.parse::<i64>()
                    .map(Some)
                    .map_err(|_| KeystoneError::Storage(format!("bad last_applied marker: {}", text)))
            }
            None => Ok(None),
        }
    }

    /// Persist the `last_applied` marker. Written as part of every apply step.
    pub fn write_last_applied(&self, index: i64) -> Result<()> {
        self.put(ANONYMOUS_USER, TAG_LAST_APPLIED, index.to_string().as_bytes())
    }
}

/// Encode a store value: one-byte op tag followed by the payload.
pub fn encode_value(op: LogOp, payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(op.as_u8());
    out.extend_from_slice(payload.as_bytes());
    out
}

/// Decode a store value into its op tag and payload.
pub fn decode_value(raw: &[u8]) -> Option<(LogOp, String)> {
    let (tag, rest) = raw.split_first()?;
    let op = LogOp::from_u8(*tag)?;
    Some((op, String::from_utf8_lossy(rest).into_owned()))
}

/// True for keys in the replica-reserved range that scans must not expose.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// True for usernames that would alias the anonymous column family.
pub fn is_reserved_namespace(user: &str) -> bool {
    user == DEFAULT_CF
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_value_tagging() {
        let raw = encode_value(LogOp::Put, "hello");
        let (op, payload) = decode_value(&raw).unwrap();
        assert_eq!(op, LogOp::Put);
        assert_eq!(payload, "hello");

        // Empty payload still decodes.
        let raw = encode_value(LogOp::Lock, "");
        assert_eq!(decode_value(&raw).unwrap(), (LogOp::Lock, String::new()));

        assert!(decode_value(&[]).is_none());
        assert!(decode_value(&[42]).is_none());
    }

    #[test]
    fn test_anonymous_namespace() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        store.put(ANONYMOUS_USER, "/k", b"v").unwrap();
        assert_eq!(store.get(ANONYMOUS_USER, "/k").unwrap().unwrap(), b"v");
        store.delete(ANONYMOUS_USER, "/k").unwrap();
        assert!(store.get(ANONYMOUS_USER, "/k").unwrap().is_none());

        // The backing family name is reserved; real usernames are not.
        assert!(is_reserved_namespace("default"));
        assert!(!is_reserved_namespace("alice"));
    }

    #[test]
    fn test_unknown_user_then_open() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        assert!(matches!(
            store.get("u-1", "/k"),
            Err(KeystoneError::UnknownUser(_))
        ));
        assert!(store.open_database("u-1"));
        store.put("u-1", "/k", b"v").unwrap();
        assert_eq!(store.get("u-1", "/k").unwrap().unwrap(), b"v");
        // Namespaces are isolated.
        assert!(store.get(ANONYMOUS_USER, "/k").unwrap().is_none());
    }

    #[test]
    fn test_namespaces_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            assert!(store.open_database("u-1"));
            store.put("u-1", "/k", b"v").unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.get("u-1", "/k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_scan_is_ordered() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        for key in ["/b", "/a", "/c"] {
            store.put(ANONYMOUS_USER, key, b"x").unwrap();
        }
        let keys: Vec<String> = store
            .scan_from(ANONYMOUS_USER, "/")
            .unwrap()
            .map(|item| String::from_utf8_lossy(&item.unwrap().0).into_owned())
            .collect();
        assert_eq!(keys, vec!["/a", "/b", "/c"]);

        // Seek starts mid-range.
        let keys: Vec<String> = store
            .scan_from(ANONYMOUS_USER, "/b")
            .unwrap()
            .map(|item| String::from_utf8_lossy(&item.unwrap().0).into_owned())
            .collect();
        assert_eq!(keys, vec!["/b", "/c"]);
    }

    #[test]
    fn test_last_applied_marker() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        assert_eq!(store.read_last_applied().unwrap(), None);
        store.write_last_applied(42).unwrap();
        assert_eq!(store.read_last_applied().unwrap(), Some(42));
        assert!(is_reserved_key(TAG_LAST_APPLIED));
    }
}
