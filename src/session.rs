//! Client sessions and the lock-ownership index.
//!
//! A session is a client-chosen identity with a liveness deadline, refreshed
//! by `KeepAlive`. The table is indexed both by session id and by deadline so
//! the expiry sweep can pop everything past due without scanning. Lock
//! ownership is tracked separately (its own mutex in the replica) as a
//! session → keys index used when a session dies.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

/// A live client session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    /// Uuid of the logged-in user, empty for anonymous sessions.
    pub uuid: String,
    pub deadline: Instant,
}

/// Session table with a hash index by id and an ordered index by deadline.
#[derive(Default)]
pub struct SessionTable {
    by_id: HashMap<String, Session>,
    by_deadline: BTreeMap<(Instant, String), ()>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session record. Replacement re-indexes the
    /// deadline.
    pub fn upsert(&mut self, session: Session) {
        if let Some(old) = self.by_id.remove(&session.session_id) {
            self.by_deadline.remove(&(old.deadline, old.session_id));
        }
        self.by_deadline
            .insert((session.deadline, session.session_id.clone()), ());
        self.by_id.insert(session.session_id.clone(), session);
    }

    /// True while the session's deadline has not passed.
    pub fn contains(&self, session_id: &str) -> bool {
        self.by_id.contains_key(session_id)
    }

    /// Remove and return every session whose deadline is at or before `now`.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<Session> {
        let mut expired = Vec::new();
        while let Some((&(deadline, ref id), _)) = self.by_deadline.iter().next() {
            if deadline > now {
                break;
            }
            let id = id.clone();
            self.by_deadline.remove(&(deadline, id.clone()));
            if let Some(session) = self.by_id.remove(&id) {
                expired.push(session);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Lock ownership: which keys each session currently holds.
#[derive(Default)]
pub struct SessionLocks {
    locks: HashMap<String, BTreeSet<String>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more lock held by a session (on `Lock` apply).
    pub fn add(&mut self, session_id: &str, key: &str) {
        self.locks
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Replace the full lock set reported by a `KeepAlive`.
    pub fn replace(&mut self, session_id: &str, keys: impl IntoIterator<Item = String>) {
        let entry = self.locks.entry(session_id.to_string()).or_default();
        entry.clear();
        entry.extend(keys);
    }

    /// Remove and return the keys held by a dying session.
    pub fn take(&mut self, session_id: &str) -> BTreeSet<String> {
        self.locks.remove(session_id).unwrap_or_default()
    }

    pub fn keys_of(&self, session_id: &str) -> Option<&BTreeSet<String>> {
        self.locks.get(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session(id: &str, deadline: Instant) -> Session {
        Session {
            session_id: id.to_string(),
            uuid: String::new(),
            deadline,
        }
    }

    #[test]
    fn test_expiry_order() {
        let now = Instant::now();
        let mut table = SessionTable::new();
        table.upsert(session("late", now + Duration::from_secs(10)));
        table.upsert(session("soon", now + Duration::from_secs(1)));
        table.upsert(session("dead", now - Duration::from_secs(1)));

        let expired = table.remove_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, "dead");
        assert!(table.contains("soon"));
        assert!(table.contains("late"));

        let expired = table.remove_expired(now + Duration::from_secs(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, "soon");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_keepalive_replaces_deadline() {
        let now = Instant::now();
        let mut table = SessionTable::new();
        table.upsert(session("s", now + Duration::from_millis(10)));
        // The refresh pushes the deadline out; the stale index entry must go.
        table.upsert(session("s", now + Duration::from_secs(60)));

        assert!(table.remove_expired(now + Duration::from_secs(1)).is_empty());
        assert!(table.contains("s"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lock_index() {
        let mut locks = SessionLocks::new();
        locks.add("s", "/lock/a");
        locks.add("s", "/lock/b");
        locks.replace("s", vec!["/lock/c".to_string()]);
        assert_eq!(locks.keys_of("s").unwrap().len(), 1);

        let taken = locks.take("s");
        assert!(taken.contains("/lock/c"));
        assert!(locks.keys_of("s").is_none());
        assert!(locks.take("s").is_empty());
    }
}
