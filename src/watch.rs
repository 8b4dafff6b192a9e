//! Watch registrations and event dispatch.
//!
//! A watch is a long-poll registration that fires once on the next relevant
//! change of its key. Registrations are indexed by event key (for dispatch on
//! apply) and by session id (for cleanup on session expiry). Each
//! registration owns a oneshot completion handle, consumed exactly once on
//! fire or cancel, so a stale completion cannot reach a client twice.
//!
//! Event keys are `user::key` (see [`crate::types::bind_key_and_user`]); the
//! responses sent to clients carry the bare keys.

use crate::api::WatchResponse;
use crate::types::key_from_event;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;

/// A pending watch completion.
pub struct WatchHandle {
    sender: oneshot::Sender<WatchResponse>,
}

impl WatchHandle {
    pub fn new(sender: oneshot::Sender<WatchResponse>) -> Self {
        Self { sender }
    }

    /// Fire the watch with a state-change event.
    pub fn fire(self, watch_key: &str, key: &str, value: &str, deleted: bool) {
        let _ = self.sender.send(WatchResponse {
            success: true,
            watch_key: key_from_event(watch_key).to_string(),
            key: key_from_event(key).to_string(),
            value: value.to_string(),
            deleted,
            canceled: false,
            leader_id: String::new(),
            uuid_expired: false,
        });
    }

    /// Complete the watch as canceled (session expiry or displacement).
    pub fn cancel(self) {
        let _ = self.sender.send(WatchResponse {
            success: false,
            watch_key: String::new(),
            key: String::new(),
            value: String::new(),
            deleted: false,
            canceled: true,
            leader_id: String::new(),
            uuid_expired: false,
        });
    }

    /// Complete the watch because this replica stopped being the leader.
    pub fn fail_role_change(self) {
        let _ = self.sender.send(WatchResponse {
            success: false,
            watch_key: String::new(),
            key: String::new(),
            value: String::new(),
            deleted: false,
            canceled: false,
            leader_id: String::new(),
            uuid_expired: false,
        });
    }
}

/// Watch registrations indexed by event key and by session.
#[derive(Default)]
pub struct WatchTable {
    by_key: HashMap<String, HashMap<String, WatchHandle>>,
    by_session: HashMap<String, HashSet<String>>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watch for `(event_key, session_id)`, displacing any previous
    /// registration for the pair. The displaced handle, if any, is returned so
    /// the caller can complete it as canceled.
    pub fn register(
        &mut self,
        event_key: &str,
        session_id: &str,
        handle: WatchHandle,
    ) -> Option<WatchHandle> {
        let displaced = self
            .by_key
            .get_mut(event_key)
            .and_then(|m| m.remove(session_id));
        self.by_key
            .entry(event_key.to_string())
            .or_default()
            .insert(session_id.to_string(), handle);
        self.by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(event_key.to_string());
        displaced
    }

    /// Atomically remove every registration on `event_key`, returning the
    /// handles to fire.
    pub fn drain_key(&mut self, event_key: &str) -> Vec<WatchHandle> {
        let Some(watchers) = self.by_key.remove(event_key) else {
            return Vec::new();
        };
        let mut handles = Vec::with_capacity(watchers.len());
        for (session_id, handle) in watchers {
            if let Some(keys) = self.by_session.get_mut(&session_id) {
                keys.remove(event_key);
                if keys.is_empty() {
                    self.by_session.remove(&session_id);
                }
            }
            handles.push(handle);
        }
        handles
    }

    /// Remove the single registration for `(event_key, session_id)`, if any.
    pub fn remove(&mut self, event_key: &str, session_id: &str) -> Option<WatchHandle> {
        let handle = self.by_key.get_mut(event_key)?.remove(session_id);
        if handle.is_some() {
            if self.by_key.get(event_key).is_some_and(|m| m.is_empty()) {
                self.by_key.remove(event_key);
            }
            if let Some(keys) = self.by_session.get_mut(session_id) {
                keys.remove(event_key);
                if keys.is_empty() {
                    self.by_session.remove(session_id);
                }
            }
        }
        handle
    }

    /// Remove every registration owned by a session (expiry path).
    pub fn drain_session(&mut self, session_id: &str) -> Vec<WatchHandle> {
        let Some(keys) = self.by_session.remove(session_id) else {
            return Vec::new();
        };
        let mut handles = Vec::new();
        for event_key in keys {
            if let Some(watchers) = self.by_key.get_mut(&event_key) {
                if let Some(handle) = watchers.remove(session_id) {
                    handles.push(handle);
                }
                if watchers.is_empty() {
                    self.by_key.remove(&event_key);
                }
            }
        }
        handles
    }

    /// Remove every registration (forced role change).
    pub fn drain_all(&mut self) -> Vec<WatchHandle> {
        self.by_session.clear();
        self.by_key
            .drain()
            .flat_map(|(_, watchers)| watchers.into_values())
            .collect()
    }

    pub fn has_watcher(&self, event_key: &str) -> bool {
        self.by_key.get(event_key).is_some_and(|m| !m.is_empty())
    }
}
