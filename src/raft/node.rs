//! The replica: role machine, election, log replication, apply loop, and the
//! leader-serialized client operations.
//!
//! Concurrency model: one primary mutex guards role/term/commit state and the
//! client-ack table ([`ReplicaState`]); finer mutexes guard the session,
//! lock-ownership and watch tables. The binlog, meta column, state store and
//! user table are internally thread-safe. The apply loop and the per-follower
//! replicators sleep on `Notify` wakeups. No lock is held across an RPC
//! await, and every RPC completion re-checks role and term before acting.

use crate::api::{
    DelRequest, DelResponse, GetRequest, GetResponse, KeepAliveRequest, KeepAliveResponse,
    LockRequest, LockResponse, LoginRequest, LoginResponse, LogoutRequest, LogoutResponse,
    PutRequest, PutResponse, RegisterRequest, RegisterResponse, ScanItem, ScanRequest,
    ScanResponse, UnLockRequest, UnLockResponse, WatchRequest, WatchResponse,
};
use crate::config::KeystoneConfig;
use crate::error::{KeystoneError, Result, Status};
use crate::perf::{PerfCounters, PerfOp};
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, CleanBinlogRequest, CleanBinlogResponse,
    ClusterRpc, RpcStatRequest, RpcStatResponse, ShowStatusRequest, ShowStatusResponse, StatInfo,
    VoteRequest, VoteResponse,
};
use crate::raft::state::{AckKind, ReplicaState};
use crate::raft::{BinLog, BinLogOptions, Meta};
use crate::session::{Session, SessionLocks, SessionTable};
use crate::store::{self, StateStore};
use crate::types::{bind_key_and_user, parent_key, LogEntry, LogOp, NodeRole, SlotIndex, Term};
use crate::user::{hash_password, UserManager, UserRecord};
use crate::watch::{WatchHandle, WatchTable};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

/// Framed-response budget for a single scan reply.
const MAX_SCAN_BYTES: usize = 26 << 20;

/// Session sweep period.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Retry delay for a parent-key watch event with no watcher yet.
const WATCH_PARENT_RETRY: Duration = Duration::from_secs(2);

/// Replicator wait granularity, so workers notice role changes.
const REPLICATION_WAIT: Duration = Duration::from_secs(2);

/// Per-call timeout for the linearizable-read heartbeat round.
const READ_QUORUM_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// A Keystone replica.
pub struct Replica {
    config: KeystoneConfig,
    meta: Meta,
    binlog: BinLog,
    store: Arc<StateStore>,
    users: UserManager,
    rpc: Arc<dyn ClusterRpc>,
    state: Mutex<ReplicaState>,
    sessions: Mutex<SessionTable>,
    session_locks: Mutex<SessionLocks>,
    watches: Mutex<WatchTable>,
    commit_notify: Notify,
    repl_notify: Notify,
    shutdown_notify: Notify,
    perf: PerfCounters,
    started_at: Instant,
    /// When the last successful read-quorum round completed.
    quorum_read_at: Mutex<Option<Instant>>,
}

impl Replica {
    /// Open the durable state and build a replica. Call [`Replica::start`] to
    /// launch the background tasks.
    pub fn open(config: KeystoneConfig, rpc: Arc<dyn ClusterRpc>) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(config.meta_dir())?;
        std::fs::create_dir_all(config.binlog_dir())?;
        std::fs::create_dir_all(config.store_dir())?;

        let meta = Meta::open(config.meta_dir())?;
        let current_term = meta.read_current_term()?;
        let voted_for = meta.read_voted_for()?;
        let root = match meta.read_root_user()? {
            Some(record) => record,
            None => {
                let record = UserRecord::new("root", &hash_password(""));
                meta.write_root_user(&record)?;
                record
            }
        };

        let binlog = BinLog::open(
            config.binlog_dir(),
            BinLogOptions {
                compress: config.binlog_compress,
                block_size: config.binlog_block_size,
                write_buffer_size: config.binlog_write_buffer_size,
            },
        )?;
        let store = Arc::new(StateStore::open(config.store_dir())?);
        let users = UserManager::new(Arc::clone(&store), root)?;
        let last_applied = store.read_last_applied()?.unwrap_or(-1);

        for member in &config.cluster_members {
            if *member == config.server_id {
                info!(member = %member, "cluster member [self]");
            } else {
                info!(member = %member, "cluster member");
            }
        }
        info!(
            term = current_term,
            last_applied,
            log_length = binlog.length(),
            "replica opened"
        );

        Ok(Arc::new(Self {
            config,
            meta,
            binlog,
            store,
            users,
            rpc,
            state: Mutex::new(ReplicaState::new(current_term, voted_for, last_applied)),
            sessions: Mutex::new(SessionTable::new()),
            session_locks: Mutex::new(SessionLocks::new()),
            watches: Mutex::new(WatchTable::new()),
            commit_notify: Notify::new(),
            repl_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            perf: PerfCounters::new(),
            started_at: Instant::now(),
            quorum_read_at: Mutex::new(None),
        }))
    }

    /// Launch the election timer, apply loop, session sweep and GC tasks.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(self).election_timer_loop());
        tokio::spawn(Arc::clone(self).apply_loop());
        tokio::spawn(Arc::clone(self).session_sweep_loop());
        tokio::spawn(Arc::clone(self).gc_loop());
    }

    /// Stop background tasks. Pending client calls fail out.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        for (_, ack) in state.client_acks.drain() {
            ack.fail();
        }
        drop(state);
        self.commit_notify.notify_one();
        self.commit_notify.notify_waiters();
        self.repl_notify.notify_waiters();
        self.shutdown_notify.notify_waiters();
        for handle in self.watches.lock().drain_all() {
            handle.fail_role_change();
        }
    }

    /// Sleep that ends early on shutdown. Returns false when stopping.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown_notify.notified() => false,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn config(&self) -> &KeystoneConfig {
        &self.config
    }

    fn fatal(&self, context: &str, err: &KeystoneError) -> ! {
        tracing::error!(error = %err, "{}: unrecoverable, aborting replica", context);
        std::process::abort();
    }

    fn persist_term(&self, state: &ReplicaState) {
        if let Err(e) = self.meta.write_current_term(state.current_term) {
            self.fatal("persist current term", &e);
        }
    }

    fn persist_vote(&self, term: Term, candidate: &str) {
        if let Err(e) = self.meta.write_voted_for(term, candidate) {
            self.fatal("persist vote", &e);
        }
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    fn trans_to_follower(&self, state: &mut ReplicaState, new_term: Term, why: &str) {
        info!(
            why,
            old_term = state.current_term,
            new_term,
            "my term is outdated, trans to follower"
        );
        let was_leader = state.role.is_leader();
        state.role = NodeRole::Follower;
        state.current_term = new_term;
        self.persist_term(state);
        // In-flight writes are dropped on step-down.
        for (_, ack) in state.client_acks.drain() {
            ack.fail();
        }
        if was_leader {
            for handle in self.watches.lock().drain_all() {
                handle.fail_role_change();
            }
        }
    }

    fn trans_to_leader(self: &Arc<Self>, state: &mut ReplicaState) {
        state.in_safe_mode = true;
        state.role = NodeRole::Leader;
        state.current_leader = Some(self.config.server_id.clone());
        info!(term = state.current_term, "I win the election");

        tokio::spawn(Arc::clone(self).heartbeat_loop(state.current_term));

        for follower in self.config.peers() {
            if state.replicating.contains(&follower) {
                debug!(follower = %follower, "replication worker already running");
                continue;
            }
            state.next_index.insert(follower.clone(), self.binlog.length());
            state.match_index.insert(follower.clone(), -1);
            state.replicating.insert(follower.clone());
            tokio::spawn(Arc::clone(self).replicate_loop(follower));
        }

        // The per-term no-op: committing it proves this leader's log is
        // current and releases safe mode.
        let entry = LogEntry {
            op: LogOp::Nop,
            user: String::new(),
            key: "Ping".to_string(),
            value: String::new(),
            term: state.current_term,
        };
        if let Err(e) = self.binlog.append(&entry) {
            self.fatal("append no-op", &e);
        }
        self.repl_notify.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Election
    // ------------------------------------------------------------------

    async fn election_timer_loop(self: Arc<Self>) {
        loop {
            let span = {
                let mut rng = rand::thread_rng();
                rng.gen_range(self.config.elect_timeout_min..=self.config.elect_timeout_max)
            };
            if !self.sleep_or_shutdown(Duration::from_millis(span)).await {
                return;
            }
            if !self.election_tick() {
                return;
            }
        }
    }

    /// One firing of the election timer. Returns false to disarm it.
    fn election_tick(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return false;
        }
        if self.config.single_node() {
            state.role = NodeRole::Leader;
            state.current_leader = Some(self.config.server_id.clone());
            state.in_safe_mode = false;
            state.commit_index = state.commit_index.max(state.last_applied);
            state.current_term += 1;
            self.persist_term(&state);
            info!(term = state.current_term, "single node mode, leading without votes");
            return false;
        }
        match state.role {
            NodeRole::Leader => true,
            NodeRole::Follower if state.heartbeat_count > 0 => {
                state.heartbeat_count = 0;
                true
            }
            _ => {
                self.start_election(&mut state);
                true
            }
        }
    }

    fn start_election(self: &Arc<Self>, state: &mut ReplicaState) {
        state.current_term += 1;
        self.persist_term(state);
        state.role = NodeRole::Candidate;
        let term = state.current_term;
        state
            .voted_for
            .insert(term, self.config.server_id.clone());
        self.persist_vote(term, &self.config.server_id);
        *state.vote_grants.entry(term).or_insert(0) += 1;

        let (last_log_index, last_log_term) = self.binlog.last_index_and_term();
        info!(term, "broadcast vote request to cluster");

        for peer in self.config.peers() {
            let this = Arc::clone(self);
            let request = VoteRequest {
                term,
                candidate_id: self.config.server_id.clone(),
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move {
                match this.rpc.vote(&peer, request).await {
                    Ok(response) => this.on_vote_reply(response),
                    Err(e) => debug!(peer = %peer, error = %e, "vote request failed"),
                }
            });
        }
    }

    fn on_vote_reply(self: &Arc<Self>, response: VoteResponse) {
        let mut state = self.state.lock();
        if state.stopped || !state.role.is_candidate() {
            return;
        }
        if response.vote_granted && response.term == state.current_term {
            let term = state.current_term;
            let grants = state.vote_grants.entry(term).or_insert(0);
            *grants += 1;
            if *grants * 2 > self.config.cluster_members.len() {
                self.trans_to_leader(&mut state);
            }
        } else if response.term > state.current_term {
            self.trans_to_follower(&mut state, response.term, "vote reply");
        }
    }

    /// Vote RPC handler.
    pub fn handle_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock();
        if request.term < state.current_term {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }
        // Refuse candidates whose log is behind ours, regardless of term.
        let (last_log_index, last_log_term) = self.binlog.last_index_and_term();
        if request.last_log_term < last_log_term
            || (request.last_log_term == last_log_term && request.last_log_index < last_log_index)
        {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }
        if request.term > state.current_term {
            self.trans_to_follower(&mut state, request.term, "vote request");
        }
        let term = state.current_term;
        if let Some(voted) = state.voted_for.get(&term) {
            if *voted != request.candidate_id {
                return VoteResponse {
                    term,
                    vote_granted: false,
                };
            }
        }
        state.voted_for.insert(term, request.candidate_id.clone());
        self.persist_vote(term, &request.candidate_id);
        VoteResponse {
            term,
            vote_granted: true,
        }
    }

    // ------------------------------------------------------------------
    // Log replication (follower side)
    // ------------------------------------------------------------------

    /// AppendEntries RPC handler: heartbeats and log shipping.
    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock();
        if request.term < state.current_term {
            info!(
                term = request.term,
                current = state.current_term,
                "append entries from an outdated term"
            );
            return AppendEntriesResponse {
                current_term: state.current_term,
                success: false,
                log_length: self.binlog.length(),
                is_busy: false,
            };
        }
        if request.term > state.current_term {
            state.current_term = request.term;
            self.persist_term(&state);
        }
        if !state.role.is_follower() {
            let was_leader = state.role.is_leader();
            state.role = NodeRole::Follower;
            for (_, ack) in state.client_acks.drain() {
                ack.fail();
            }
            if was_leader {
                for handle in self.watches.lock().drain_all() {
                    handle.fail_role_change();
                }
            }
        }
        state.current_leader = Some(request.leader_id.clone());
        state.heartbeat_count += 1;

        if !request.entries.is_empty() {
            if request.prev_log_index >= self.binlog.length() {
                return AppendEntriesResponse {
                    current_term: state.current_term,
                    success: false,
                    log_length: self.binlog.length(),
                    is_busy: false,
                };
            }
            if request.prev_log_index >= 0 {
                let prev_term = match self.binlog.read(request.prev_log_index) {
                    Ok(entry) => entry.term,
                    Err(e) => {
                        warn!(slot = request.prev_log_index, error = %e, "previous slot unreadable");
                        return AppendEntriesResponse {
                            current_term: state.current_term,
                            success: false,
                            log_length: self.binlog.length(),
                            is_busy: false,
                        };
                    }
                };
                if prev_term != request.prev_log_term {
                    // Divergent history: drop our conflicting suffix and make
                    // the leader back off one more slot.
                    if let Err(e) = self.binlog.truncate(request.prev_log_index - 1) {
                        self.fatal("truncate conflicting suffix", &e);
                    }
                    info!(
                        prev_term,
                        leader_prev_term = request.prev_log_term,
                        "previous entry term mismatch, truncated"
                    );
                    return AppendEntriesResponse {
                        current_term: state.current_term,
                        success: false,
                        log_length: self.binlog.length(),
                        is_busy: false,
                    };
                }
            }
            if state.commit_index - state.last_applied > self.config.max_commit_pending {
                return AppendEntriesResponse {
                    current_term: state.current_term,
                    success: false,
                    log_length: self.binlog.length(),
                    is_busy: true,
                };
            }
            if self.binlog.length() > request.prev_log_index + 1 {
                let old_length = self.binlog.length();
                if let Err(e) = self.binlog.truncate(request.prev_log_index) {
                    self.fatal("truncate divergent suffix", &e);
                }
                info!(old_length, new_length = self.binlog.length(), "log length alignment");
            }
            if let Err(e) = self.binlog.append_batch(&request.entries) {
                self.fatal("append replicated batch", &e);
            }
        }

        let old_commit_index = state.commit_index;
        state.commit_index = (self.binlog.length() - 1).min(request.leader_commit_index);
        if state.commit_index > old_commit_index {
            self.commit_notify.notify_one();
        }
        AppendEntriesResponse {
            current_term: state.current_term,
            success: true,
            log_length: self.binlog.length(),
            is_busy: false,
        }
    }

    // ------------------------------------------------------------------
    // Log replication (leader side)
    // ------------------------------------------------------------------

    async fn heartbeat_loop(self: Arc<Self>, term: Term) {
        loop {
            let commit_index = {
                let state = self.state.lock();
                if state.stopped || !state.role.is_leader() || state.current_term != term {
                    return;
                }
                state.commit_index
            };
            for peer in self.config.peers() {
                let this = Arc::clone(&self);
                let request = AppendEntriesRequest {
                    term,
                    leader_id: self.config.server_id.clone(),
                    prev_log_index: -1,
                    prev_log_term: -1,
                    entries: Vec::new(),
                    leader_commit_index: commit_index,
                };
                tokio::spawn(async move {
                    if let Ok(response) = this.rpc.append_entries(&peer, request).await {
                        if response.current_term > term {
                            let mut state = this.state.lock();
                            if state.role.is_leader() && response.current_term > state.current_term
                            {
                                this.trans_to_follower(
                                    &mut state,
                                    response.current_term,
                                    "heartbeat reply",
                                );
                            }
                        }
                    }
                });
            }
            if !self
                .sleep_or_shutdown(Duration::from_millis(self.config.heartbeat_interval))
                .await
            {
                return;
            }
        }
    }

    /// Dedicated log-shipping worker for one follower; runs while this node
    /// leads.
    async fn replicate_loop(self: Arc<Self>, follower: String) {
        let mut latest_replicating_ok = true;
        'work: loop {
            // Wait for new entries, with a timed wait so role changes are
            // noticed even without traffic.
            loop {
                {
                    let state = self.state.lock();
                    if state.stopped || !state.role.is_leader() {
                        break 'work;
                    }
                    let next = state.next_index.get(&follower).copied().unwrap_or(0);
                    if self.binlog.length() > next {
                        break;
                    }
                }
                let _ = tokio::time::timeout(REPLICATION_WAIT, self.repl_notify.notified()).await;
            }

            let (term, index, commit_index) = {
                let state = self.state.lock();
                if state.stopped || !state.role.is_leader() {
                    break 'work;
                }
                (
                    state.current_term,
                    state.next_index.get(&follower).copied().unwrap_or(0),
                    state.commit_index,
                )
            };
            let prev_index = index - 1;
            let prev_term = if prev_index >= 0 {
                match self.binlog.read(prev_index) {
                    Ok(entry) => entry.term,
                    Err(e) => {
                        tracing::error!(slot = prev_index, follower = %follower, error = %e,
                            "bad slot, cannot replicate");
                        break 'work;
                    }
                }
            } else {
                -1
            };

            let mut batch_span = (self.binlog.length() - index).min(self.config.log_rep_batch_max);
            if !latest_replicating_ok {
                // Shrink to one entry right after a failure so next_index
                // converges quickly.
                batch_span = batch_span.min(1);
            }
            let mut entries = Vec::with_capacity(batch_span as usize);
            let mut max_term = -1;
            let mut bad_slot = false;
            for slot in index..index + batch_span {
                match self.binlog.read(slot) {
                    Ok(entry) => {
                        max_term = max_term.max(entry.term);
                        entries.push(entry);
                    }
                    Err(e) => {
                        tracing::error!(slot, follower = %follower, error = %e,
                            "bad slot, cannot replicate");
                        bad_slot = true;
                        break;
                    }
                }
            }
            if bad_slot {
                break 'work;
            }
            let batch_span = entries.len() as SlotIndex;

            let request = AppendEntriesRequest {
                term,
                leader_id: self.config.server_id.clone(),
                prev_log_index: prev_index,
                prev_log_term: prev_term,
                entries,
                leader_commit_index: commit_index,
            };
            let result = self.rpc.append_entries(&follower, request).await;

            let mut state = self.state.lock();
            if state.stopped || !state.role.is_leader() {
                break 'work;
            }
            match result {
                Ok(response) => {
                    if response.current_term > state.current_term {
                        self.trans_to_follower(&mut state, response.current_term, "replicate reply");
                        break 'work;
                    }
                    if response.success {
                        state.next_index.insert(follower.clone(), index + batch_span);
                        state
                            .match_index
                            .insert(follower.clone(), index + batch_span - 1);
                        if max_term == state.current_term {
                            self.update_commit_index(&mut state, index + batch_span - 1);
                        }
                        latest_replicating_ok = true;
                    } else if response.is_busy {
                        drop(state);
                        debug!(follower = %follower, "follower busy, delaying replication");
                        tokio::time::sleep(Duration::from_millis(
                            self.config.replication_retry_timespan,
                        ))
                        .await;
                        latest_replicating_ok = true;
                    } else {
                        // Prefix mismatch: back off, clamped by the
                        // follower's reported log length.
                        let next = state.next_index.get(&follower).copied().unwrap_or(0);
                        let adjusted = (next - 1).min(response.log_length).max(0);
                        state.next_index.insert(follower.clone(), adjusted);
                        info!(follower = %follower, next_index = adjusted, "adjust next_index");
                    }
                }
                Err(e) => {
                    drop(state);
                    warn!(follower = %follower, error = %e, "replicate rpc failed");
                    tokio::time::sleep(Duration::from_millis(
                        self.config.replication_retry_timespan,
                    ))
                    .await;
                    latest_replicating_ok = false;
                }
            }
        }
        self.state.lock().replicating.remove(&follower);
    }

    /// Advance the commit index to `n` if a majority holds it. Only called
    /// when the entry at `n` carries the current term.
    fn update_commit_index(&self, state: &mut ReplicaState, n: SlotIndex) {
        let count = state.replicated_count(n);
        if count * 2 > self.config.cluster_members.len() && n > state.commit_index {
            state.commit_index = n;
            debug!(commit_index = n, "update to new commit index");
            self.commit_notify.notify_one();
        }
    }

    // ------------------------------------------------------------------
    // Apply loop
    // ------------------------------------------------------------------

    async fn apply_loop(self: Arc<Self>) {
        loop {
            loop {
                {
                    let state = self.state.lock();
                    if state.stopped {
                        return;
                    }
                    if state.commit_index > state.last_applied {
                        break;
                    }
                }
                self.commit_notify.notified().await;
            }
            let (from, to) = {
                let state = self.state.lock();
                (state.last_applied, state.commit_index)
            };
            let mut nop_committed = false;
            for slot in (from + 1)..=to {
                let entry = match self.binlog.read(slot) {
                    Ok(entry) => entry,
                    Err(e) => self.fatal("read committed slot", &e),
                };
                let (log_status, new_uuid, nop_of_current_term) = self.apply_entry(&entry);
                nop_committed |= nop_of_current_term;

                let mut state = self.state.lock();
                if state.role.is_leader() && nop_committed && state.in_safe_mode {
                    state.in_safe_mode = false;
                    info!("leave safe mode now");
                }
                if state.role.is_leader() {
                    if let Some(ack) = state.client_acks.remove(&slot) {
                        ack.complete(log_status, &new_uuid);
                    }
                }
                state.last_applied += 1;
                let applied = state.last_applied;
                if let Err(e) = self.store.write_last_applied(applied) {
                    self.fatal("persist last_applied", &e);
                }
            }
        }
    }

    /// Deterministic effect of one committed entry. Runs without the primary
    /// mutex; only the store, user, session-lock and watch tables are
    /// touched.
    fn apply_entry(self: &Arc<Self>, entry: &LogEntry) -> (Status, String, bool) {
        let mut log_status = Status::Error;
        let mut new_uuid = String::new();
        let mut nop_of_current_term = false;
        match entry.op {
            LogOp::Put | LogOp::Lock => {
                let value = store::encode_value(entry.op, &entry.value);
                self.apply_store_put(&entry.user, &entry.key, &value);
                if entry.op == LogOp::Lock {
                    self.touch_parent_key(&entry.user, &entry.key, &entry.value, "lock");
                    self.session_locks.lock().add(&entry.value, &entry.key);
                }
                self.trigger_event_with_parent(
                    bind_key_and_user(&entry.user, &entry.key),
                    entry.value.clone(),
                    false,
                );
            }
            LogOp::Del => {
                self.apply_store_delete(&entry.user, &entry.key);
                self.trigger_event_with_parent(
                    bind_key_and_user(&entry.user, &entry.key),
                    entry.value.clone(),
                    true,
                );
            }
            LogOp::Unlock => {
                // Delete-if: only the recorded owner's lock is removed, so a
                // stale unlock is a no-op.
                let current = match self.store.get(&entry.user, &entry.key) {
                    Ok(Some(raw)) => store::decode_value(&raw),
                    _ => None,
                };
                if let Some((LogOp::Lock, owner)) = current {
                    if owner == entry.value {
                        self.apply_store_delete(&entry.user, &entry.key);
                        info!(key = %entry.key, "unlock");
                        self.touch_parent_key(&entry.user, &entry.key, &owner, "unlock");
                        self.trigger_event_with_parent(
                            bind_key_and_user(&entry.user, &entry.key),
                            entry.value.clone(),
                            true,
                        );
                    }
                }
            }
            LogOp::Nop => {
                let state = self.state.lock();
                if entry.term == state.current_term {
                    nop_of_current_term = true;
                }
                info!(nop_term = entry.term, current_term = state.current_term, "nop applied");
            }
            LogOp::Login => {
                log_status = self.users.login(&entry.key, &entry.value, &entry.user);
                if log_status.is_ok() {
                    new_uuid = entry.user.clone();
                    self.store.open_database(&entry.key);
                }
            }
            LogOp::Logout => {
                log_status = self.users.logout(&entry.user);
            }
            LogOp::Register => {
                log_status = self.users.register(&entry.key, &entry.value);
            }
        }
        (log_status, new_uuid, nop_of_current_term)
    }

    fn apply_store_put(&self, user: &str, key: &str, value: &[u8]) {
        match self.store.put(user, key, value) {
            Ok(()) => {}
            Err(KeystoneError::UnknownUser(_)) => {
                if self.store.open_database(user) {
                    if let Err(e) = self.store.put(user, key, value) {
                        self.fatal("apply put", &e);
                    }
                } else {
                    self.fatal("apply put", &KeystoneError::UnknownUser(user.to_string()));
                }
            }
            Err(e) => self.fatal("apply put", &e),
        }
    }

    fn apply_store_delete(&self, user: &str, key: &str) {
        match self.store.delete(user, key) {
            Ok(()) => {}
            Err(KeystoneError::UnknownUser(_)) => {
                if self.store.open_database(user) {
                    if let Err(e) = self.store.delete(user, key) {
                        self.fatal("apply delete", &e);
                    }
                } else {
                    self.fatal("apply delete", &KeystoneError::UnknownUser(user.to_string()));
                }
            }
            Err(e) => self.fatal("apply delete", &e),
        }
    }

    /// Write the change marker into the parent key so parent watches fire on
    /// the next apply and new readers observe the activity.
    fn touch_parent_key(&self, user: &str, key: &str, changed_session: &str, action: &str) {
        if let Some(parent) = parent_key(key) {
            let marker = store::encode_value(LogOp::Put, &format!("{},{}", action, changed_session));
            if let Err(e) = self.store.put(user, parent, &marker) {
                debug!(parent, error = %e, "parent touch skipped");
            }
        }
    }

    // ------------------------------------------------------------------
    // Watch dispatch
    // ------------------------------------------------------------------

    /// Fire every watch on `watch_key`. Returns whether any was registered.
    fn trigger_event(&self, watch_key: &str, key: &str, value: &str, deleted: bool) -> bool {
        let handles = self.watches.lock().drain_key(watch_key);
        if handles.is_empty() {
            return false;
        }
        info!(count = handles.len(), key, "trigger watch event");
        for handle in handles {
            handle.fire(watch_key, key, value, deleted);
        }
        true
    }

    /// Fire watches on the event key and propagate to its parent. A parent
    /// with no watcher gets one delayed retry to cover the re-arm race.
    fn trigger_event_with_parent(self: &Arc<Self>, event_key: String, value: String, deleted: bool) {
        self.trigger_event(&event_key, &event_key, &value, deleted);
        if let Some(parent) = parent_key(&event_key) {
            let parent = parent.to_string();
            if !self.trigger_event(&parent, &event_key, &value, deleted) {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(WATCH_PARENT_RETRY).await;
                    this.trigger_event(&parent, &event_key, &value, deleted);
                });
            }
        }
    }

    /// Fire the single watch registered by `session_id` on `event_key`, if
    /// still pending (used for the synchronous compare at watch issue).
    fn trigger_session_key(&self, session_id: &str, event_key: &str, value: &str, deleted: bool) {
        if let Some(handle) = self.watches.lock().remove(event_key, session_id) {
            info!(key = %event_key, session = %session_id, "trigger watch event");
            handle.fire(event_key, event_key, value, deleted);
        }
    }

    fn is_expired_session(&self, session_id: &str) -> bool {
        !self.sessions.lock().contains(session_id)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    async fn session_sweep_loop(self: Arc<Self>) {
        loop {
            if !self.sleep_or_shutdown(SESSION_SWEEP_INTERVAL).await {
                return;
            }
            {
                let state = self.state.lock();
                if state.stopped {
                    return;
                }
            }
            self.remove_expired_sessions();
        }
    }

    fn remove_expired_sessions(self: &Arc<Self>) {
        let expired = self.sessions.lock().remove_expired(Instant::now());
        if expired.is_empty() {
            return;
        }
        for session in &expired {
            info!(session = %session.session_id, "remove expired session");
            for handle in self.watches.lock().drain_session(&session.session_id) {
                handle.cancel();
            }
        }

        let mut unlock_keys = Vec::new();
        {
            let mut session_locks = self.session_locks.lock();
            for session in &expired {
                for key in session_locks.take(&session.session_id) {
                    unlock_keys.push((key, session.clone()));
                }
            }
        }

        let mut state = self.state.lock();
        if !state.role.is_leader() {
            return;
        }
        let term = state.current_term;
        for (key, session) in unlock_keys {
            let entry = LogEntry {
                op: LogOp::Unlock,
                user: self.users.username_from_uuid(&session.uuid),
                key,
                value: session.session_id.clone(),
                term,
            };
            if let Err(e) = self.binlog.append(&entry) {
                self.fatal("append session unlock", &e);
            }
        }
        for session in &expired {
            if session.uuid.is_empty() {
                continue;
            }
            let entry = LogEntry {
                op: LogOp::Logout,
                user: session.uuid.clone(),
                key: String::new(),
                value: String::new(),
                term,
            };
            if let Err(e) = self.binlog.append(&entry) {
                self.fatal("append session logout", &e);
            }
        }
        self.repl_notify.notify_waiters();
        if self.config.single_node() {
            self.update_commit_index(&mut state, self.binlog.length() - 1);
        }
    }

    /// Session heartbeat. Followers only accept copies forwarded by the
    /// leader; the leader fans the refresh out so every replica can judge
    /// lock liveness locally.
    pub fn keep_alive(self: &Arc<Self>, request: KeepAliveRequest) -> KeepAliveResponse {
        self.perf.record(PerfOp::KeepAlive);
        self.trace_access("KeepAlive");
        let is_leader = {
            let state = self.state.lock();
            if state.role.is_follower() && !request.forward_from_leader {
                return KeepAliveResponse {
                    success: false,
                    leader_id: state.leader_hint(),
                };
            }
            if state.role.is_candidate() && !request.forward_from_leader {
                return KeepAliveResponse {
                    success: false,
                    leader_id: String::new(),
                };
            }
            state.role.is_leader()
        };

        let timeout_ms = request
            .timeout_milliseconds
            .unwrap_or(self.config.session_expire_timeout);
        self.sessions.lock().upsert(Session {
            session_id: request.session_id.clone(),
            uuid: request.uuid.clone(),
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
        });
        self.session_locks
            .lock()
            .replace(&request.session_id, request.locks.iter().cloned());
        debug!(session = %request.session_id, "session refreshed");

        if is_leader {
            let mut forwarded = request;
            forwarded.forward_from_leader = true;
            for peer in self.config.peers() {
                let this = Arc::clone(self);
                let forwarded = forwarded.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.rpc.keep_alive(&peer, forwarded).await {
                        debug!(peer = %peer, error = %e, "keep-alive forward failed");
                    }
                });
            }
        }
        KeepAliveResponse {
            success: true,
            leader_id: String::new(),
        }
    }

    // ------------------------------------------------------------------
    // Client data plane
    // ------------------------------------------------------------------

    pub async fn put(&self, request: PutRequest) -> PutResponse {
        self.perf.record(PerfOp::Put);
        self.trace_access("Put");
        let rx = {
            let mut state = self.state.lock();
            if state.role.is_follower() {
                return PutResponse {
                    success: false,
                    leader_id: state.leader_hint(),
                    uuid_expired: false,
                };
            }
            if state.role.is_candidate() {
                return PutResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if state.client_acks.len() > self.config.max_write_pending {
                warn!(pending = state.client_acks.len(), "write pending over limit");
                return PutResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return PutResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
            let entry = LogEntry {
                op: LogOp::Put,
                user: self.users.username_from_uuid(&request.uuid),
                key: request.key,
                value: request.value,
                term: state.current_term,
            };
            let slot = match self.binlog.append(&entry) {
                Ok(slot) => slot,
                Err(e) => self.fatal("append put", &e),
            };
            let (tx, rx) = oneshot::channel();
            state.client_acks.insert(slot, AckKind::Put(tx));
            self.repl_notify.notify_waiters();
            if self.config.single_node() {
                self.update_commit_index(&mut state, slot);
            }
            rx
        };
        rx.await.unwrap_or(PutResponse {
            success: false,
            leader_id: String::new(),
            uuid_expired: false,
        })
    }

    pub async fn del(&self, request: DelRequest) -> DelResponse {
        self.perf.record(PerfOp::Delete);
        self.trace_access("Delete");
        let rx = {
            let mut state = self.state.lock();
            if state.role.is_follower() {
                return DelResponse {
                    success: false,
                    leader_id: state.leader_hint(),
                    uuid_expired: false,
                };
            }
            if state.role.is_candidate() {
                return DelResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return DelResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
            let entry = LogEntry {
                op: LogOp::Del,
                user: self.users.username_from_uuid(&request.uuid),
                key: request.key,
                value: String::new(),
                term: state.current_term,
            };
            let slot = match self.binlog.append(&entry) {
                Ok(slot) => slot,
                Err(e) => self.fatal("append del", &e),
            };
            let (tx, rx) = oneshot::channel();
            state.client_acks.insert(slot, AckKind::Del(tx));
            self.repl_notify.notify_waiters();
            if self.config.single_node() {
                self.update_commit_index(&mut state, slot);
            }
            rx
        };
        rx.await.unwrap_or(DelResponse {
            success: false,
            leader_id: String::new(),
            uuid_expired: false,
        })
    }

    /// Linearizable read: the leader serves from local state once a heartbeat
    /// quorum has confirmed its lease within the last `elect_timeout_min` ms;
    /// otherwise it runs a fresh quorum round first.
    pub async fn get(self: &Arc<Self>, request: GetRequest) -> GetResponse {
        self.perf.record(PerfOp::Get);
        self.trace_access("Get");
        let term = {
            let state = self.state.lock();
            if state.role.is_follower() {
                return GetResponse {
                    success: false,
                    hit: false,
                    value: String::new(),
                    leader_id: state.leader_hint(),
                    uuid_expired: false,
                };
            }
            if state.role.is_candidate() {
                return GetResponse {
                    success: false,
                    hit: false,
                    value: String::new(),
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if state.in_safe_mode {
                info!("leader is still in safe mode");
                return GetResponse {
                    success: false,
                    hit: false,
                    value: String::new(),
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            state.current_term
        };
        if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
            return GetResponse {
                success: false,
                hit: false,
                value: String::new(),
                leader_id: String::new(),
                uuid_expired: true,
            };
        }

        let members = self.config.cluster_members.len();
        let lease_fresh = self
            .quorum_read_at
            .lock()
            .is_some_and(|at| at.elapsed() < Duration::from_millis(self.config.elect_timeout_min));
        if members > 1 && !lease_fresh {
            debug!("broadcast for read");
            let commit_index = self.state.lock().commit_index;
            let mut rounds = FuturesUnordered::new();
            for peer in self.config.peers() {
                let rpc = Arc::clone(&self.rpc);
                let request = AppendEntriesRequest {
                    term,
                    leader_id: self.config.server_id.clone(),
                    prev_log_index: -1,
                    prev_log_term: -1,
                    entries: Vec::new(),
                    leader_commit_index: commit_index,
                };
                rounds.push(async move {
                    tokio::time::timeout(
                        READ_QUORUM_RPC_TIMEOUT,
                        rpc.append_entries(&peer, request),
                    )
                    .await
                });
            }

            let mut succ_count = 1usize; // self
            let mut err_count = 0usize;
            let mut confirmed = false;
            while let Some(result) = rounds.next().await {
                match result {
                    Ok(Ok(response)) => {
                        if response.current_term > term {
                            let mut state = self.state.lock();
                            if state.role.is_leader() && response.current_term > state.current_term
                            {
                                self.trans_to_follower(
                                    &mut state,
                                    response.current_term,
                                    "read quorum reply",
                                );
                            }
                            return GetResponse {
                                success: false,
                                hit: false,
                                value: String::new(),
                                leader_id: String::new(),
                                uuid_expired: false,
                            };
                        }
                        succ_count += 1;
                    }
                    _ => err_count += 1,
                }
                if succ_count * 2 > members {
                    confirmed = true;
                    break;
                }
                if err_count * 2 > members {
                    break;
                }
            }
            if !confirmed {
                return GetResponse {
                    success: false,
                    hit: false,
                    value: String::new(),
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            *self.quorum_read_at.lock() = Some(Instant::now());
        }

        self.read_local(&request)
    }

    fn read_local(&self, request: &GetRequest) -> GetResponse {
        let user = self.users.username_from_uuid(&request.uuid);
        let miss = GetResponse {
            success: true,
            hit: false,
            value: String::new(),
            leader_id: String::new(),
            uuid_expired: false,
        };
        match self.store.get(&user, &request.key) {
            Ok(Some(raw)) => match store::decode_value(&raw) {
                Some((LogOp::Lock, session)) if self.is_expired_session(&session) => miss,
                Some((_, value)) => GetResponse {
                    success: true,
                    hit: true,
                    value,
                    leader_id: String::new(),
                    uuid_expired: false,
                },
                None => miss,
            },
            Ok(None) | Err(KeystoneError::UnknownUser(_)) => miss,
            Err(e) => {
                warn!(key = %request.key, error = %e, "read failed");
                miss
            }
        }
    }

    /// A lock can be granted when the key is free, its owner's session died,
    /// or the requester already owns it (re-entry). The requester's own
    /// session must be alive in every case.
    fn lock_is_available(&self, user: &str, key: &str, session_id: &str) -> bool {
        let current = match self.store.get(user, key) {
            Ok(Some(raw)) => store::decode_value(&raw),
            Ok(None) | Err(KeystoneError::UnknownUser(_)) => None,
            Err(_) => return false,
        };
        let sessions = self.sessions.lock();
        match current {
            None => sessions.contains(session_id),
            Some((LogOp::Lock, owner)) => {
                if sessions.contains(&owner) {
                    owner == session_id
                } else {
                    sessions.contains(session_id)
                }
            }
            Some(_) => false,
        }
    }

    pub async fn lock(&self, request: LockRequest) -> LockResponse {
        self.perf.record(PerfOp::Lock);
        self.trace_access("Lock");
        let rx = {
            let mut state = self.state.lock();
            if state.role.is_follower() {
                return LockResponse {
                    success: false,
                    leader_id: state.leader_hint(),
                    uuid_expired: false,
                };
            }
            if state.role.is_candidate() {
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
            if state.in_safe_mode {
                info!("leader is still in safe mode");
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            // A fresh leader must not grant locks before every pre-crash
            // session had a chance to re-register.
            if self.started_at.elapsed()
                < Duration::from_millis(self.config.session_expire_timeout)
            {
                info!("leader is still in safe mode for lock");
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            let user = self.users.username_from_uuid(&request.uuid);
            if !self.lock_is_available(&user, &request.key, &request.session_id) {
                debug!(key = %request.key, "lock is held by another session");
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            info!(key = %request.key, session = %request.session_id, "lock");
            let entry = LogEntry {
                op: LogOp::Lock,
                user,
                key: request.key,
                value: request.session_id,
                term: state.current_term,
            };
            let slot = match self.binlog.append(&entry) {
                Ok(slot) => slot,
                Err(e) => self.fatal("append lock", &e),
            };
            let (tx, rx) = oneshot::channel();
            state.client_acks.insert(slot, AckKind::Lock(tx));
            self.repl_notify.notify_waiters();
            if self.config.single_node() {
                self.update_commit_index(&mut state, slot);
            }
            rx
        };
        rx.await.unwrap_or(LockResponse {
            success: false,
            leader_id: String::new(),
            uuid_expired: false,
        })
    }

    pub async fn unlock(&self, request: UnLockRequest) -> UnLockResponse {
        self.perf.record(PerfOp::Unlock);
        self.trace_access("Unlock");
        let rx = {
            let mut state = self.state.lock();
            if state.role.is_follower() {
                return UnLockResponse {
                    success: false,
                    leader_id: state.leader_hint(),
                    uuid_expired: false,
                };
            }
            if state.role.is_candidate() {
                return UnLockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return UnLockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
            let entry = LogEntry {
                op: LogOp::Unlock,
                user: self.users.username_from_uuid(&request.uuid),
                key: request.key,
                value: request.session_id,
                term: state.current_term,
            };
            let slot = match self.binlog.append(&entry) {
                Ok(slot) => slot,
                Err(e) => self.fatal("append unlock", &e),
            };
            let (tx, rx) = oneshot::channel();
            state.client_acks.insert(slot, AckKind::Unlock(tx));
            self.repl_notify.notify_waiters();
            if self.config.single_node() {
                self.update_commit_index(&mut state, slot);
            }
            rx
        };
        rx.await.unwrap_or(UnLockResponse {
            success: false,
            leader_id: String::new(),
            uuid_expired: false,
        })
    }

    /// Leader-local range read over the caller's namespace, skipping
    /// replica-reserved keys and locks whose session died.
    pub fn scan(&self, request: ScanRequest) -> ScanResponse {
        self.perf.record(PerfOp::Scan);
        self.trace_access("Scan");
        {
            let state = self.state.lock();
            if state.role.is_follower() {
                return ScanResponse {
                    success: false,
                    items: Vec::new(),
                    has_more: false,
                    leader_id: state.leader_hint(),
                    uuid_expired: false,
                };
            }
            if state.role.is_candidate() {
                return ScanResponse {
                    success: false,
                    items: Vec::new(),
                    has_more: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return ScanResponse {
                    success: false,
                    items: Vec::new(),
                    has_more: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
            if state.in_safe_mode {
                info!("leader is still in safe mode");
                return ScanResponse {
                    success: false,
                    items: Vec::new(),
                    has_more: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if self.started_at.elapsed()
                < Duration::from_millis(self.config.session_expire_timeout)
            {
                info!("leader is still in safe mode for scan");
                return ScanResponse {
                    success: false,
                    items: Vec::new(),
                    has_more: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
        }

        let user = self.users.username_from_uuid(&request.uuid);
        let iter = match self.store.scan_from(&user, &request.start_key) {
            Ok(iter) => iter,
            Err(_) => {
                return ScanResponse {
                    success: true,
                    items: Vec::new(),
                    has_more: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
        };

        let mut items = Vec::new();
        let mut has_more = false;
        let mut framed_bytes = 0usize;
        for item in iter {
            let (key, raw) = match item {
                Ok(kv) => kv,
                Err(e) => {
                    warn!(error = %e, "scan iteration failed");
                    break;
                }
            };
            let key = String::from_utf8_lossy(&key).into_owned();
            if !request.end_key.is_empty() && key.as_str() >= request.end_key.as_str() {
                break;
            }
            if items.len() >= request.size_limit || framed_bytes > MAX_SCAN_BYTES {
                has_more = true;
                break;
            }
            if store::is_reserved_key(&key) {
                continue;
            }
            let Some((op, value)) = store::decode_value(&raw) else {
                continue;
            };
            if op == LogOp::Lock && self.is_expired_session(&value) {
                continue;
            }
            framed_bytes += key.len() + value.len();
            items.push(ScanItem { key, value });
        }

        ScanResponse {
            success: true,
            items,
            has_more,
            leader_id: String::new(),
            uuid_expired: false,
        }
    }

    /// Long-poll watch registration. Resolves when the key changes, the
    /// session dies, the registration is displaced, or leadership is lost.
    pub async fn watch(self: &Arc<Self>, request: WatchRequest) -> WatchResponse {
        self.perf.record(PerfOp::Watch);
        self.trace_access("Watch");
        {
            let state = self.state.lock();
            if state.role.is_follower() {
                return WatchResponse {
                    success: false,
                    watch_key: String::new(),
                    key: String::new(),
                    value: String::new(),
                    deleted: false,
                    canceled: false,
                    leader_id: state.leader_hint(),
                    uuid_expired: false,
                };
            }
            if state.role.is_candidate() {
                return WatchResponse {
                    success: false,
                    watch_key: String::new(),
                    key: String::new(),
                    value: String::new(),
                    deleted: false,
                    canceled: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
        }
        if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
            return WatchResponse {
                success: false,
                watch_key: String::new(),
                key: String::new(),
                value: String::new(),
                deleted: false,
                canceled: false,
                leader_id: String::new(),
                uuid_expired: true,
            };
        }

        let user = self.users.username_from_uuid(&request.uuid);
        let event_key = bind_key_and_user(&user, &request.key);
        let (tx, rx) = oneshot::channel();
        {
            let mut watches = self.watches.lock();
            if let Some(displaced) =
                watches.register(&event_key, &request.session_id, WatchHandle::new(tx))
            {
                displaced.cancel();
            }
        }

        // Compare against the client's snapshot right away: the interesting
        // change may have already been applied before registration.
        if self.started_at.elapsed() > Duration::from_millis(self.config.session_expire_timeout) {
            let stored = match self.store.get(&user, &request.key) {
                Ok(value) => value,
                Err(_) => None,
            };
            let key_exist = stored.is_some();
            let (op, value) = stored
                .as_deref()
                .and_then(store::decode_value)
                .unwrap_or((LogOp::Nop, String::new()));
            if value != request.old_value || key_exist != request.key_exist {
                info!(key = %request.key, new_value = %value, old_value = %request.old_value,
                    "watch fires immediately");
                self.trigger_session_key(&request.session_id, &event_key, &value, !key_exist);
            } else if op == LogOp::Lock && self.is_expired_session(&value) {
                info!(key = %request.key, "watched lock owner expired");
                self.trigger_session_key(&request.session_id, &event_key, "", true);
            }
        }

        rx.await.unwrap_or(WatchResponse {
            success: false,
            watch_key: String::new(),
            key: String::new(),
            value: String::new(),
            deleted: false,
            canceled: true,
            leader_id: String::new(),
            uuid_expired: false,
        })
    }

    // ------------------------------------------------------------------
    // User management
    // ------------------------------------------------------------------

    pub async fn login(&self, request: LoginRequest) -> LoginResponse {
        let rx = {
            let mut state = self.state.lock();
            if state.role.is_follower() {
                return LoginResponse {
                    status: Status::Error,
                    uuid: String::new(),
                    leader_id: state.leader_hint(),
                };
            }
            if state.role.is_candidate() {
                return LoginResponse {
                    status: Status::Error,
                    uuid: String::new(),
                    leader_id: String::new(),
                };
            }
            if !self.users.is_valid_user(&request.username) {
                return LoginResponse {
                    status: Status::UnknownUser,
                    uuid: String::new(),
                    leader_id: String::new(),
                };
            }
            let entry = LogEntry {
                op: LogOp::Login,
                user: crate::user::calc_uuid(&request.username),
                key: request.username,
                value: request.passwd,
                term: state.current_term,
            };
            let slot = match self.binlog.append(&entry) {
                Ok(slot) => slot,
                Err(e) => self.fatal("append login", &e),
            };
            let (tx, rx) = oneshot::channel();
            state.client_acks.insert(slot, AckKind::Login(tx));
            self.repl_notify.notify_waiters();
            if self.config.single_node() {
                self.update_commit_index(&mut state, slot);
            }
            rx
        };
        rx.await.unwrap_or(LoginResponse {
            status: Status::Error,
            uuid: String::new(),
            leader_id: String::new(),
        })
    }

    pub async fn logout(&self, request: LogoutRequest) -> LogoutResponse {
        let rx = {
            let mut state = self.state.lock();
            if state.role.is_follower() {
                return LogoutResponse {
                    status: Status::Error,
                    leader_id: state.leader_hint(),
                };
            }
            if state.role.is_candidate() {
                return LogoutResponse {
                    status: Status::Error,
                    leader_id: String::new(),
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return LogoutResponse {
                    status: Status::UnknownUser,
                    leader_id: String::new(),
                };
            }
            let entry = LogEntry {
                op: LogOp::Logout,
                user: request.uuid,
                key: String::new(),
                value: String::new(),
                term: state.current_term,
            };
            let slot = match self.binlog.append(&entry) {
                Ok(slot) => slot,
                Err(e) => self.fatal("append logout", &e),
            };
            let (tx, rx) = oneshot::channel();
            state.client_acks.insert(slot, AckKind::Logout(tx));
            self.repl_notify.notify_waiters();
            if self.config.single_node() {
                self.update_commit_index(&mut state, slot);
            }
            rx
        };
        rx.await.unwrap_or(LogoutResponse {
            status: Status::Error,
            leader_id: String::new(),
        })
    }

    pub async fn register(&self, request: RegisterRequest) -> RegisterResponse {
        let rx = {
            let mut state = self.state.lock();
            if state.role.is_follower() {
                return RegisterResponse {
                    status: Status::Error,
                    leader_id: state.leader_hint(),
                };
            }
            if state.role.is_candidate() {
                return RegisterResponse {
                    status: Status::Error,
                    leader_id: String::new(),
                };
            }
            let entry = LogEntry {
                op: LogOp::Register,
                user: String::new(),
                key: request.username,
                value: request.passwd,
                term: state.current_term,
            };
            let slot = match self.binlog.append(&entry) {
                Ok(slot) => slot,
                Err(e) => self.fatal("append register", &e),
            };
            let (tx, rx) = oneshot::channel();
            state.client_acks.insert(slot, AckKind::Register(tx));
            self.repl_notify.notify_waiters();
            if self.config.single_node() {
                self.update_commit_index(&mut state, slot);
            }
            rx
        };
        rx.await.unwrap_or(RegisterResponse {
            status: Status::Error,
            leader_id: String::new(),
        })
    }

    // ------------------------------------------------------------------
    // Operational surface
    // ------------------------------------------------------------------

    pub fn show_status(&self) -> ShowStatusResponse {
        let (last_log_index, last_log_term) = self.binlog.last_index_and_term();
        let state = self.state.lock();
        ShowStatusResponse {
            status: state.role,
            term: state.current_term,
            last_log_index,
            last_log_term,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
        }
    }

    /// Validate and run a prefix GC request. Refuses anything beyond what
    /// this replica has applied.
    pub fn handle_clean_binlog(&self, request: CleanBinlogRequest) -> CleanBinlogResponse {
        {
            let state = self.state.lock();
            if state.last_applied < request.end_index {
                warn!(
                    end_index = request.end_index,
                    last_applied = state.last_applied,
                    "refusing unsafe binlog clean"
                );
                return CleanBinlogResponse { success: false };
            }
        }
        info!(end_index = request.end_index, "delete binlog prefix");
        match self.binlog.remove_prefix(request.end_index) {
            Ok(()) => CleanBinlogResponse { success: true },
            Err(e) => {
                warn!(error = %e, "binlog clean failed");
                CleanBinlogResponse { success: false }
            }
        }
    }

    pub fn rpc_stat(&self, request: RpcStatRequest) -> RpcStatResponse {
        let ops: Vec<u32> = if request.ops.is_empty() {
            (1..=8).collect()
        } else {
            request.ops
        };
        let stats = ops
            .into_iter()
            .filter_map(PerfOp::from_wire)
            .map(|op| {
                let stat = self.perf.sample(op);
                StatInfo {
                    current_stat: stat.current,
                    average_stat: stat.average,
                }
            })
            .collect();
        RpcStatResponse {
            stats,
            status: self.state.lock().role,
        }
    }

    /// Leader-driven binlog GC: find the cluster-wide applied floor and tell
    /// every replica (self included) to drop the prefix below it.
    async fn gc_loop(self: Arc<Self>) {
        loop {
            if !self
                .sleep_or_shutdown(Duration::from_secs(self.config.gc_interval))
                .await
            {
                return;
            }
            {
                let state = self.state.lock();
                if state.stopped {
                    return;
                }
                if !state.role.is_leader() {
                    continue;
                }
            }

            let mut min_applied = SlotIndex::MAX;
            let mut all_replied = true;
            for member in &self.config.cluster_members {
                match self.rpc.show_status(member, ShowStatusRequest::default()).await {
                    Ok(status) => min_applied = min_applied.min(status.last_applied),
                    Err(e) => {
                        info!(member = %member, error = %e, "failed to get last_applied");
                        all_replied = false;
                        break;
                    }
                }
            }
            if !all_replied {
                continue;
            }

            let safe_clean_index = min_applied - 1;
            let changed = {
                let mut state = self.state.lock();
                let old = state.last_safe_clean_index;
                state.last_safe_clean_index = safe_clean_index;
                old != safe_clean_index
            };
            if !changed || safe_clean_index < 0 {
                continue;
            }
            info!(safe_clean_index, "[gc] safe clean index");
            for member in &self.config.cluster_members {
                let request = CleanBinlogRequest {
                    end_index: safe_clean_index,
                };
                if let Err(e) = self.rpc.clean_binlog(member, request).await {
                    info!(member = %member, error = %e, "clean binlog request failed");
                }
            }
        }
    }

    fn trace_access(&self, action: &str) {
        if self.config.trace_ratio > 0.0 && rand::thread_rng().gen::<f64>() < self.config.trace_ratio
        {
            info!("[trace] {}", action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::NullRpc;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> KeystoneConfig {
        KeystoneConfig {
            server_id: "127.0.0.1:18868".to_string(),
            cluster_members: vec!["127.0.0.1:18868".to_string()],
            data_dir: dir.to_path_buf(),
            elect_timeout_min: 10,
            elect_timeout_max: 20,
            session_expire_timeout: 50,
            ..Default::default()
        }
    }

    async fn leader_replica(dir: &std::path::Path) -> Arc<Replica> {
        let replica = Replica::open(test_config(dir), Arc::new(NullRpc)).unwrap();
        replica.start();
        // Single-node shortcut: leadership arrives on the first timer fire.
        for _ in 0..100 {
            if replica.show_status().status.is_leader() {
                return replica;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("single node never became leader");
    }

    fn keep_alive_req(session: &str, timeout_ms: u64) -> KeepAliveRequest {
        KeepAliveRequest {
            session_id: session.to_string(),
            uuid: String::new(),
            timeout_milliseconds: Some(timeout_ms),
            locks: Vec::new(),
            forward_from_leader: false,
        }
    }

    #[tokio::test]
    async fn test_single_node_put_get_del() {
        let dir = tempdir().unwrap();
        let replica = leader_replica(dir.path()).await;

        let put = replica
            .put(PutRequest {
                key: "/cfg/db".to_string(),
                value: "primary".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(put.success);

        let get = replica
            .get(GetRequest {
                key: "/cfg/db".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(get.success);
        assert!(get.hit);
        assert_eq!(get.value, "primary");

        let del = replica
            .del(DelRequest {
                key: "/cfg/db".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(del.success);

        let get = replica
            .get(GetRequest {
                key: "/cfg/db".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(get.success);
        assert!(!get.hit);

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_follower_redirects_writes() {
        let dir = tempdir().unwrap();
        let config = KeystoneConfig {
            server_id: "127.0.0.1:18869".to_string(),
            cluster_members: vec![
                "127.0.0.1:18869".to_string(),
                "127.0.0.1:18870".to_string(),
                "127.0.0.1:18871".to_string(),
            ],
            data_dir: dir.path().to_path_buf(),
            // Long timer: the node stays follower for the test's duration.
            elect_timeout_min: 60_000,
            elect_timeout_max: 60_000,
            ..Default::default()
        };
        let replica = Replica::open(config, Arc::new(NullRpc)).unwrap();
        replica.start();

        // Teach it who leads.
        let heartbeat = AppendEntriesRequest {
            term: 3,
            leader_id: "127.0.0.1:18870".to_string(),
            prev_log_index: -1,
            prev_log_term: -1,
            entries: Vec::new(),
            leader_commit_index: -1,
        };
        assert!(replica.handle_append_entries(heartbeat).success);

        let put = replica
            .put(PutRequest {
                key: "/k".to_string(),
                value: "v".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(!put.success);
        assert_eq!(put.leader_id, "127.0.0.1:18870");

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_vote_rejects_stale_log_and_double_vote() {
        let dir = tempdir().unwrap();
        let config = KeystoneConfig {
            server_id: "a:1".to_string(),
            cluster_members: vec!["a:1".to_string(), "b:1".to_string(), "c:1".to_string()],
            data_dir: dir.path().to_path_buf(),
            elect_timeout_min: 60_000,
            elect_timeout_max: 60_000,
            ..Default::default()
        };
        let replica = Replica::open(config, Arc::new(NullRpc)).unwrap();

        // Seed our log at term 3 via replication.
        let seed = AppendEntriesRequest {
            term: 3,
            leader_id: "b:1".to_string(),
            prev_log_index: -1,
            prev_log_term: -1,
            entries: vec![
                LogEntry {
                    op: LogOp::Nop,
                    user: String::new(),
                    key: "Ping".to_string(),
                    value: String::new(),
                    term: 3,
                },
                LogEntry {
                    op: LogOp::Put,
                    user: String::new(),
                    key: "/k".to_string(),
                    value: "v".to_string(),
                    term: 3,
                },
            ],
            leader_commit_index: -1,
        };
        assert!(replica.handle_append_entries(seed).success);

        // A candidate with an older last log term is refused.
        let stale = replica.handle_vote(VoteRequest {
            term: 5,
            candidate_id: "c:1".to_string(),
            last_log_index: 10,
            last_log_term: 2,
        });
        assert!(!stale.vote_granted);

        // Same last term but a shorter log is refused too.
        let short = replica.handle_vote(VoteRequest {
            term: 5,
            candidate_id: "c:1".to_string(),
            last_log_index: 0,
            last_log_term: 3,
        });
        assert!(!short.vote_granted);

        // An up-to-date candidate gets the vote.
        let granted = replica.handle_vote(VoteRequest {
            term: 5,
            candidate_id: "c:1".to_string(),
            last_log_index: 1,
            last_log_term: 3,
        });
        assert!(granted.vote_granted);
        assert_eq!(granted.term, 5);

        // Within the same term, a different candidate is refused.
        let second = replica.handle_vote(VoteRequest {
            term: 5,
            candidate_id: "b:1".to_string(),
            last_log_index: 9,
            last_log_term: 4,
        });
        assert!(!second.vote_granted);

        // The same candidate asking again keeps its grant.
        let again = replica.handle_vote(VoteRequest {
            term: 5,
            candidate_id: "c:1".to_string(),
            last_log_index: 1,
            last_log_term: 3,
        });
        assert!(again.vote_granted);
    }

    #[tokio::test]
    async fn test_append_entries_truncates_divergent_suffix() {
        let dir = tempdir().unwrap();
        let config = KeystoneConfig {
            server_id: "a:1".to_string(),
            cluster_members: vec!["a:1".to_string(), "b:1".to_string(), "c:1".to_string()],
            data_dir: dir.path().to_path_buf(),
            elect_timeout_min: 60_000,
            elect_timeout_max: 60_000,
            ..Default::default()
        };
        let replica = Replica::open(config, Arc::new(NullRpc)).unwrap();

        let entry = |term: Term, key: &str| LogEntry {
            op: LogOp::Put,
            user: String::new(),
            key: key.to_string(),
            value: "v".to_string(),
            term,
        };

        // Slots 0..=18 at term 3 (mirrors a follower that kept a stale tail).
        let seed = AppendEntriesRequest {
            term: 3,
            leader_id: "b:1".to_string(),
            prev_log_index: -1,
            prev_log_term: -1,
            entries: (0..19).map(|i| entry(3, &format!("/k{}", i))).collect(),
            leader_commit_index: -1,
        };
        assert!(replica.handle_append_entries(seed).success);

        // New leader at term 5 ships slot 18 with prev 17 (term 3): the
        // follower's old slot 18 must be replaced.
        let reship = AppendEntriesRequest {
            term: 5,
            leader_id: "c:1".to_string(),
            prev_log_index: 17,
            prev_log_term: 3,
            entries: vec![entry(5, "/k18-new")],
            leader_commit_index: -1,
        };
        let response = replica.handle_append_entries(reship);
        assert!(response.success);
        assert_eq!(response.log_length, 19);

        let status = replica.show_status();
        assert_eq!(status.last_log_index, 18);
        assert_eq!(status.last_log_term, 5);

        // Leader beyond our log makes us report our length for back-off.
        let beyond = AppendEntriesRequest {
            term: 5,
            leader_id: "c:1".to_string(),
            prev_log_index: 40,
            prev_log_term: 5,
            entries: vec![entry(5, "/k41")],
            leader_commit_index: -1,
        };
        let response = replica.handle_append_entries(beyond);
        assert!(!response.success);
        assert_eq!(response.log_length, 19);
    }

    #[tokio::test]
    async fn test_lock_requires_live_session_and_excludes() {
        let dir = tempdir().unwrap();
        let replica = leader_replica(dir.path()).await;
        // Wait out the new-leader lock guard window.
        tokio::time::sleep(Duration::from_millis(60)).await;

        // No session registered yet: refused.
        let refused = replica
            .lock(LockRequest {
                key: "/lock/m".to_string(),
                session_id: "s1".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(!refused.success);

        replica.keep_alive(keep_alive_req("s1", 60_000));
        replica.keep_alive(keep_alive_req("s2", 60_000));

        let granted = replica
            .lock(LockRequest {
                key: "/lock/m".to_string(),
                session_id: "s1".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(granted.success);

        // Re-entry by the owner is allowed.
        let reentry = replica
            .lock(LockRequest {
                key: "/lock/m".to_string(),
                session_id: "s1".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(reentry.success);

        // A different live session is excluded.
        let excluded = replica
            .lock(LockRequest {
                key: "/lock/m".to_string(),
                session_id: "s2".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(!excluded.success);

        // Readers see the lock value while the owner is alive.
        let get = replica
            .get(GetRequest {
                key: "/lock/m".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(get.hit);
        assert_eq!(get.value, "s1");

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_expired_lock_owner_reads_as_absent() {
        let dir = tempdir().unwrap();
        let replica = leader_replica(dir.path()).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        replica.keep_alive(keep_alive_req("s1", 60_000));
        let granted = replica
            .lock(LockRequest {
                key: "/lock/m".to_string(),
                session_id: "s1".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(granted.success);

        // Kill the session cheaply: one last refresh reporting the held lock
        // with an already-past deadline, then sweep.
        let mut expiring = keep_alive_req("s1", 0);
        expiring.locks = vec!["/lock/m".to_string()];
        replica.keep_alive(expiring);
        replica.remove_expired_sessions();

        let get = replica
            .get(GetRequest {
                key: "/lock/m".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(get.success);
        assert!(!get.hit);

        // The sweep appended an Unlock; once applied the key is gone even at
        // the store level.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let scan = replica.scan(ScanRequest {
            start_key: "/".to_string(),
            end_key: String::new(),
            size_limit: 100,
            uuid: String::new(),
        });
        assert!(scan.success);
        assert!(scan.items.is_empty());

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_watch_fires_on_put_and_immediate_compare() {
        let dir = tempdir().unwrap();
        let replica = leader_replica(dir.path()).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        replica.keep_alive(keep_alive_req("s1", 60_000));

        // Pending watch fires when the key changes.
        let pending = {
            let replica = Arc::clone(&replica);
            tokio::spawn(async move {
                replica
                    .watch(WatchRequest {
                        key: "/cfg".to_string(),
                        session_id: "s1".to_string(),
                        old_value: String::new(),
                        key_exist: false,
                        uuid: String::new(),
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            replica
                .put(PutRequest {
                    key: "/cfg".to_string(),
                    value: "v1".to_string(),
                    uuid: String::new(),
                })
                .await
                .success
        );
        let event = pending.await.unwrap();
        assert!(event.success);
        assert_eq!(event.key, "/cfg");
        assert_eq!(event.value, "v1");
        assert!(!event.deleted);

        // A watch registered after the change fires immediately on the
        // snapshot mismatch.
        let event = replica
            .watch(WatchRequest {
                key: "/cfg".to_string(),
                session_id: "s1".to_string(),
                old_value: String::new(),
                key_exist: false,
                uuid: String::new(),
            })
            .await;
        assert!(event.success);
        assert_eq!(event.value, "v1");
        assert!(!event.deleted);

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_watch_canceled_on_session_expiry() {
        let dir = tempdir().unwrap();
        let replica = leader_replica(dir.path()).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        replica.keep_alive(keep_alive_req("s1", 60_000));

        let pending = {
            let replica = Arc::clone(&replica);
            tokio::spawn(async move {
                replica
                    .watch(WatchRequest {
                        key: "/never".to_string(),
                        session_id: "s1".to_string(),
                        old_value: String::new(),
                        key_exist: false,
                        uuid: String::new(),
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        replica.keep_alive(keep_alive_req("s1", 0));
        replica.remove_expired_sessions();

        let event = pending.await.unwrap();
        assert!(event.canceled);

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_register_login_logout_flow() {
        let dir = tempdir().unwrap();
        let replica = leader_replica(dir.path()).await;

        let hash = hash_password("pw");
        let registered = replica
            .register(RegisterRequest {
                username: "alice".to_string(),
                passwd: hash.clone(),
            })
            .await;
        assert!(registered.status.is_ok());

        let dup = replica
            .register(RegisterRequest {
                username: "alice".to_string(),
                passwd: hash.clone(),
            })
            .await;
        assert_eq!(dup.status, Status::UserExists);

        let login = replica
            .login(LoginRequest {
                username: "alice".to_string(),
                passwd: hash.clone(),
            })
            .await;
        assert!(login.status.is_ok());
        assert_eq!(login.uuid, crate::user::calc_uuid("alice"));

        let bad = replica
            .login(LoginRequest {
                username: "alice".to_string(),
                passwd: hash_password("wrong"),
            })
            .await;
        assert_eq!(bad.status, Status::PasswordError);

        // Logged-in writes land in the user's own namespace.
        let put = replica
            .put(PutRequest {
                key: "/private".to_string(),
                value: "mine".to_string(),
                uuid: login.uuid.clone(),
            })
            .await;
        assert!(put.success);
        let anon_get = replica
            .get(GetRequest {
                key: "/private".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(!anon_get.hit);
        let own_get = replica
            .get(GetRequest {
                key: "/private".to_string(),
                uuid: login.uuid.clone(),
            })
            .await;
        assert!(own_get.hit);
        assert_eq!(own_get.value, "mine");

        let out = replica
            .logout(LogoutRequest {
                uuid: login.uuid.clone(),
            })
            .await;
        assert!(out.status.is_ok());
        let stale = replica
            .put(PutRequest {
                key: "/private".to_string(),
                value: "x".to_string(),
                uuid: login.uuid,
            })
            .await;
        assert!(stale.uuid_expired);

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_scan_skips_reserved_keys() {
        let dir = tempdir().unwrap();
        let replica = leader_replica(dir.path()).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        for (key, value) in [("/a", "1"), ("/b", "2"), ("/c", "3")] {
            assert!(
                replica
                    .put(PutRequest {
                        key: key.to_string(),
                        value: value.to_string(),
                        uuid: String::new(),
                    })
                    .await
                    .success
            );
        }

        // The last_applied marker lives in the same namespace but never
        // leaks out of a scan.
        let scan = replica.scan(ScanRequest {
            start_key: String::new(),
            end_key: String::new(),
            size_limit: 100,
            uuid: String::new(),
        });
        assert!(scan.success);
        let keys: Vec<&str> = scan.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["/a", "/b", "/c"]);

        // Bounded scans truncate and say so.
        let scan = replica.scan(ScanRequest {
            start_key: "/a".to_string(),
            end_key: "/c".to_string(),
            size_limit: 1,
            uuid: String::new(),
        });
        assert_eq!(scan.items.len(), 1);
        assert!(scan.has_more);

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_clean_binlog_guard() {
        let dir = tempdir().unwrap();
        let replica = leader_replica(dir.path()).await;

        for i in 0..5 {
            assert!(
                replica
                    .put(PutRequest {
                        key: format!("/k{}", i),
                        value: "v".to_string(),
                        uuid: String::new(),
                    })
                    .await
                    .success
            );
        }
        let applied = replica.show_status().last_applied;
        assert!(applied >= 4);

        // Beyond last_applied: refused.
        let refused = replica.handle_clean_binlog(CleanBinlogRequest {
            end_index: applied + 100,
        });
        assert!(!refused.success);

        // A safe prefix is removed; later slots stay readable.
        let cleaned = replica.handle_clean_binlog(CleanBinlogRequest { end_index: 2 });
        assert!(cleaned.success);
        assert!(replica.binlog.read(1).is_err());
        assert!(replica.binlog.read(2).is_ok());

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_restart_recovers_applied_state() {
        let dir = tempdir().unwrap();
        {
            let replica = leader_replica(dir.path()).await;
            assert!(
                replica
                    .put(PutRequest {
                        key: "/k".to_string(),
                        value: "v".to_string(),
                        uuid: String::new(),
                    })
                    .await
                    .success
            );
            replica.shutdown();
            // Let the background tasks observe the shutdown and release the
            // storage handles before reopening the same directory.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let replica = leader_replica(dir.path()).await;
        let status = replica.show_status();
        // last_applied came back from the store marker, not from replay.
        assert!(status.last_applied >= 1);
        let get = replica
            .get(GetRequest {
                key: "/k".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(get.hit);
        assert_eq!(get.value, "v");
        replica.shutdown();
    }
}
