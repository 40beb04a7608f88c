//! Async driver around the pure [`ConsensusCore`]: timers, RPC dispatch,
//! and the bridge from committed log entries to the state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::config::{
    APPEND_ENTRIES_TIMEOUT, ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN, HEARTBEAT_INTERVAL,
    LIVENESS_PING_TIMEOUT, REQUEST_VOTE_TIMEOUT,
};
use crate::consensus::{ConsensusCore, Outbound};
use crate::dss::ConsensusStore;
use crate::protos::{
    AppendEntriesRequest, AppendEntriesResponse, Operation, RequestVoteRequest, RequestVoteResponse,
    ServerId,
};
use crate::state::{NodeState, Role};
use crate::state_machine::{StateMachine, StoragePaths};
use crate::RaftError;

pub struct Node {
    pub id: ServerId,
    inner: Mutex<Inner>,
    consensus_store: ConsensusStore,
    storage_paths: StoragePaths,
    http: reqwest::Client,
    wake: Notify,
    /// Set once a consensus-state persist fails. A poisoned node refuses
    /// further client mutations rather than risk reporting a write as
    /// successful when it was never durably recorded.
    poisoned: AtomicBool,
}

struct Inner {
    core: ConsensusCore,
    sm: StateMachine,
}

impl Node {
    /// Loads persisted consensus state, then rebuilds the state machine by
    /// replaying the committed log from index 1 — `lastApplied` always
    /// restarts at 0 regardless of what the CSV caches say.
    pub fn bootstrap(
        id: ServerId,
        peers: Vec<crate::protos::ReplicaConfig>,
        consensus_store: ConsensusStore,
        storage_paths: StoragePaths,
    ) -> Arc<Self> {
        let persisted = consensus_store.load();
        let commit_index = persisted.log.len() as u64;
        let mut state = NodeState::from_persistent(id.clone(), peers, persisted);
        state.commit_index = commit_index;
        state.last_applied = 0;

        let mut sm = StateMachine::empty_for_replay();
        let core = ConsensusCore::new(state);
        for entry in core.log().entries().iter().take(commit_index as usize) {
            sm.apply(entry, now_iso8601);
        }

        let node = Node {
            id,
            inner: Mutex::new(Inner { core, sm }),
            consensus_store,
            storage_paths,
            http: reqwest::Client::new(),
            wake: Notify::new(),
            poisoned: AtomicBool::new(false),
        };
        info!(commit_index, "node bootstrapped, log replayed into state machine");
        Arc::new(node)
    }

    /// Runs the election-timer + heartbeat driver forever. Spawn this as a
    /// background task; it never returns under normal operation.
    pub async fn run(self: Arc<Self>) {
        let mut deadline = self.new_election_deadline();
        let mut last_heartbeat = tokio::time::Instant::now();

        loop {
            let role = { self.inner.lock().await.core.role() };
            let wait = if role == Role::Leader {
                HEARTBEAT_INTERVAL.saturating_sub(last_heartbeat.elapsed())
            } else {
                deadline.saturating_duration_since(tokio::time::Instant::now())
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {
                    // External event (RPC) may have reset the election
                    // clock or changed role; recompute on the next loop
                    // iteration rather than acting here.
                    deadline = self.new_election_deadline();
                    continue;
                }
            }

            let role = { self.inner.lock().await.core.role() };
            if role == Role::Leader {
                self.fire_heartbeat().await;
                last_heartbeat = tokio::time::Instant::now();
            } else if tokio::time::Instant::now() >= deadline {
                self.fire_election_timeout().await;
                deadline = self.new_election_deadline();
            }
        }
    }

    fn new_election_deadline(&self) -> tokio::time::Instant {
        let millis = rand::thread_rng()
            .gen_range(ELECTION_TIMEOUT_MIN.as_millis() as u64..=ELECTION_TIMEOUT_MAX.as_millis() as u64);
        tokio::time::Instant::now() + Duration::from_millis(millis)
    }

    fn reset_election_timer(&self) {
        self.wake.notify_one();
    }

    #[instrument(skip(self))]
    async fn fire_election_timeout(self: &Arc<Self>) {
        let effects = {
            let mut guard = self.inner.lock().await;
            guard.core.on_election_timeout()
        };
        if self.persist_if_needed(effects.persist).await.is_err() {
            return;
        }
        info!("election timer fired, requesting votes");
        self.dispatch(effects.outbound).await;
    }

    #[instrument(skip(self))]
    async fn fire_heartbeat(self: &Arc<Self>) {
        if !self.leader_liveness_check().await {
            return;
        }
        let effects = {
            let mut guard = self.inner.lock().await;
            guard.core.on_heartbeat_tick()
        };
        if self.persist_if_needed(effects.persist).await.is_err() {
            return;
        }
        self.dispatch(effects.outbound).await;
    }

    /// Pings every peer with a short timeout and steps down if fewer than a
    /// majority (including self) answer. Returns `false` if the node
    /// stepped down, so the caller should skip sending this tick's
    /// heartbeat.
    async fn leader_liveness_check(self: &Arc<Self>) -> bool {
        let (peers, term, majority) = {
            let guard = self.inner.lock().await;
            (guard.core.state.other_peer_ids(), guard.core.current_term(), guard.core.state.majority())
        };

        let mut reachable = 1usize; // self
        for peer_id in &peers {
            let url = self.peer_url(peer_id).await;
            let Some(url) = url else { continue };
            let resp = timeout(LIVENESS_PING_TIMEOUT, self.http.get(format!("{url}/raft/get_leader_info")).send()).await;
            if matches!(resp, Ok(Ok(r)) if r.status().is_success()) {
                reachable += 1;
            }
        }

        if reachable < majority {
            warn!(reachable, majority, term, "leader liveness check failed, stepping down");
            let mut guard = self.inner.lock().await;
            guard.core.on_liveness_check_failed();
            false
        } else {
            true
        }
    }

    async fn peer_url(&self, peer_id: &str) -> Option<String> {
        let guard = self.inner.lock().await;
        guard.core.state.peer(peer_id).map(|p| p.base_url())
    }

    /// Persists `currentTerm`/`votedFor`/`log` if the caller's effects
    /// called for it. A failed write is never swallowed: it poisons the
    /// node (no further client mutations are accepted) and is propagated
    /// to the caller, which must refuse to let the in-memory change become
    /// externally observable — deny the vote, fail the append, or fail the
    /// proposal, as appropriate.
    async fn persist_if_needed(&self, needed: bool) -> Result<(), RaftError> {
        if !needed {
            return Ok(());
        }
        let snapshot = {
            let guard = self.inner.lock().await;
            guard.core.state.persistent_snapshot()
        };
        self.consensus_store.save(&snapshot).map_err(|err| {
            self.poisoned.store(true, Ordering::Release);
            warn!(%err, "failed to persist consensus state; node will refuse further mutations");
            err
        })
    }

    async fn dispatch(self: &Arc<Self>, outbound: Vec<Outbound>) {
        for item in outbound {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                match item {
                    Outbound::RequestVote { to, req } => node.send_request_vote(to, req).await,
                    Outbound::AppendEntries { to, req } => node.send_append_entries(to, req).await,
                }
            });
        }
        self.apply_committed().await;
    }

    async fn send_request_vote(self: Arc<Self>, to: ServerId, req: RequestVoteRequest) {
        let Some(url) = self.peer_url(&to).await else { return };
        let result = timeout(REQUEST_VOTE_TIMEOUT, self.http.post(format!("{url}/raft/request_vote")).json(&req).send()).await;
        let Ok(Ok(resp)) = result else { return };
        let Ok(body) = resp.json::<RequestVoteResponse>().await else { return };

        let effects = {
            let mut guard = self.inner.lock().await;
            guard.core.handle_vote_response(to, body)
        };
        if self.persist_if_needed(effects.persist).await.is_err() {
            return;
        }
        self.dispatch(effects.outbound).await;
    }

    async fn send_append_entries(self: Arc<Self>, to: ServerId, req: AppendEntriesRequest) {
        let Some(url) = self.peer_url(&to).await else { return };
        let prev_log_index = req.prev_log_index;
        let entries_len = req.entries.len();
        let result = timeout(
            APPEND_ENTRIES_TIMEOUT,
            self.http.post(format!("{url}/raft/append_entries")).json(&req).send(),
        )
        .await;
        let Ok(Ok(resp)) = result else { return };
        let Ok(body) = resp.json::<AppendEntriesResponse>().await else { return };

        let effects = {
            let mut guard = self.inner.lock().await;
            guard.core.handle_append_response(to, prev_log_index, entries_len, body)
        };
        if self.persist_if_needed(effects.persist).await.is_err() {
            return;
        }
        self.dispatch(effects.outbound).await;
    }

    /// Feeds every newly committed entry into the state machine in order,
    /// then flushes the application tables (best-effort, after apply).
    async fn apply_committed(&self) {
        let mut guard = self.inner.lock().await;
        let Inner { core, sm } = &mut *guard;

        let commit_index = core.state.commit_index;
        while core.state.last_applied < commit_index {
            let next = core.state.last_applied + 1;
            let Some(entry) = core.log().get(next).cloned() else { break };

            if let Some(Operation::AddReplica) = Operation::parse(&entry.operation) {
                if let Some(json_config) = entry.params.first() {
                    let mut peers = core.state.peers.clone();
                    crate::state_machine::splice_replica(&mut peers, json_config);
                    core.apply_membership_change(peers);
                }
            } else if let Some(Operation::RemoveReplica) = Operation::parse(&entry.operation) {
                if let Some(peer_id) = entry.params.first() {
                    let mut peers = core.state.peers.clone();
                    crate::state_machine::remove_replica(&mut peers, peer_id);
                    core.apply_membership_change(peers);
                }
            } else {
                sm.apply(&entry, now_iso8601);
            }

            core.state.last_applied = next;
        }

        if let Err(err) = sm.flush(&self.storage_paths) {
            warn!(%err, "failed to flush application tables");
        }
    }

    // ---- Inbound RPC handlers, called from the transport layer --------------

    pub async fn handle_request_vote(self: &Arc<Self>, req: RequestVoteRequest) -> RequestVoteResponse {
        let (resp, effects) = {
            let mut guard = self.inner.lock().await;
            guard.core.handle_request_vote(&req)
        };
        if self.persist_if_needed(effects.persist).await.is_err() {
            // The vote decision was never durably recorded; deny it rather
            // than let an un-persisted grant become externally observable.
            return RequestVoteResponse { term: resp.term, vote_granted: false };
        }
        if resp.vote_granted {
            self.reset_election_timer();
        }
        resp
    }

    pub async fn handle_append_entries(self: &Arc<Self>, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let (resp, effects) = {
            let mut guard = self.inner.lock().await;
            guard.core.handle_append_entries(&req)
        };
        if self.persist_if_needed(effects.persist).await.is_err() {
            // The reconciled log was never durably recorded; report
            // failure so the leader retries rather than assuming we hold
            // entries we cannot actually survive a crash with.
            return AppendEntriesResponse { term: resp.term, success: false };
        }
        self.reset_election_timer();
        if effects.apply_ready {
            self.apply_committed().await;
        }
        resp
    }

    pub async fn get_leader_info(self: &Arc<Self>) -> Option<ServerId> {
        let guard = self.inner.lock().await;
        if guard.core.role() == Role::Leader {
            Some(guard.core.state.id.clone())
        } else {
            guard.core.known_leader()
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.lock().await.core.role() == Role::Leader
    }

    /// Leader-only ingress point for application RPCs. Builds the log
    /// entry, appends, advances commitIndex to cover it immediately,
    /// applies locally, and fans out replication asynchronously. A
    /// returned `Ok` means the write is visible on this node, not that a
    /// majority has acknowledged it yet.
    pub async fn propose(self: &Arc<Self>, operation: &str, params: Vec<String>) -> Result<u64, RaftError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(RaftError::ReplicationFailed(
                "node is refusing writes after a prior consensus-state persist failure".to_string(),
            ));
        }

        let (index, effects) = {
            let mut guard = self.inner.lock().await;
            guard.core.propose(operation, params)?
        };
        self.persist_if_needed(effects.persist).await?;
        self.apply_committed().await;
        self.dispatch(effects.outbound).await;
        Ok(index)
    }

    pub async fn with_state_machine<R>(&self, f: impl FnOnce(&StateMachine) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard.sm)
    }

    /// Read-only access to consensus state (membership, progress indices,
    /// role) for callers that only need a snapshot rather than a mutation.
    pub async fn with_consensus_state<R>(&self, f: impl FnOnce(&NodeState) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard.core.state)
    }
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}
