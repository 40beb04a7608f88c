//! Persistent and volatile node state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::log::Log;
use crate::protos::{LogIndex, ReplicaConfig, ServerId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// The subset of node state that must survive a crash: `currentTerm`,
/// `votedFor`, and the log. Serialised as a single JSON blob by the durable
/// state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub log: Vec<crate::protos::LogEntry>,
}

impl Default for PersistentState {
    fn default() -> Self {
        PersistentState { current_term: 0, voted_for: None, log: Vec::new() }
    }
}

/// Full in-memory node state: persistent fields plus the volatile fields
/// that reset on restart.
pub struct NodeState {
    pub id: ServerId,
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub log: Log,

    pub role: Role,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,

    /// Leader-only progress tracking, keyed by peer id.
    pub next_index: HashMap<ServerId, LogIndex>,
    pub match_index: HashMap<ServerId, LogIndex>,

    /// Current working cluster membership, mutated only by applying
    /// `ADD_REPLICA` / `REMOVE_REPLICA` entries.
    pub peers: Vec<ReplicaConfig>,

    /// Generation counter bumped on every role transition, so a fired timer
    /// from a stale generation can recognise itself as obsolete.
    pub generation: u64,

    pub known_leader: Option<ServerId>,
}

impl NodeState {
    pub fn new(id: ServerId, peers: Vec<ReplicaConfig>) -> Self {
        NodeState {
            id,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            peers,
            generation: 0,
            known_leader: None,
        }
    }

    pub fn from_persistent(id: ServerId, peers: Vec<ReplicaConfig>, persisted: PersistentState) -> Self {
        let mut state = Self::new(id, peers);
        state.current_term = persisted.current_term;
        state.voted_for = persisted.voted_for;
        state.log = Log::from_entries(persisted.log);
        state
    }

    pub fn persistent_snapshot(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            log: self.log.entries().to_vec(),
        }
    }

    pub fn other_peer_ids(&self) -> Vec<ServerId> {
        self.peers.iter().map(|p| p.id.clone()).filter(|id| id != &self.id).collect()
    }

    pub fn peer(&self, id: &str) -> Option<&ReplicaConfig> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Size of the cluster, including this node, as currently known.
    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }

    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Adopts a higher term observed from a peer message: clears the vote,
    /// steps down to follower, and bumps the generation.
    pub fn step_down_to_term(&mut self, term: Term) {
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower;
        self.generation += 1;
    }

    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.role = Role::Candidate;
        self.generation += 1;
        self.known_leader = None;
    }

    pub fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.known_leader = Some(self.id.clone());
        self.generation += 1;
        let next = self.log.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer_id in self.other_peer_ids() {
            self.next_index.insert(peer_id.clone(), next);
            self.match_index.insert(peer_id, 0);
        }
    }

    pub fn become_follower(&mut self) {
        self.role = Role::Follower;
        self.generation += 1;
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}
