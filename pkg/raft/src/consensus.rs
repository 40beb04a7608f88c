//! Pure consensus core.
//!
//! `ConsensusCore` holds all node state and exposes synchronous,
//! side-effect-free transition functions. Every public method takes an
//! incoming event (a timer firing, an RPC arriving, an RPC response coming
//! back) and returns an [`Effects`] value describing what the caller must
//! do next — persist state, send messages, apply committed entries. No I/O
//! happens inside this module, which is what makes role transitions and
//! commit-index arithmetic unit-testable without an async runtime or a real
//! clock.

use std::collections::HashSet;

use crate::log::Log;
use crate::protos::{
    AppendEntriesRequest, AppendEntriesResponse, LogIndex, RequestVoteRequest, RequestVoteResponse,
    ServerId, Term,
};
use crate::state::{NodeState, Role};
use crate::RaftError;

/// Everything the outer async driver must do in reaction to one event.
#[derive(Debug, Default)]
pub struct Effects {
    /// Consensus state (`currentTerm`, `votedFor`, `log`) must be fsynced
    /// before any externally-visible effect of this event (a reply, a
    /// commit) is allowed to leave the process (I6).
    pub persist: bool,
    pub outbound: Vec<Outbound>,
    /// Set when `commitIndex` advanced; the driver should feed newly
    /// committed entries to the state machine.
    pub apply_ready: bool,
}

impl Effects {
    fn persisted() -> Self {
        Effects { persist: true, ..Default::default() }
    }
}

#[derive(Debug, Clone)]
pub enum Outbound {
    RequestVote { to: ServerId, req: RequestVoteRequest },
    AppendEntries { to: ServerId, req: AppendEntriesRequest },
}

pub struct ConsensusCore {
    pub state: NodeState,
    /// Votes received during the in-flight election. Cleared whenever a new
    /// election starts or the node steps down.
    votes_received: HashSet<ServerId>,
}

impl ConsensusCore {
    pub fn new(state: NodeState) -> Self {
        ConsensusCore { state, votes_received: HashSet::new() }
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term
    }

    pub fn known_leader(&self) -> Option<ServerId> {
        self.state.known_leader.clone()
    }

    fn step_down_if_stale(&mut self, term: Term) -> bool {
        if term > self.state.current_term {
            self.state.step_down_to_term(term);
            self.votes_received.clear();
            true
        } else {
            false
        }
    }

    // ---- Election timer -------------------------------------------------

    /// Election timer fired. No-op if this node is already leader.
    pub fn on_election_timeout(&mut self) -> Effects {
        if self.state.role == Role::Leader {
            return Effects::default();
        }

        self.state.become_candidate();
        self.votes_received.clear();
        self.votes_received.insert(self.state.id.clone());

        let req = RequestVoteRequest {
            term: self.state.current_term,
            candidate_id: self.state.id.clone(),
            last_log_index: self.state.log.last_index(),
            last_log_term: self.state.log.last_term(),
        };

        let mut effects = Effects::persisted();
        for peer in self.state.other_peer_ids() {
            effects.outbound.push(Outbound::RequestVote { to: peer, req: req.clone() });
        }
        effects
    }

    // ---- Heartbeat timer (leader only) -----------------------------------

    /// Heartbeat tick fired. Builds one `AppendEntries` per follower using
    /// each follower's `nextIndex`. No-op if not leader.
    pub fn on_heartbeat_tick(&mut self) -> Effects {
        if self.state.role != Role::Leader {
            return Effects::default();
        }
        self.build_append_entries_for_all()
    }

    fn build_append_entries_for_all(&self) -> Effects {
        let mut effects = Effects::default();
        for peer_id in self.state.other_peer_ids() {
            let next = *self.state.next_index.get(&peer_id).unwrap_or(&1);
            let prev_log_index = next.saturating_sub(1);
            let prev_log_term = self.state.log.term_at(prev_log_index).unwrap_or(0);
            let entries = self.state.log.slice_from(next).to_vec();
            let req = AppendEntriesRequest {
                term: self.state.current_term,
                leader_id: self.state.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.state.commit_index,
            };
            effects.outbound.push(Outbound::AppendEntries { to: peer_id, req });
        }
        effects
    }

    /// Called when the leader's liveness check finds fewer than a
    /// majority of peers reachable. Steps down unconditionally; caller
    /// supplies the observed reachable count.
    pub fn on_liveness_check_failed(&mut self) -> Effects {
        if self.state.role != Role::Leader {
            return Effects::default();
        }
        self.state.become_follower();
        Effects::default()
    }

    // ---- RequestVote RPC --------------------------------------------------

    pub fn handle_request_vote(&mut self, req: &RequestVoteRequest) -> (RequestVoteResponse, Effects) {
        let mut effects = Effects::default();

        if req.term > self.state.current_term {
            self.step_down_if_stale(req.term);
            effects.persist = true;
        }

        if req.term < self.state.current_term {
            return (RequestVoteResponse { term: self.state.current_term, vote_granted: false }, effects);
        }

        let log_ok = req.last_log_term > self.state.log.last_term()
            || (req.last_log_term == self.state.log.last_term() && req.last_log_index >= self.state.log.last_index());

        let can_vote = match &self.state.voted_for {
            None => true,
            Some(candidate) => candidate == &req.candidate_id,
        };

        if can_vote && log_ok {
            self.state.voted_for = Some(req.candidate_id.clone());
            effects.persist = true;
            (RequestVoteResponse { term: self.state.current_term, vote_granted: true }, effects)
        } else {
            (RequestVoteResponse { term: self.state.current_term, vote_granted: false }, effects)
        }
    }

    pub fn handle_vote_response(&mut self, from: ServerId, resp: RequestVoteResponse) -> Effects {
        if resp.term > self.state.current_term {
            self.step_down_if_stale(resp.term);
            return Effects::persisted();
        }

        if self.state.role != Role::Candidate || resp.term != self.state.current_term {
            return Effects::default();
        }

        if resp.vote_granted {
            self.votes_received.insert(from);
        }

        if self.votes_received.len() >= self.state.majority() {
            self.state.become_leader();
            let mut effects = Effects::persisted();
            let heartbeat = self.build_append_entries_for_all();
            effects.outbound = heartbeat.outbound;
            effects
        } else {
            Effects::default()
        }
    }

    // ---- AppendEntries RPC --------------------------------------------------

    pub fn handle_append_entries(&mut self, req: &AppendEntriesRequest) -> (AppendEntriesResponse, Effects) {
        let mut effects = Effects::default();

        if req.term > self.state.current_term {
            self.step_down_if_stale(req.term);
            effects.persist = true;
        }

        if req.term < self.state.current_term {
            return (AppendEntriesResponse { term: self.state.current_term, success: false }, effects);
        }

        // A valid leader for our term: reset role to follower (covers the
        // candidate-sees-current-term-leader transition) without bumping
        // the generation unnecessarily if we're already a follower.
        if self.state.role != Role::Follower {
            self.state.become_follower();
        }
        self.state.known_leader = Some(req.leader_id.clone());

        let accepted = self.state.log.reconcile(req.prev_log_index, req.prev_log_term, &req.entries);
        if !accepted {
            return (AppendEntriesResponse { term: self.state.current_term, success: false }, effects);
        }
        effects.persist = true;

        if req.leader_commit > self.state.commit_index {
            self.state.commit_index = req.leader_commit.min(self.state.log.last_index());
            effects.apply_ready = true;
        }

        (AppendEntriesResponse { term: self.state.current_term, success: true }, effects)
    }

    pub fn handle_append_response(
        &mut self,
        from: ServerId,
        req_prev_log_index: LogIndex,
        req_entries_len: usize,
        resp: AppendEntriesResponse,
    ) -> Effects {
        if resp.term > self.state.current_term {
            self.step_down_if_stale(resp.term);
            return Effects::persisted();
        }

        if self.state.role != Role::Leader || resp.term != self.state.current_term {
            return Effects::default();
        }

        if resp.success {
            let new_match = req_prev_log_index + req_entries_len as LogIndex;
            self.state.match_index.insert(from.clone(), new_match);
            self.state.next_index.insert(from, new_match + 1);
            self.advance_commit_index()
        } else {
            let next = self.state.next_index.entry(from).or_insert(1);
            *next = (*next).saturating_sub(1).max(1);
            Effects::default()
        }
    }

    /// Advances `commitIndex` to the largest `N` for which a majority of
    /// `matchIndex` (counting self as `last_index()`) is `>= N` and
    /// `log[N].term == currentTerm` (the commit-from-current-term rule).
    fn advance_commit_index(&mut self) -> Effects {
        let last = self.state.log.last_index();
        let majority = self.state.majority();

        let mut candidate = self.state.commit_index;
        for n in (self.state.commit_index + 1..=last).rev() {
            if self.state.log.term_at(n) != Some(self.state.current_term) {
                continue;
            }
            let mut count = 1; // self
            for &m in self.state.match_index.values() {
                if m >= n {
                    count += 1;
                }
            }
            if count >= majority {
                candidate = n;
                break;
            }
        }

        if candidate > self.state.commit_index {
            self.state.commit_index = candidate;
            Effects { apply_ready: true, ..Default::default() }
        } else {
            Effects::default()
        }
    }

    // ---- Leader-only ingress ------------------------------------------------

    /// Appends a new entry as leader, advances `commitIndex` to cover it
    /// immediately (a deliberately weaker "commit on append" behaviour —
    /// a write reported successful here is NOT yet known durable on a
    /// majority), and returns the fan-out effects.
    pub fn propose(&mut self, operation: &str, params: Vec<String>) -> Result<(LogIndex, Effects), RaftError> {
        if self.state.role != Role::Leader {
            return Err(RaftError::NotLeader { leader_hint: self.state.known_leader.clone() });
        }

        let entry = crate::protos::LogEntry::new(self.state.current_term, operation, params);
        let index = self.state.log.append(entry);
        self.state.commit_index = self.state.commit_index.max(index);

        let mut effects = self.build_append_entries_for_all();
        effects.persist = true;
        effects.apply_ready = true;
        Ok((index, effects))
    }

    pub fn apply_membership_change(&mut self, peers: Vec<crate::protos::ReplicaConfig>) {
        let next = self.state.log.last_index() + 1;
        for peer in &peers {
            if peer.id == self.state.id {
                continue;
            }
            self.state.next_index.entry(peer.id.clone()).or_insert(next);
            self.state.match_index.entry(peer.id.clone()).or_insert(0);
        }
        let keep: HashSet<ServerId> = peers.iter().map(|p| p.id.clone()).collect();
        self.state.next_index.retain(|id, _| keep.contains(id));
        self.state.match_index.retain(|id, _| keep.contains(id));
        self.state.peers = peers;
    }

    pub fn log(&self) -> &Log {
        &self.state.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protos::ReplicaConfig;

    fn peer(id: &str) -> ReplicaConfig {
        ReplicaConfig {
            id: id.to_string(),
            host: "127.0.0.1".into(),
            port: 0,
            raft_store: String::new(),
            posts_store: String::new(),
            users_store: String::new(),
            writers_store: String::new(),
            comments_store: String::new(),
        }
    }

    fn core3() -> ConsensusCore {
        let peers = vec![peer("a"), peer("b"), peer("c")];
        ConsensusCore::new(NodeState::new("a".into(), peers))
    }

    #[test]
    fn election_timeout_becomes_candidate_and_requests_votes() {
        let mut core = core3();
        let effects = core.on_election_timeout();
        assert_eq!(core.role(), Role::Candidate);
        assert_eq!(core.current_term(), 1);
        assert_eq!(effects.outbound.len(), 2);
        assert!(effects.persist);
    }

    #[test]
    fn majority_votes_elects_leader() {
        let mut core = core3();
        core.on_election_timeout();
        let effects = core.handle_vote_response(
            "b".into(),
            RequestVoteResponse { term: 1, vote_granted: true },
        );
        assert_eq!(core.role(), Role::Leader);
        assert_eq!(effects.outbound.len(), 2);
    }

    #[test]
    fn higher_term_response_steps_down_candidate() {
        let mut core = core3();
        core.on_election_timeout();
        core.handle_vote_response("b".into(), RequestVoteResponse { term: 5, vote_granted: false });
        assert_eq!(core.role(), Role::Follower);
        assert_eq!(core.current_term(), 5);
    }

    #[test]
    fn request_vote_denies_stale_term() {
        let mut core = core3();
        core.state.current_term = 3;
        let (resp, _) = core.handle_request_vote(&RequestVoteRequest {
            term: 2,
            candidate_id: "b".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 3);
    }

    #[test]
    fn request_vote_grants_when_log_up_to_date_and_unvoted() {
        let mut core = core3();
        let (resp, effects) = core.handle_request_vote(&RequestVoteRequest {
            term: 1,
            candidate_id: "b".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(resp.vote_granted);
        assert!(effects.persist);
        assert_eq!(core.state.voted_for, Some("b".to_string()));
    }

    #[test]
    fn request_vote_denies_second_candidate_same_term() {
        let mut core = core3();
        core.handle_request_vote(&RequestVoteRequest {
            term: 1,
            candidate_id: "b".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        let (resp, _) = core.handle_request_vote(&RequestVoteRequest {
            term: 1,
            candidate_id: "c".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!resp.vote_granted);
    }

    #[test]
    fn append_entries_from_stale_leader_rejected() {
        let mut core = core3();
        core.state.current_term = 5;
        let (resp, _) = core.handle_append_entries(&AppendEntriesRequest {
            term: 4,
            leader_id: "b".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(!resp.success);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn append_entries_advances_commit_index() {
        let mut core = core3();
        let entry = crate::protos::LogEntry::new(1, "SUBSCRIBE", vec!["a@x".into()]);
        let (resp, effects) = core.handle_append_entries(&AppendEntriesRequest {
            term: 1,
            leader_id: "b".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry],
            leader_commit: 1,
        });
        assert!(resp.success);
        assert!(effects.apply_ready);
        assert_eq!(core.state.commit_index, 1);
    }

    #[test]
    fn propose_fails_when_not_leader() {
        let mut core = core3();
        let err = core.propose("SUBSCRIBE", vec!["a@x".into()]).unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }

    #[test]
    fn propose_appends_and_commits_immediately_when_leader() {
        let mut core = core3();
        core.on_election_timeout();
        core.handle_vote_response("b".into(), RequestVoteResponse { term: 1, vote_granted: true });
        let (index, effects) = core.propose("SUBSCRIBE", vec!["a@x".into()]).unwrap();
        assert_eq!(index, 1);
        assert_eq!(core.state.commit_index, 1);
        assert!(effects.apply_ready);
        assert_eq!(effects.outbound.len(), 2);
    }

    #[test]
    fn advance_commit_index_requires_current_term_entry() {
        let mut core = core3();
        core.state.current_term = 2;
        core.state.log = Log::from_entries(vec![crate::protos::LogEntry::new(1, "SUBSCRIBE", vec!["a@x".into()])]);
        core.state.role = Role::Leader;
        core.state.match_index.insert("b".into(), 1);
        core.state.match_index.insert("c".into(), 1);
        let effects = core.advance_commit_index();
        assert!(!effects.apply_ready);
        assert_eq!(core.state.commit_index, 0);
    }

    #[test]
    fn append_response_failure_decrements_next_index_floor_one() {
        let mut core = core3();
        core.state.role = Role::Leader;
        core.state.next_index.insert("b".into(), 1);
        core.handle_append_response(
            "b".into(),
            0,
            0,
            AppendEntriesResponse { term: 0, success: false },
        );
        assert_eq!(core.state.next_index["b"], 1);
    }
}
