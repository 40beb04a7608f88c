//! Wire and domain types shared between the consensus core, the state
//! machine, and the HTTP transport.

use serde::{Deserialize, Serialize};

/// Type used to uniquely identify each server. Assigned in `replicas.json`,
/// not auto-incremented, since membership is operator-driven here rather
/// than leader-allocated.
pub type ServerId = String;

pub type Term = u64;

pub type LogIndex = u64;

/// One entry in the replicated log. `operation` is a closed tag (see
/// [`Operation`]); `params` are carried positionally on the wire so that an
/// unrecognised operation string can still be stored and skipped at apply
/// time rather than rejected at the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub operation: String,
    pub params: Vec<String>,
}

impl LogEntry {
    pub fn new(term: Term, operation: impl Into<String>, params: Vec<String>) -> Self {
        LogEntry { term, operation: operation.into(), params }
    }
}

/// The closed set of operations the state machine understands. A `LogEntry`
/// whose `operation` string does not match one of these is a silent no-op
/// on apply: followers must never diverge because a
/// leader persisted an entry they don't recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Subscribe,
    CreateAccount,
    CreatePost,
    CommentPost,
    LikePost,
    UnlikePost,
    DeletePost,
    DeleteAccount,
    AddReplica,
    RemoveReplica,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Subscribe => "SUBSCRIBE",
            Operation::CreateAccount => "CREATE_ACCOUNT",
            Operation::CreatePost => "CREATE_POST",
            Operation::CommentPost => "COMMENT_POST",
            Operation::LikePost => "LIKE_POST",
            Operation::UnlikePost => "UNLIKE_POST",
            Operation::DeletePost => "DELETE_POST",
            Operation::DeleteAccount => "DELETE_ACCOUNT",
            Operation::AddReplica => "ADD_REPLICA",
            Operation::RemoveReplica => "REMOVE_REPLICA",
        }
    }

    pub fn parse(s: &str) -> Option<Operation> {
        Some(match s {
            "SUBSCRIBE" => Operation::Subscribe,
            "CREATE_ACCOUNT" => Operation::CreateAccount,
            "CREATE_POST" => Operation::CreatePost,
            "COMMENT_POST" => Operation::CommentPost,
            "LIKE_POST" => Operation::LikePost,
            "UNLIKE_POST" => Operation::UnlikePost,
            "DELETE_POST" => Operation::DeletePost,
            "DELETE_ACCOUNT" => Operation::DeleteAccount,
            "ADD_REPLICA" => Operation::AddReplica,
            "REMOVE_REPLICA" => Operation::RemoveReplica,
            _ => return None,
        })
    }
}

/// A peer descriptor, as stored in `replicas.json` and replicated via
/// `ADD_REPLICA`/`REMOVE_REPLICA` log entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaConfig {
    pub id: ServerId,
    pub host: String,
    pub port: u16,
    pub raft_store: String,
    pub posts_store: String,
    pub users_store: String,
    pub writers_store: String,
    pub comments_store: String,
}

impl ReplicaConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub replicas: Vec<ReplicaConfig>,
}

// ---- Raft RPC envelopes ---------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLeaderInfoResponse {
    pub leader_id: Option<ServerId>,
}

/// Outcome tag for the generic application-RPC envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppResponse {
    pub operation: Outcome,
    pub info: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub posts: Vec<PostView>,
}

impl AppResponse {
    pub fn ok(info: impl Into<String>) -> Self {
        AppResponse { operation: Outcome::Success, info: vec![info.into()], posts: Vec::new() }
    }

    pub fn ok_with_posts(info: impl Into<String>, posts: Vec<PostView>) -> Self {
        AppResponse { operation: Outcome::Success, info: vec![info.into()], posts }
    }

    pub fn fail(info: impl Into<String>) -> Self {
        AppResponse { operation: Outcome::Failure, info: vec![info.into()], posts: Vec::new() }
    }
}

// ---- Application-level views (read side) ---------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentView {
    pub email: String,
    pub text: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostView {
    pub post_id: String,
    pub author: String,
    pub title: String,
    pub content: String,
    pub timestamp: String,
    pub likes: Vec<String>,
    pub comments: Vec<CommentView>,
}

