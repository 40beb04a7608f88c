use crate::protos::ServerId;

/// Behavioural error taxonomy for the consensus core and the application
/// RPCs built on top of it. Variants map directly onto the client-facing
/// `FAILURE` reason string; `Fatal` additionally means the node should stop
/// serving further mutations.
#[derive(thiserror::Error, Debug)]
pub enum RaftError {
    #[error("not the leader")]
    NotLeader { leader_hint: Option<ServerId> },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("replication failed: {0}")]
    ReplicationFailed(String),

    #[error("transport error talking to {peer}: {source}")]
    Transport {
        peer: ServerId,
        #[source]
        source: reqwest::Error,
    },

    #[error("fatal storage error: {0}")]
    Fatal(#[from] core::FsError),
}

pub type Result<T> = std::result::Result<T, RaftError>;

impl RaftError {
    /// Short, stable reason string sent back to clients in `Response.info`.
    pub fn client_message(&self) -> String {
        match self {
            RaftError::NotLeader { .. } => "Not leader".to_string(),
            RaftError::BadRequest(msg) => msg.clone(),
            RaftError::Conflict(msg) => msg.clone(),
            RaftError::NotFound(msg) => msg.clone(),
            RaftError::ReplicationFailed(msg) => format!("Could not replicate: {msg}"),
            RaftError::Transport { peer, .. } => format!("peer {peer} unreachable"),
            RaftError::Fatal(err) => format!("internal error: {err}"),
        }
    }
}
