//! Deterministic application state machine: accounts, subscriptions,
//! posts, likes, comments. Applied exclusively in log order; see the
//! operation table below.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dss::write_csv;
use crate::protos::{CommentView, LogEntry, Operation, PostView, ReplicaConfig};

#[derive(Debug, Clone)]
pub struct Writer {
    pub name: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct Comment {
    pub email: String,
    pub text: String,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct Post {
    pub post_id: String,
    pub author: String,
    pub title: String,
    pub content: String,
    pub timestamp: String,
    pub likes: HashSet<String>,
    pub comments: Vec<Comment>,
}

impl Post {
    fn to_view(&self) -> PostView {
        PostView {
            post_id: self.post_id.clone(),
            author: self.author.clone(),
            title: self.title.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp.clone(),
            likes: self.likes.iter().cloned().collect(),
            comments: self
                .comments
                .iter()
                .map(|c| CommentView { email: c.email.clone(), text: c.text.clone(), timestamp: c.timestamp.clone() })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PostRow {
    post_id: String,
    author: String,
    title: String,
    content: String,
    timestamp: String,
    likes: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRow {
    email: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WriterRow {
    email: String,
    name: String,
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommentRow {
    post_id: String,
    email: String,
    text: String,
    timestamp: String,
}

pub struct StoragePaths {
    pub posts: PathBuf,
    pub users: PathBuf,
    pub writers: PathBuf,
    pub comments: PathBuf,
}

/// The applied state, owned by the node and mutated only through
/// [`StateMachine::apply`]. Reads are served from in-memory snapshots; see
/// the query methods below.
#[derive(Default)]
pub struct StateMachine {
    pub subscribers: HashSet<String>,
    pub writers: BTreeMap<String, Writer>,
    pub posts: BTreeMap<String, Post>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed entry. Unrecognised operations, wrong arity,
    /// or references to missing entities are silently skipped (idempotent
    /// no-op) so that a follower never diverges from a leader that
    /// tolerated a malformed entry.
    pub fn apply(&mut self, entry: &LogEntry, now_ts: impl Fn() -> String) {
        let Some(op) = Operation::parse(&entry.operation) else {
            warn!(operation = %entry.operation, "skipping unrecognised log operation");
            return;
        };
        let p = &entry.params;

        match op {
            Operation::Subscribe => {
                let [email] = take::<1>(p) else { return };
                self.subscribers.insert(email.clone());
            }
            Operation::CreateAccount => {
                let [name, email, password_hash] = take::<3>(p) else { return };
                self.writers
                    .entry(email.clone())
                    .or_insert_with(|| Writer { name: name.clone(), password_hash: password_hash.clone() });
            }
            Operation::CreatePost => {
                let [post_id, title, content, author, ts] = take::<5>(p) else { return };
                self.posts.entry(post_id.clone()).or_insert_with(|| Post {
                    post_id: post_id.clone(),
                    author: author.clone(),
                    title: title.clone(),
                    content: content.clone(),
                    timestamp: ts.clone(),
                    likes: HashSet::new(),
                    comments: Vec::new(),
                });
            }
            Operation::CommentPost => {
                let [post_id, email, text] = take::<3>(p) else { return };
                if let Some(post) = self.posts.get_mut(post_id) {
                    post.comments.push(Comment { email: email.clone(), text: text.clone(), timestamp: now_ts() });
                }
            }
            Operation::LikePost => {
                let [post_id, email] = take::<2>(p) else { return };
                if self.subscribers.contains(email) {
                    if let Some(post) = self.posts.get_mut(post_id) {
                        post.likes.insert(email.clone());
                    }
                }
            }
            Operation::UnlikePost => {
                let [post_id, email] = take::<2>(p) else { return };
                if let Some(post) = self.posts.get_mut(post_id) {
                    post.likes.remove(email);
                }
            }
            Operation::DeletePost => {
                let [post_id, author] = take::<2>(p) else { return };
                if self.posts.get(post_id).is_some_and(|post| &post.author == author) {
                    self.posts.remove(post_id);
                }
            }
            Operation::DeleteAccount => {
                let [email] = take::<1>(p) else { return };
                self.subscribers.remove(email);
                self.posts.retain(|_, post| &post.author != email);
            }
            Operation::AddReplica | Operation::RemoveReplica => {
                // Membership changes are handled by the node directly against
                // its peer list; the state machine has no table for them.
                debug!(operation = %entry.operation, "membership entry applied at node level");
            }
        }
    }

    // ---- Read-only queries ---------------------------------------------------

    pub fn get_post(&self, post_id: &str) -> Option<PostView> {
        self.posts.get(post_id).map(Post::to_view)
    }

    pub fn list_posts(&self) -> Vec<PostView> {
        self.posts.values().map(Post::to_view).collect()
    }

    pub fn list_comments(&self, post_id: &str) -> Vec<CommentView> {
        self.posts
            .get(post_id)
            .map(|post| {
                post.comments
                    .iter()
                    .map(|c| CommentView { email: c.email.clone(), text: c.text.clone(), timestamp: c.timestamp.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_subscriber(&self, email: &str) -> Option<String> {
        self.subscribers.get(email).cloned()
    }

    pub fn writer(&self, email: &str) -> Option<&Writer> {
        self.writers.get(email)
    }

    pub fn email_in_use(&self, email: &str) -> bool {
        self.writers.contains_key(email) || self.subscribers.contains(email)
    }

    // ---- Persistence --------------------------------------------------------

    /// Full rewrite of the four CSV tables. Best-effort, after-apply; not
    /// required for correctness since a restart always rebuilds the tables
    /// by replaying the committed log.
    pub fn flush(&self, paths: &StoragePaths) -> Result<(), crate::RaftError> {
        let post_rows: Vec<PostRow> = self
            .posts
            .values()
            .map(|post| PostRow {
                post_id: post.post_id.clone(),
                author: post.author.clone(),
                title: post.title.clone(),
                content: post.content.clone(),
                timestamp: post.timestamp.clone(),
                likes: post.likes.iter().cloned().collect::<Vec<_>>().join(";"),
            })
            .collect();
        write_csv(&paths.posts, &["post_id", "author", "title", "content", "timestamp", "likes"], &post_rows)?;

        let user_rows: Vec<UserRow> = self.subscribers.iter().map(|email| UserRow { email: email.clone() }).collect();
        write_csv(&paths.users, &["email"], &user_rows)?;

        let writer_rows: Vec<WriterRow> = self
            .writers
            .iter()
            .map(|(email, w)| WriterRow { email: email.clone(), name: w.name.clone(), password: w.password_hash.clone() })
            .collect();
        write_csv(&paths.writers, &["email", "name", "password"], &writer_rows)?;

        let mut comment_rows = Vec::new();
        for post in self.posts.values() {
            for comment in &post.comments {
                comment_rows.push(CommentRow {
                    post_id: post.post_id.clone(),
                    email: comment.email.clone(),
                    text: comment.text.clone(),
                    timestamp: comment.timestamp.clone(),
                });
            }
        }
        write_csv(&paths.comments, &["post_id", "email", "text", "timestamp"], &comment_rows)?;

        Ok(())
    }

    /// Fresh, empty state machine for startup. The CSVs are write-only
    /// caches and are never read back as ground truth; the node rebuilds
    /// this state by replaying the committed log from index 1 before it
    /// begins serving (see `Node::bootstrap`).
    pub fn empty_for_replay() -> Self {
        StateMachine::new()
    }
}

/// Fixed-arity destructuring of a params slice; returns `None` (causing the
/// caller to skip the entry) on arity mismatch rather than panicking.
fn take<const N: usize>(params: &[String]) -> Option<[&String; N]> {
    if params.len() != N {
        return None;
    }
    let mut out: [&String; N] = [&params[0]; N];
    for i in 0..N {
        out[i] = &params[i];
    }
    Some(out)
}

pub fn splice_replica(peers: &mut Vec<ReplicaConfig>, json_config: &str) {
    if let Ok(new_peer) = serde_json::from_str::<ReplicaConfig>(json_config) {
        if !peers.iter().any(|p| p.id == new_peer.id) {
            peers.push(new_peer);
        }
    }
}

pub fn remove_replica(peers: &mut Vec<ReplicaConfig>, peer_id: &str) {
    peers.retain(|p| p.id != peer_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> String {
        "2026-01-01T00:00:00Z".to_string()
    }

    #[test]
    fn subscribe_then_create_account_then_post_flow() {
        let mut sm = StateMachine::new();
        sm.apply(&LogEntry::new(1, "SUBSCRIBE", vec!["ann@x".into()]), ts);
        sm.apply(&LogEntry::new(1, "CREATE_ACCOUNT", vec!["Ann".into(), "ann@x".into(), "hash".into()]), ts);
        sm.apply(
            &LogEntry::new(1, "CREATE_POST", vec!["p1".into(), "Hello".into(), "World".into(), "ann@x".into(), ts()]),
            ts,
        );

        assert!(sm.subscribers.contains("ann@x"));
        assert_eq!(sm.writer("ann@x").unwrap().name, "Ann");
        assert!(sm.get_post("p1").is_some());
    }

    #[test]
    fn duplicate_like_is_idempotent() {
        let mut sm = StateMachine::new();
        sm.apply(&LogEntry::new(1, "SUBSCRIBE", vec!["u@x".into()]), ts);
        sm.apply(&LogEntry::new(1, "CREATE_POST", vec!["p".into(), "t".into(), "c".into(), "u@x".into(), ts()]), ts);
        sm.apply(&LogEntry::new(1, "LIKE_POST", vec!["p".into(), "u@x".into()]), ts);
        sm.apply(&LogEntry::new(1, "LIKE_POST", vec!["p".into(), "u@x".into()]), ts);
        assert_eq!(sm.get_post("p").unwrap().likes.len(), 1);
    }

    #[test]
    fn delete_post_requires_matching_author() {
        let mut sm = StateMachine::new();
        sm.apply(&LogEntry::new(1, "CREATE_POST", vec!["p".into(), "t".into(), "c".into(), "ann@x".into(), ts()]), ts);
        sm.apply(&LogEntry::new(1, "DELETE_POST", vec!["p".into(), "someone-else@x".into()]), ts);
        assert!(sm.get_post("p").is_some());
        sm.apply(&LogEntry::new(1, "DELETE_POST", vec!["p".into(), "ann@x".into()]), ts);
        assert!(sm.get_post("p").is_none());
    }

    #[test]
    fn delete_account_cascades_to_authored_posts() {
        let mut sm = StateMachine::new();
        sm.apply(&LogEntry::new(1, "SUBSCRIBE", vec!["ann@x".into()]), ts);
        sm.apply(&LogEntry::new(1, "CREATE_POST", vec!["p".into(), "t".into(), "c".into(), "ann@x".into(), ts()]), ts);
        sm.apply(&LogEntry::new(1, "DELETE_ACCOUNT", vec!["ann@x".into()]), ts);
        assert!(!sm.subscribers.contains("ann@x"));
        assert!(sm.get_post("p").is_none());
    }

    #[test]
    fn malformed_arity_is_silently_skipped() {
        let mut sm = StateMachine::new();
        sm.apply(&LogEntry::new(1, "SUBSCRIBE", vec!["too".into(), "many".into()]), ts);
        assert!(sm.subscribers.is_empty());
    }

    #[test]
    fn unknown_operation_is_silently_skipped() {
        let mut sm = StateMachine::new();
        sm.apply(&LogEntry::new(1, "NOT_A_REAL_OP", vec!["x".into()]), ts);
        assert!(sm.posts.is_empty());
        assert!(sm.subscribers.is_empty());
    }

    #[test]
    fn apply_is_deterministic_given_same_committed_prefix() {
        let entries = vec![
            LogEntry::new(1, "SUBSCRIBE", vec!["a@x".into()]),
            LogEntry::new(1, "CREATE_POST", vec!["p".into(), "t".into(), "c".into(), "a@x".into(), ts()]),
            LogEntry::new(1, "LIKE_POST", vec!["p".into(), "a@x".into()]),
        ];

        let mut sm1 = StateMachine::new();
        for e in &entries {
            sm1.apply(e, ts);
        }
        let mut sm2 = StateMachine::new();
        for e in &entries {
            sm2.apply(e, ts);
        }

        assert_eq!(sm1.list_posts(), sm2.list_posts());
    }
}
