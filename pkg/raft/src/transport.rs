//! HTTP transport: the inter-node Raft RPCs and the client-facing
//! application API, both served from one `axum` router.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::{hash_password, validate_email, validate_password, verify_password};
use crate::node::Node;
use crate::protos::{
    AppResponse, AppendEntriesRequest, GetLeaderInfoResponse, Operation, RequestVoteRequest,
};
use crate::RaftError;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/raft/request_vote", post(request_vote))
        .route("/raft/append_entries", post(append_entries))
        .route("/raft/get_leader_info", get(get_leader_info))
        .route("/api/subscribe", post(subscribe))
        .route("/api/subscribers/:email", get(search_subscriber))
        .route("/api/login", post(login))
        .route("/api/account", post(create_account).delete(delete_account))
        .route("/api/posts", get(list_posts).post(create_post))
        .route("/api/posts/:post_id", get(get_post).delete(delete_post))
        .route("/api/posts/:post_id/comments", get(list_comments).post(comment_post))
        .route("/api/posts/:post_id/like", post(like_post))
        .route("/api/posts/:post_id/unlike", post(unlike_post))
        .route("/api/cluster/add_replica", post(add_replica))
        .route("/api/cluster/remove_replica", post(remove_replica))
        .with_state(node)
}

// ---- Raft RPC handlers -----------------------------------------------------

async fn request_vote(State(node): State<Arc<Node>>, Json(req): Json<RequestVoteRequest>) -> impl IntoResponse {
    Json(node.handle_request_vote(req).await)
}

async fn append_entries(State(node): State<Arc<Node>>, Json(req): Json<AppendEntriesRequest>) -> impl IntoResponse {
    Json(node.handle_append_entries(req).await)
}

async fn get_leader_info(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(GetLeaderInfoResponse { leader_id: node.get_leader_info().await })
}

// ---- Application RPC handlers ----------------------------------------------

impl IntoResponse for RaftError {
    fn into_response(self) -> Response {
        let status = match &self {
            RaftError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            RaftError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RaftError::Conflict(_) => StatusCode::CONFLICT,
            RaftError::NotFound(_) => StatusCode::NOT_FOUND,
            RaftError::ReplicationFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            RaftError::Transport { .. } => StatusCode::BAD_GATEWAY,
            RaftError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(AppResponse::fail(self.client_message()))).into_response()
    }
}

type ApiResult = Result<Json<AppResponse>, RaftError>;

#[derive(Deserialize)]
struct SubscribeBody {
    email: String,
}

async fn subscribe(State(node): State<Arc<Node>>, Json(body): Json<SubscribeBody>) -> ApiResult {
    validate_email(&body.email)?;
    node.propose(Operation::Subscribe.as_str(), vec![body.email]).await?;
    Ok(Json(AppResponse::ok("subscribed")))
}

async fn search_subscriber(State(node): State<Arc<Node>>, AxumPath(email): AxumPath<String>) -> ApiResult {
    match node.with_state_machine(|sm| sm.find_subscriber(&email)).await {
        Some(found) => Ok(Json(AppResponse::ok(found))),
        None => Err(RaftError::NotFound(format!("no such subscriber: {email}"))),
    }
}

#[derive(Deserialize)]
struct CreateAccountBody {
    name: String,
    email: String,
    password: String,
}

async fn create_account(State(node): State<Arc<Node>>, Json(body): Json<CreateAccountBody>) -> ApiResult {
    validate_email(&body.email)?;
    validate_password(&body.password)?;

    let already_used = node.with_state_machine(|sm| sm.email_in_use(&body.email)).await;
    if already_used {
        return Err(RaftError::Conflict(format!("email already in use: {}", body.email)));
    }

    let password_hash = hash_password(&body.password)?;
    node.propose(Operation::CreateAccount.as_str(), vec![body.name, body.email, password_hash]).await?;
    Ok(Json(AppResponse::ok("account created")))
}

#[derive(Deserialize)]
struct DeleteAccountBody {
    email: String,
}

async fn delete_account(State(node): State<Arc<Node>>, Json(body): Json<DeleteAccountBody>) -> ApiResult {
    node.propose(Operation::DeleteAccount.as_str(), vec![body.email]).await?;
    Ok(Json(AppResponse::ok("account deleted")))
}

#[derive(Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

async fn login(State(node): State<Arc<Node>>, Json(body): Json<LoginBody>) -> ApiResult {
    // Pure read; served by any node regardless of leadership.
    let hash = node.with_state_machine(|sm| sm.writer(&body.email).map(|w| w.password_hash.clone())).await;
    match hash {
        Some(hash) if verify_password(&body.password, &hash) => Ok(Json(AppResponse::ok("login ok"))),
        _ => Err(RaftError::BadRequest("invalid email or password".into())),
    }
}

#[derive(Deserialize)]
struct CreatePostBody {
    title: String,
    content: String,
    author: String,
}

async fn create_post(State(node): State<Arc<Node>>, Json(body): Json<CreatePostBody>) -> ApiResult {
    let author_known = node.with_state_machine(|sm| sm.writer(&body.author).is_some()).await;
    if !author_known {
        return Err(RaftError::NotFound(format!("no such writer: {}", body.author)));
    }

    let post_id = uuid::Uuid::new_v4().to_string();
    let timestamp = chrono::Utc::now().to_rfc3339();
    node.propose(
        Operation::CreatePost.as_str(),
        vec![post_id.clone(), body.title, body.content, body.author, timestamp],
    )
    .await?;
    Ok(Json(AppResponse::ok(post_id)))
}

async fn list_posts(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let posts = node.with_state_machine(|sm| sm.list_posts()).await;
    Json(AppResponse::ok_with_posts("ok", posts))
}

async fn get_post(State(node): State<Arc<Node>>, AxumPath(post_id): AxumPath<String>) -> ApiResult {
    let post = node.with_state_machine(|sm| sm.get_post(&post_id)).await;
    match post {
        Some(post) => Ok(Json(AppResponse::ok_with_posts("ok", vec![post]))),
        None => Err(RaftError::NotFound(format!("no such post: {post_id}"))),
    }
}

async fn delete_post(
    State(node): State<Arc<Node>>,
    AxumPath(post_id): AxumPath<String>,
    Json(body): Json<DeletePostBody>,
) -> ApiResult {
    node.propose(Operation::DeletePost.as_str(), vec![post_id, body.author]).await?;
    Ok(Json(AppResponse::ok("post deleted")))
}

#[derive(Deserialize)]
struct DeletePostBody {
    author: String,
}

#[derive(Deserialize)]
struct CommentBody {
    email: String,
    text: String,
}

async fn comment_post(
    State(node): State<Arc<Node>>,
    AxumPath(post_id): AxumPath<String>,
    Json(body): Json<CommentBody>,
) -> ApiResult {
    let post_exists = node.with_state_machine(|sm| sm.get_post(&post_id).is_some()).await;
    if !post_exists {
        return Err(RaftError::NotFound(format!("no such post: {post_id}")));
    }
    node.propose(Operation::CommentPost.as_str(), vec![post_id, body.email, body.text]).await?;
    Ok(Json(AppResponse::ok("comment added")))
}

async fn list_comments(State(node): State<Arc<Node>>, AxumPath(post_id): AxumPath<String>) -> impl IntoResponse {
    let comments = node.with_state_machine(|sm| sm.list_comments(&post_id)).await;
    Json(comments)
}

#[derive(Deserialize)]
struct LikeBody {
    email: String,
}

async fn like_post(
    State(node): State<Arc<Node>>,
    AxumPath(post_id): AxumPath<String>,
    Json(body): Json<LikeBody>,
) -> ApiResult {
    let (post_exists, already_liked) = node
        .with_state_machine(|sm| {
            let post = sm.get_post(&post_id);
            let liked = post.as_ref().is_some_and(|p| p.likes.contains(&body.email));
            (post.is_some(), liked)
        })
        .await;
    if !post_exists {
        return Err(RaftError::NotFound(format!("no such post: {post_id}")));
    }
    if already_liked {
        return Err(RaftError::Conflict("post already liked".into()));
    }
    node.propose(Operation::LikePost.as_str(), vec![post_id, body.email]).await?;
    Ok(Json(AppResponse::ok("liked")))
}

async fn unlike_post(
    State(node): State<Arc<Node>>,
    AxumPath(post_id): AxumPath<String>,
    Json(body): Json<LikeBody>,
) -> ApiResult {
    let already_liked = node
        .with_state_machine(|sm| sm.get_post(&post_id).is_some_and(|p| p.likes.contains(&body.email)))
        .await;
    if !already_liked {
        return Err(RaftError::Conflict("post not liked".into()));
    }
    node.propose(Operation::UnlikePost.as_str(), vec![post_id, body.email]).await?;
    Ok(Json(AppResponse::ok("unliked")))
}

#[derive(Deserialize)]
struct AddReplicaBody {
    config: crate::protos::ReplicaConfig,
}

async fn add_replica(State(node): State<Arc<Node>>, Json(body): Json<AddReplicaBody>) -> ApiResult {
    let json_config = serde_json::to_string(&body.config)
        .map_err(|e| RaftError::BadRequest(format!("invalid replica config: {e}")))?;
    node.propose(Operation::AddReplica.as_str(), vec![json_config]).await?;
    Ok(Json(AppResponse::ok("replica added")))
}

#[derive(Deserialize)]
struct RemoveReplicaBody {
    id: String,
}

async fn remove_replica(State(node): State<Arc<Node>>, Json(body): Json<RemoveReplicaBody>) -> ApiResult {
    node.propose(Operation::RemoveReplica.as_str(), vec![body.id]).await?;
    Ok(Json(AppResponse::ok("replica removed")))
}
