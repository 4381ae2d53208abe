//! Loopback REST control plane consumed by the local agent.
//!
//! Without an API key the plane binds loopback only. With one it binds all
//! interfaces and every route except /health and the agent card requires
//! `Authorization: Bearer <key>`, compared in constant time.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde_json::{json, Value};

use kizuna_protocol::envelope::now_ms;
use kizuna_protocol::task::TaskStatus;

use crate::overlay::{join_topic, leave_topic};
use crate::state::Node;
use crate::store::MEMORY_READ_LIMIT;
use crate::tasks::{self, RespondError, SubmitOutcome, SubmitRequest};
use crate::a2a;

pub async fn serve(node: Arc<Node>) -> anyhow::Result<()> {
    let addr = node.config.http_addr();
    let router = router(node);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("control plane listening on http://{addr}");
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/manifest", post(update_manifest))
        .route("/peers", get(peers))
        .route("/inbox", get(inbox))
        .route("/broadcast", post(broadcast))
        .route("/memory", post(memory_append).get(memory_read))
        .route("/storage", post(storage_put).get(storage_list))
        .route("/storage/{name}", get(storage_get))
        .route("/join", post(join))
        .route("/leave", post(leave))
        .route("/topics", get(topics))
        .route("/entropy", post(entropy))
        .route("/task/request", post(task_request))
        .route("/task/respond", post(task_respond))
        .route("/task/status/{task_id}", get(task_status))
        .route("/task/retry/{task_id}", post(task_retry))
        .route("/tasks", get(tasks_all))
        .route("/tasks/queued", get(tasks_queued))
        .route("/tasks/failed", get(tasks_failed))
        .route("/capabilities/search", get(capability_search))
        .route("/stats", get(stats))
        .route("/.well-known/agent-card.json", get(a2a::agent_card_handler))
        .route("/a2a/v1", post(a2a::rpc_handler))
        .layer(middleware::from_fn_with_state(node.clone(), require_auth))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(node)
}

// ============================================================================
// Auth
// ============================================================================

/// Routes that stay public even when an API key is configured.
const PUBLIC_PATHS: &[&str] = &["/health", "/.well-known/agent-card.json"];

async fn require_auth(
    State(node): State<Arc<Node>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(ref key) = node.config.api_key {
        if !PUBLIC_PATHS.contains(&req.uri().path()) {
            let expected = format!("Bearer {key}");
            let provided = req
                .headers()
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !ct_eq(provided, &expected) {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "unauthorized" })),
                )
                    .into_response();
            }
        }
    }
    next.run(req).await
}

fn ct_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let len = a.len().max(b.len());
    let mut diff: u8 = (a.len() ^ b.len()) as u8;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

fn bad_request(msg: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.to_string() })))
}

fn not_found(msg: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": msg })))
}

// ============================================================================
// Identity & liveness
// ============================================================================

async fn health(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": (now_ms() - node.started_at) / 1000,
    }))
}

async fn info(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({
        "peerId": node.identity.public_key,
        "shortId": node.identity.short_id,
        "manifest": &*node.manifest.read().await,
        "startedAt": node.started_at,
    }))
}

async fn stats(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({
        "active": node.peers.read().await.len(),
        "uptime": (now_ms() - node.started_at) / 1000,
        "observed": node.observed_peers.lock().await.len(),
    }))
}

/// Merge manifest fields, then re-announce with a fresh signed handshake.
async fn update_manifest(
    State(node): State<Arc<Node>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    {
        let mut manifest = node.manifest.write().await;
        if let Some(role) = body.get("role").and_then(Value::as_str) {
            manifest.role = role.to_string();
        }
        if let Some(skills) = body.get("skills").and_then(Value::as_array) {
            manifest.skills = skills
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(agent_id) = body.get("agent_id").and_then(Value::as_str) {
            manifest.agent_id = agent_id.to_string();
        }
        if let Some(specs) = body.get("specs") {
            manifest.specs = Some(specs.clone());
        }
    }

    let env = node.handshake_envelope().await;
    let announced = node.broadcast(&env).await;
    tracing::info!(announced, "manifest updated and re-broadcast");

    (
        StatusCode::OK,
        Json(json!({
            "manifest": &*node.manifest.read().await,
            "announced": announced,
        })),
    )
}

// ============================================================================
// Peers & messaging
// ============================================================================

async fn peers(State(node): State<Arc<Node>>) -> Json<Value> {
    let details = node.peer_snapshots().await;
    Json(json!({ "count": details.len(), "details": details }))
}

async fn inbox(State(node): State<Arc<Node>>) -> Json<Value> {
    let messages = node.drain_inbox().await;
    Json(json!({ "count": messages.len(), "messages": messages }))
}

async fn broadcast(
    State(node): State<Arc<Node>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(content) = body.get("content") else {
        return bad_request("content is required");
    };
    let env = node.identity.sign(content);
    let sent_to = node.broadcast(&env).await;
    // Loopback: the local inbox sees every broadcast too.
    node.push_inbox(&node.identity.public_key, content.clone()).await;
    (StatusCode::OK, Json(json!({ "sent_to": sent_to })))
}

async fn capability_search(
    State(node): State<Arc<Node>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let skill = params.get("skill").map(String::as_str);
    let role = params.get("role").map(String::as_str);

    let mut matches = Vec::new();
    for snap in node.peer_snapshots().await {
        if let Some(manifest) = snap.manifest {
            if manifest.matches(skill, role) {
                matches.push(json!({
                    "peer_id": snap.short_id,
                    "agent_id": manifest.agent_id,
                    "role": manifest.role,
                    "skills": manifest.skills,
                }));
            }
        }
    }
    Json(json!({ "count": matches.len(), "matches": matches }))
}

// ============================================================================
// Shared memory & storage (delegated to the external stores)
// ============================================================================

async fn memory_append(
    State(node): State<Arc<Node>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(content) = body.get("content") else {
        return bad_request("content is required");
    };
    match node.memory.append(content) {
        Ok(length) => (StatusCode::OK, Json(json!({ "length": length }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn memory_read(State(node): State<Arc<Node>>) -> (StatusCode, Json<Value>) {
    match node.memory.read_recent(MEMORY_READ_LIMIT) {
        Ok(memory) => (StatusCode::OK, Json(json!({ "memory": memory }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn storage_put(
    State(node): State<Arc<Node>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(name) = body.get("name").and_then(Value::as_str) else {
        return bad_request("name is required");
    };
    let Some(data_b64) = body.get("data").and_then(Value::as_str) else {
        return bad_request("data is required (base64)");
    };
    let bytes = match B64.decode(data_b64) {
        Ok(b) => b,
        Err(_) => return bad_request("data: invalid base64"),
    };
    match node.drive.put(name, &bytes) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "name": name, "size": bytes.len() })),
        ),
        Err(e) => bad_request(e),
    }
}

async fn storage_list(State(node): State<Arc<Node>>) -> (StatusCode, Json<Value>) {
    match node.drive.list() {
        Ok(files) => (StatusCode::OK, Json(json!({ "files": files }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn storage_get(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    match node.drive.get(&name) {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            Json(json!({ "name": name, "data": B64.encode(&bytes) })),
        ),
        Ok(None) => not_found("no such file"),
        Err(e) => bad_request(e),
    }
}

// ============================================================================
// Topics
// ============================================================================

async fn join(
    State(node): State<Arc<Node>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(topic) = body.get("topic").and_then(Value::as_str) else {
        return bad_request("topic is required");
    };
    let secret = body.get("secret").and_then(Value::as_str);
    let entry = join_topic(&node, topic, secret).await;
    (
        StatusCode::OK,
        Json(json!({
            "topic": topic,
            "private": entry.private,
            "topicHash": entry.topic_hash,
            "joinedAt": entry.joined_at,
        })),
    )
}

async fn leave(
    State(node): State<Arc<Node>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(topic) = body.get("topic").and_then(Value::as_str) else {
        return bad_request("topic is required");
    };
    match leave_topic(&node, topic).await {
        Ok(left) => (StatusCode::OK, Json(json!({ "topic": topic, "left": left }))),
        Err(msg) => bad_request(msg),
    }
}

async fn topics(State(node): State<Arc<Node>>) -> Json<Value> {
    let topics = node.topics.read().await;
    let list: Vec<Value> = topics
        .iter()
        .map(|(name, entry)| {
            json!({
                "name": name,
                "private": entry.private,
                "joinedAt": entry.joined_at,
                "hashPrefix": &entry.topic_hash[..8],
            })
        })
        .collect();
    Json(json!({ "count": list.len(), "topics": list }))
}

async fn entropy(
    State(node): State<Arc<Node>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(enabled) = body.get("enabled").and_then(Value::as_bool) else {
        return bad_request("enabled is required (boolean)");
    };
    node.entropy_enabled.store(enabled, Ordering::Relaxed);
    tracing::info!(enabled, "entropy reaper toggled");
    (StatusCode::OK, Json(json!({ "enabled": enabled })))
}

// ============================================================================
// Tasks
// ============================================================================

async fn task_request(
    State(node): State<Arc<Node>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let req = match SubmitRequest::from_value(&body) {
        Ok(req) => req,
        Err(e) => return bad_request(e),
    };
    match tasks::submit(&node, req).await {
        Ok(SubmitOutcome::Sent { task_id, target, sent_to }) => (
            StatusCode::OK,
            Json(json!({
                "task_id": task_id,
                "status": "sent",
                "target": target,
                "sent_to": sent_to,
            })),
        ),
        Ok(SubmitOutcome::Queued { task_id, target, next_retry_time }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "task_id": task_id,
                "status": "queued_for_retry",
                "target": target,
                "nextRetryTime": next_retry_time,
            })),
        ),
        Err(e) => bad_request(e),
    }
}

async fn task_respond(
    State(node): State<Arc<Node>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(task_id) = body.get("task_id").and_then(Value::as_str) else {
        return bad_request("task_id is required");
    };
    let status: TaskStatus = match body.get("status").map(|v| serde_json::from_value(v.clone())) {
        Some(Ok(s)) => s,
        _ => return bad_request("status must be one of accepted|rejected|in_progress|completed|failed"),
    };
    let result = body.get("result").filter(|v| !v.is_null()).cloned();
    let error = body.get("error").filter(|v| !v.is_null()).cloned();

    match tasks::respond(&node, task_id, status, result, error).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "task_id": task_id,
                "status": outcome.status,
                "sent_to_requester": outcome.sent_to_requester,
            })),
        ),
        Err(RespondError::UnknownTask) => not_found("no such received task"),
        Err(RespondError::InvalidStatus) => {
            bad_request("status must be one of accepted|rejected|in_progress|completed|failed")
        }
    }
}

async fn task_status(
    State(node): State<Arc<Node>>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    if let Some(task) = node.sent_tasks.read().await.get(&task_id) {
        let mut v = serde_json::to_value(task).unwrap_or_default();
        v["direction"] = json!("sent");
        return (StatusCode::OK, Json(v));
    }
    if let Some(task) = node.received_tasks.read().await.get(&task_id) {
        let mut v = serde_json::to_value(task).unwrap_or_default();
        v["direction"] = json!("received");
        return (StatusCode::OK, Json(v));
    }
    if let Some(task) = node.dead_letter.read().await.get(&task_id) {
        let mut v = serde_json::to_value(task).unwrap_or_default();
        v["direction"] = json!("failed");
        return (StatusCode::OK, Json(v));
    }
    not_found("no such task")
}

async fn task_retry(
    State(node): State<Arc<Node>>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    if tasks::requeue(&node, &task_id).await {
        (
            StatusCode::OK,
            Json(json!({ "task_id": task_id, "status": "queued_for_retry" })),
        )
    } else {
        not_found("no such dead-lettered task")
    }
}

fn newest_first(mut list: Vec<Value>) -> Vec<Value> {
    list.sort_by_key(|v| std::cmp::Reverse(v["createdAt"].as_u64().unwrap_or(0)));
    list
}

async fn sent_view(node: &Node) -> Vec<Value> {
    newest_first(
        node.sent_tasks
            .read()
            .await
            .values()
            .map(|t| serde_json::to_value(t).unwrap_or_default())
            .collect(),
    )
}

async fn queued_view(node: &Node) -> Vec<Value> {
    newest_first(
        node.sent_tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::QueuedForRetry)
            .map(|t| serde_json::to_value(t).unwrap_or_default())
            .collect(),
    )
}

async fn failed_view(node: &Node) -> Vec<Value> {
    newest_first(
        node.dead_letter
            .read()
            .await
            .values()
            .map(|t| serde_json::to_value(t).unwrap_or_default())
            .collect(),
    )
}

async fn tasks_all(State(node): State<Arc<Node>>) -> Json<Value> {
    let sent = sent_view(&node).await;
    let received = newest_first(
        node.received_tasks
            .read()
            .await
            .values()
            .map(|t| serde_json::to_value(t).unwrap_or_default())
            .collect(),
    );
    let queued = queued_view(&node).await;
    let failed = failed_view(&node).await;
    Json(json!({
        "sent": { "count": sent.len(), "tasks": sent },
        "received": { "count": received.len(), "tasks": received },
        "queued": { "count": queued.len(), "tasks": queued },
        "failed": { "count": failed.len(), "tasks": failed },
    }))
}

async fn tasks_queued(State(node): State<Arc<Node>>) -> Json<Value> {
    let queued = queued_view(&node).await;
    Json(json!({ "count": queued.len(), "tasks": queued }))
}

async fn tasks_failed(State(node): State<Arc<Node>>) -> Json<Value> {
    let failed = failed_view(&node).await;
    Json(json!({ "count": failed.len(), "tasks": failed }))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ct_eq_matches_exactly() {
        assert!(ct_eq("Bearer abc", "Bearer abc"));
        assert!(!ct_eq("Bearer abc", "Bearer abd"));
        assert!(!ct_eq("Bearer ab", "Bearer abc"));
        assert!(!ct_eq("", "Bearer abc"));
    }

    #[test]
    fn newest_first_orders_by_created_at() {
        let sorted = newest_first(vec![
            json!({ "id": "old", "createdAt": 100 }),
            json!({ "id": "new", "createdAt": 300 }),
            json!({ "id": "mid", "createdAt": 200 }),
        ]);
        let ids: Vec<_> = sorted.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["new", "mid", "old"]);
    }
}
