//! A2A gateway: the agent card plus a JSON-RPC 2.0 projection of the KTP
//! task tables onto the externally specified task schema.

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::DateTime;
use serde_json::{json, Value};

use kizuna_protocol::{task::TaskStatus, PROTOCOL_TAG};

use crate::state::Node;
use crate::tasks::{self, DeadLetterTask, ReceivedTask, SentTask, SubmitOutcome, SubmitRequest};

/// A2A protocol revision declared in the agent card.
const A2A_PROTOCOL_VERSION: &str = "0.3.0";

// --- JSON-RPC error codes ---------------------------------------------------

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const TASK_NOT_FOUND: i64 = -32001;
pub const TASK_NOT_CANCELABLE: i64 = -32002;
pub const UNSUPPORTED_OPERATION: i64 = -32003;

const SUPPORTED_METHODS: &[&str] = &["message/send", "tasks/get", "tasks/list"];

// ============================================================================
// Agent card
// ============================================================================

pub async fn agent_card_handler(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(agent_card(&node).await)
}

pub async fn agent_card(node: &Node) -> Value {
    let manifest = node.manifest.read().await.clone();

    let skills: Vec<Value> = manifest
        .skills
        .iter()
        .map(|skill| {
            json!({
                "id": skill,
                "name": skill,
                "description": format!("{skill} capability"),
                "inputModes": ["text/plain"],
                "outputModes": ["text/plain"],
            })
        })
        .collect();

    let mut card = json!({
        "protocolVersion": A2A_PROTOCOL_VERSION,
        "name": manifest.agent_id,
        "description": "Kizuna bridge node: peer-to-peer task delegation over the KTP overlay",
        "url": node.config.a2a_url(),
        "preferredTransport": "JSONRPC",
        "capabilities": {
            "streaming": false,
            "pushNotifications": false,
            "extensions": [{
                "uri": "urn:kizuna:ktp",
                "params": {
                    "shortId": node.identity.short_id,
                    "role": manifest.role,
                    "protocol": PROTOCOL_TAG,
                },
            }],
        },
        "defaultInputModes": ["text/plain"],
        "defaultOutputModes": ["text/plain"],
        "skills": skills,
    });

    if node.config.api_key.is_some() {
        card["securitySchemes"] = json!({
            "bearer": { "type": "http", "scheme": "bearer" }
        });
        card["security"] = json!([{ "bearer": [] }]);
    }

    card
}

// ============================================================================
// JSON-RPC dispatch
// ============================================================================

pub async fn rpc_handler(State(node): State<Arc<Node>>, body: String) -> Json<Value> {
    Json(handle_rpc(&node, &body).await)
}

/// Dispatch one JSON-RPC request body. Always an HTTP 200; failures travel
/// in the JSON-RPC error object.
pub async fn handle_rpc(node: &Arc<Node>, body: &str) -> Value {
    let req: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return error_response(Value::Null, PARSE_ERROR, "parse error", None),
    };
    let id = req.get("id").cloned().unwrap_or(Value::Null);

    if req.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return error_response(id, INVALID_REQUEST, "jsonrpc must be \"2.0\"", None);
    }
    let Some(method) = req.get("method").and_then(Value::as_str) else {
        return error_response(id, INVALID_REQUEST, "method is required", None);
    };
    let params = req.get("params").cloned().unwrap_or(Value::Null);

    match method {
        "message/send" => message_send(node, id, params).await,
        "tasks/get" => tasks_get(node, id, params).await,
        "tasks/list" => tasks_list(node, id, params).await,
        "tasks/cancel" => error_response(
            id,
            TASK_NOT_CANCELABLE,
            "KTP tasks cannot be canceled once dispatched",
            None,
        ),
        "message/stream" => error_response(
            id,
            UNSUPPORTED_OPERATION,
            "streaming is not supported by this node",
            None,
        ),
        other => error_response(
            id,
            METHOD_NOT_FOUND,
            &format!("unknown method: {other}"),
            Some(json!({ "supported": SUPPORTED_METHODS })),
        ),
    }
}

fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

// ============================================================================
// Methods
// ============================================================================

/// Translate an A2A message into a KTP task: text parts concatenate into the
/// description, everything else rides along as opaque context.
async fn message_send(node: &Arc<Node>, id: Value, params: Value) -> Value {
    let Some(message) = params.get("message").filter(|m| m.is_object()) else {
        return error_response(id, INVALID_PARAMS, "params.message is required", None);
    };
    let Some(parts) = message.get("parts").and_then(Value::as_array) else {
        return error_response(id, INVALID_PARAMS, "message.parts must be an array", None);
    };

    let texts: Vec<&str> = parts
        .iter()
        .filter(|p| p.get("kind").and_then(Value::as_str) == Some("text"))
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        return error_response(id, INVALID_PARAMS, "message has no text parts", None);
    }
    let description = texts.join("\n");

    let non_text: Vec<&Value> = parts
        .iter()
        .filter(|p| p.get("kind").and_then(Value::as_str) != Some("text"))
        .collect();

    let req = SubmitRequest {
        description,
        context: json!({
            "a2aMessage": message,
            "nonTextParts": non_text,
        }),
        task_type: Default::default(),
        priority: Default::default(),
        target: params
            .get("target")
            .and_then(Value::as_str)
            .map(str::to_string),
        deadline: None,
        context_id: params
            .get("contextId")
            .and_then(Value::as_str)
            .map(str::to_string),
        a2a_source: true,
    };

    let task_id = match tasks::submit(node, req).await {
        Ok(SubmitOutcome::Sent { task_id, .. }) | Ok(SubmitOutcome::Queued { task_id, .. }) => {
            task_id
        }
        Err(e) => return error_response(id, INVALID_PARAMS, &e.to_string(), None),
    };

    match node.sent_tasks.read().await.get(&task_id) {
        Some(task) => result_response(id, json!({ "task": project_sent(task) })),
        None => error_response(id, INTERNAL_ERROR, "task vanished after submit", None),
    }
}

async fn tasks_get(node: &Arc<Node>, id: Value, params: Value) -> Value {
    let Some(task_id) = params.get("taskId").and_then(Value::as_str) else {
        return error_response(id, INVALID_PARAMS, "params.taskId is required", None);
    };

    if let Some(task) = node.sent_tasks.read().await.get(task_id) {
        return result_response(id, json!({ "task": project_sent(task) }));
    }
    if let Some(task) = node.received_tasks.read().await.get(task_id) {
        return result_response(id, json!({ "task": project_received(task) }));
    }
    if let Some(task) = node.dead_letter.read().await.get(task_id) {
        return result_response(id, json!({ "task": project_dead(task) }));
    }
    error_response(id, TASK_NOT_FOUND, "task not found", None)
}

async fn tasks_list(node: &Arc<Node>, id: Value, params: Value) -> Value {
    let state_filter = params.get("state").and_then(Value::as_str);
    let context_filter = params.get("contextId").and_then(Value::as_str);

    // (createdAt, projection) so the merge can sort before shipping.
    let mut entries: Vec<(u64, Value)> = Vec::new();
    for task in node.sent_tasks.read().await.values() {
        entries.push((task.created_at, project_sent(task)));
    }
    for task in node.received_tasks.read().await.values() {
        entries.push((task.created_at, project_received(task)));
    }
    for task in node.dead_letter.read().await.values() {
        entries.push((task.task.created_at, project_dead(task)));
    }
    entries.sort_by_key(|(created_at, _)| std::cmp::Reverse(*created_at));

    let tasks: Vec<Value> = entries
        .into_iter()
        .map(|(_, v)| v)
        .filter(|v| {
            state_filter.is_none_or(|s| v["status"]["state"].as_str() == Some(s))
                && context_filter.is_none_or(|c| v["contextId"].as_str() == Some(c))
        })
        .collect();

    result_response(id, json!({ "tasks": tasks }))
}

// ============================================================================
// Projection
// ============================================================================

/// KTP → A2A state mapping.
pub fn a2a_state(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "submitted",
        TaskStatus::QueuedForRetry | TaskStatus::Accepted | TaskStatus::InProgress => "working",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Rejected => "rejected",
    }
}

fn iso8601(ms: u64) -> String {
    DateTime::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .to_rfc3339()
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn project(
    task_id: &str,
    context_id: Option<&str>,
    status: TaskStatus,
    created_at: u64,
    status_message: Option<String>,
    result: Option<&Value>,
    description: &str,
    history_role: &str,
    metadata: Value,
) -> Value {
    let mut status_obj = json!({
        "state": a2a_state(status),
        "timestamp": iso8601(created_at),
    });
    if let Some(text) = status_message {
        status_obj["message"] = json!({
            "kind": "message",
            "role": "agent",
            "messageId": format!("status-{task_id}"),
            "parts": [{ "kind": "text", "text": text }],
        });
    }

    let artifacts: Vec<Value> = match result {
        Some(Value::String(text)) => vec![json!({
            "artifactId": format!("artifact-{task_id}"),
            "name": "result",
            "parts": [{ "kind": "text", "text": text }],
        })],
        Some(data) => vec![json!({
            "artifactId": format!("artifact-{task_id}"),
            "name": "result",
            "parts": [{ "kind": "data", "data": data }],
        })],
        None => Vec::new(),
    };

    json!({
        "id": task_id,
        "contextId": context_id.unwrap_or(task_id),
        "kind": "task",
        "status": status_obj,
        "artifacts": artifacts,
        "history": [{
            "kind": "message",
            "messageId": format!("msg-{task_id}"),
            "role": history_role,
            "parts": [{ "kind": "text", "text": description }],
        }],
        "metadata": metadata,
    })
}

pub fn project_sent(task: &SentTask) -> Value {
    project(
        &task.task_id,
        task.context_id.as_deref(),
        task.status,
        task.created_at,
        task.error.as_ref().map(text_of),
        task.result.as_ref(),
        &task.payload.description,
        "user",
        json!({
            "direction": "sent",
            "target": task.target,
            "taskType": task.task_type,
            "ktpStatus": task.status,
            "createdAt": task.created_at,
            "completedAt": task.completed_at,
            "deadline": task.deadline,
        }),
    )
}

pub fn project_received(task: &ReceivedTask) -> Value {
    project(
        &task.task_id,
        None,
        task.status,
        task.created_at,
        task.error.as_ref().map(text_of),
        task.result.as_ref(),
        &task.payload.description,
        "assistant",
        json!({
            "direction": "received",
            "target": task.from_short_id,
            "taskType": task.task_type,
            "ktpStatus": task.status,
            "createdAt": task.created_at,
            "completedAt": Value::Null,
            "deadline": task.deadline,
        }),
    )
}

pub fn project_dead(dead: &DeadLetterTask) -> Value {
    let task = &dead.task;
    project(
        &task.task_id,
        task.context_id.as_deref(),
        task.status,
        task.created_at,
        Some(dead.failure_reason.clone()),
        task.result.as_ref(),
        &task.payload.description,
        "user",
        json!({
            "direction": "failed",
            "target": task.target,
            "taskType": task.task_type,
            "ktpStatus": task.status,
            "createdAt": task.created_at,
            "completedAt": task.completed_at,
            "deadline": task.deadline,
        }),
    )
}

// ============================================================================
// Tests
// ============================================================================
