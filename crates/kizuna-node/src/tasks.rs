//! Kizuna Task Protocol engine: the sent / received / dead-letter tables and
//! every transition over them.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use kizuna_protocol::{
    envelope::now_ms,
    keys,
    message::{PeerMessage, TaskRequestMsg, TaskResponseMsg},
    task::{
        attempts_exhausted, retry_backoff_ms, Priority, TaskPayload, TaskStatus, TaskType,
        MAX_CONTEXT_BYTES, MAX_DESCRIPTION_BYTES,
    },
};

use crate::state::Node;

// ============================================================================
// Table records
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentTask {
    #[serde(rename = "task_id")]
    pub task_id: String,
    /// Short id, agent name, or `"*"` for broadcast.
    pub target: String,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    #[serde(rename = "task_type")]
    pub task_type: TaskType,
    pub created_at: u64,
    pub deadline: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub a2a_source: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedTask {
    #[serde(rename = "task_id")]
    pub task_id: String,
    /// Full public key of the requester, taken from the envelope.
    pub from: String,
    pub from_short_id: String,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    #[serde(rename = "task_type")]
    pub task_type: TaskType,
    pub created_at: u64,
    pub deadline: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterTask {
    #[serde(flatten)]
    pub task: SentTask,
    pub failure_reason: String,
    pub failed_at: u64,
}

// ============================================================================
// Submission
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InvalidTask(pub String);

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub description: String,
    pub context: Value,
    pub task_type: TaskType,
    pub priority: Priority,
    pub target: Option<String>,
    pub deadline: Option<u64>,
    pub context_id: Option<String>,
    pub a2a_source: bool,
}

impl SubmitRequest {
    /// Parse a control-plane request body.
    pub fn from_value(body: &Value) -> Result<Self, InvalidTask> {
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .ok_or_else(|| InvalidTask("description is required".into()))?
            .to_string();

        let task_type = match body.get("task_type") {
            None | Some(Value::Null) => TaskType::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|_| InvalidTask(format!("invalid task_type: {v}")))?,
        };
        let priority = match body.get("priority") {
            None | Some(Value::Null) => Priority::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|_| InvalidTask(format!("invalid priority: {v}")))?,
        };
        let deadline = match body.get("deadline") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| InvalidTask("deadline must be a unix ms timestamp".into()))?,
            ),
        };

        Ok(Self {
            description,
            context: body.get("context").cloned().unwrap_or(Value::Null),
            task_type,
            priority,
            target: body
                .get("target")
                .and_then(Value::as_str)
                .map(str::to_string),
            deadline,
            context_id: None,
            a2a_source: false,
        })
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Delivered to at least the wire; broadcast counts live peers reached.
    Sent { task_id: String, target: String, sent_to: usize },
    /// No matching live peer; parked for the retry reaper.
    Queued { task_id: String, target: String, next_retry_time: u64 },
}

/// Validate, sign, and dispatch a new outbound task.
pub async fn submit(node: &Arc<Node>, req: SubmitRequest) -> Result<SubmitOutcome, InvalidTask> {
    if req.description.is_empty() {
        return Err(InvalidTask("description is required".into()));
    }
    if req.description.len() > MAX_DESCRIPTION_BYTES {
        return Err(InvalidTask(format!(
            "description exceeds {MAX_DESCRIPTION_BYTES} bytes"
        )));
    }
    if !req.context.is_null() && req.context.to_string().len() > MAX_CONTEXT_BYTES {
        return Err(InvalidTask(format!(
            "serialised context exceeds {MAX_CONTEXT_BYTES} bytes"
        )));
    }

    let now = now_ms();
    let task_id = Uuid::new_v4().to_string();
    // Empty and "*" targets both mean broadcast.
    let direct_target = req
        .target
        .clone()
        .filter(|t| !t.is_empty() && t != "*");

    let mut task = SentTask {
        task_id: task_id.clone(),
        target: direct_target.clone().unwrap_or_else(|| "*".to_string()),
        status: TaskStatus::Pending,
        payload: TaskPayload {
            description: req.description,
            context: req.context,
            priority: req.priority,
        },
        task_type: req.task_type,
        created_at: now,
        deadline: req.deadline,
        result: None,
        error: None,
        attempt_count: 0,
        last_attempt_at: None,
        next_retry_time: None,
        responder: None,
        completed_at: None,
        context_id: req.context_id,
        a2a_source: req.a2a_source,
    };

    let env = node.identity.sign(&request_message(&task, &node.identity.short_id).to_value());

    let outcome = match direct_target {
        Some(target) => {
            let delivered = match node.find_peer_key(&target).await {
                Some(peer_key) => node.send_to_peer(&peer_key, &env).await.is_ok(),
                None => false,
            };
            if delivered {
                task.attempt_count = 1;
                task.last_attempt_at = Some(now);
                tracing::info!(task = %task_id, to = %target, "task delivered");
                SubmitOutcome::Sent { task_id: task_id.clone(), target, sent_to: 1 }
            } else {
                task.status = TaskStatus::QueuedForRetry;
                task.attempt_count = 1;
                let next_retry_time = now + retry_backoff_ms(1);
                task.next_retry_time = Some(next_retry_time);
                tracing::info!(task = %task_id, to = %target, "target offline, task queued for retry");
                SubmitOutcome::Queued { task_id: task_id.clone(), target, next_retry_time }
            }
        }
        None => {
            let sent_to = node.broadcast(&env).await;
            task.attempt_count = 1;
            task.last_attempt_at = Some(now);
            tracing::info!(task = %task_id, sent_to, "task broadcast");
            SubmitOutcome::Sent { task_id: task_id.clone(), target: "*".to_string(), sent_to }
        }
    };

    node.sent_tasks.write().await.insert(task_id, task);
    Ok(outcome)
}

fn request_message(task: &SentTask, sender_short: &str) -> PeerMessage {
    PeerMessage::TaskRequest(TaskRequestMsg {
        task_id: task.task_id.clone(),
        task_type: task.task_type,
        payload: task.payload.clone(),
        deadline: task.deadline,
        sender: sender_short.to_string(),
    })
}

// ============================================================================
// Inbound wire transitions (called from the session dispatcher)
// ============================================================================

/// Install a received task. Retransmissions of a known task id keep the
/// existing entry so local progress is not reset.
pub async fn handle_task_request(node: &Node, from: &str, msg: TaskRequestMsg) {
    let mut received = node.received_tasks.write().await;
    if received.contains_key(&msg.task_id) {
        tracing::debug!(task = %msg.task_id, "duplicate task_request ignored");
        return;
    }
    tracing::info!(task = %msg.task_id, from = %keys::short_id(from), "task_request received");
    received.insert(
        msg.task_id.clone(),
        ReceivedTask {
            task_id: msg.task_id,
            from: from.to_string(),
            from_short_id: keys::short_id(from).to_string(),
            status: TaskStatus::Pending,
            payload: msg.payload,
            task_type: msg.task_type,
            created_at: now_ms(),
            deadline: msg.deadline,
            result: None,
            error: None,
        },
    );
}

/// Apply a peer's response to the matching live sent task.
pub async fn handle_task_response(node: &Node, msg: TaskResponseMsg) {
    if !msg.status.valid_response() {
        tracing::debug!(task = %msg.task_id, "ignoring response with status {:?}", msg.status);
        return;
    }
    let mut sent = node.sent_tasks.write().await;
    let Some(task) = sent.get_mut(&msg.task_id) else {
        tracing::debug!(task = %msg.task_id, "response for unknown task ignored");
        return;
    };
    if task.status.is_terminal() {
        tracing::debug!(task = %msg.task_id, "response for terminal task ignored");
        return;
    }
    task.status = msg.status;
    task.result = msg.result;
    task.error = msg.error;
    task.responder = Some(msg.responder);
    task.next_retry_time = None;
    if msg.status.is_terminal() {
        task.completed_at = Some(now_ms());
    }
    tracing::info!(task = %msg.task_id, status = ?msg.status, "task_response applied");
}

// ============================================================================
// Local responses (control plane → wire)
// ============================================================================

#[derive(Debug)]
pub enum RespondError {
    UnknownTask,
    InvalidStatus,
}

pub struct RespondOutcome {
    pub status: TaskStatus,
    pub sent_to_requester: bool,
}

/// Record the local agent's verdict on a received task and mirror it to the
/// requester. Responses are not retried: a disconnected requester simply
/// misses it.
pub async fn respond(
    node: &Arc<Node>,
    task_id: &str,
    status: TaskStatus,
    result: Option<Value>,
    error: Option<Value>,
) -> Result<RespondOutcome, RespondError> {
    if !status.valid_response() {
        return Err(RespondError::InvalidStatus);
    }

    let from = {
        let mut received = node.received_tasks.write().await;
        let task = received.get_mut(task_id).ok_or(RespondError::UnknownTask)?;
        task.status = status;
        task.result = result.clone();
        task.error = error.clone();
        task.from.clone()
    };

    let msg = PeerMessage::TaskResponse(TaskResponseMsg {
        task_id: task_id.to_string(),
        status,
        result,
        error,
        responder: node.identity.short_id.clone(),
    });
    let env = node.identity.sign(&msg.to_value());
    let sent_to_requester = node.send_to_peer(&from, &env).await.is_ok();
    if !sent_to_requester {
        tracing::warn!(task = %task_id, "requester offline; response lost");
    }

    Ok(RespondOutcome { status, sent_to_requester })
}

// ============================================================================
// Retry reaper pass
// ============================================================================

/// One retry tick over the sent-task table.
pub async fn retry_pass(node: &Arc<Node>) {
    let now = now_ms();
    let snapshot: Vec<SentTask> = node.sent_tasks.read().await.values().cloned().collect();

    for task in snapshot {
        if task.status.is_terminal() {
            continue;
        }
        if task.deadline.is_some_and(|d| d < now) {
            dead_letter(node, &task.task_id, "Deadline exceeded").await;
            continue;
        }
        if task.status != TaskStatus::QueuedForRetry
            || task.next_retry_time.is_none_or(|t| t > now)
        {
            continue;
        }

        match node.find_peer_key(&task.target).await {
            Some(peer_key) => {
                let env = node
                    .identity
                    .sign(&request_message(&task, &node.identity.short_id).to_value());
                if node.send_to_peer(&peer_key, &env).await.is_ok() {
                    let mut sent = node.sent_tasks.write().await;
                    if let Some(t) = sent.get_mut(&task.task_id) {
                        if t.status == TaskStatus::QueuedForRetry {
                            t.status = TaskStatus::Pending;
                            t.last_attempt_at = Some(now);
                            t.next_retry_time = None;
                        }
                    }
                    tracing::info!(task = %task.task_id, to = %task.target, "queued task re-delivered");
                } else {
                    reschedule_or_bury(node, &task.task_id, now).await;
                }
            }
            None => reschedule_or_bury(node, &task.task_id, now).await,
        }
    }
}

/// Burn one attempt, or dead-letter once the budget is gone.
async fn reschedule_or_bury(node: &Node, task_id: &str, now: u64) {
    let exhausted_after = {
        let mut sent = node.sent_tasks.write().await;
        match sent.get_mut(task_id) {
            Some(t) if attempts_exhausted(t.attempt_count) => Some(t.attempt_count),
            Some(t) => {
                t.attempt_count += 1;
                t.next_retry_time = Some(now + retry_backoff_ms(t.attempt_count));
                None
            }
            None => None,
        }
    };
    if let Some(attempts) = exhausted_after {
        dead_letter(node, task_id, &format!("Peer offline after {attempts} attempts")).await;
    }
}

// ============================================================================
// Dead-letter store
// ============================================================================

/// Promote a sent task to the dead-letter table. The two tables stay
/// disjoint: the entry leaves `sent_tasks` in the same motion.
pub async fn dead_letter(node: &Node, task_id: &str, reason: &str) {
    let removed = node.sent_tasks.write().await.remove(task_id);
    if let Some(mut task) = removed {
        task.status = TaskStatus::Failed;
        task.next_retry_time = None;
        tracing::warn!(task = %task_id, reason, "task dead-lettered");
        node.dead_letter.write().await.insert(
            task_id.to_string(),
            DeadLetterTask {
                task,
                failure_reason: reason.to_string(),
                failed_at: now_ms(),
            },
        );
    }
}

/// Manually promote a dead-lettered task back into the retry queue.
pub async fn requeue(node: &Node, task_id: &str) -> bool {
    let removed = node.dead_letter.write().await.remove(task_id);
    match removed {
        Some(dead) => {
            let mut task = dead.task;
            task.status = TaskStatus::QueuedForRetry;
            task.attempt_count = 0;
            task.next_retry_time = Some(now_ms());
            task.error = None;
            task.completed_at = None;
            tracing::info!(task = %task_id, "dead-lettered task requeued");
            node.sent_tasks.write().await.insert(task_id.to_string(), task);
            true
        }
        None => false,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_node;
    use kizuna_protocol::MAX_ATTEMPTS;
    use serde_json::json;

    fn request(target: Option<&str>) -> SubmitRequest {
        SubmitRequest {
            description: "inspect the ledger".into(),
            context: Value::Null,
            task_type: TaskType::Analysis,
            priority: Priority::High,
            target: target.map(str::to_string),
            deadline: None,
            context_id: None,
            a2a_source: false,
        }
    }

    #[tokio::test]
    async fn missing_description_rejected() {
        let (node, _dir, _ctl) = test_node("alpha");
        let mut req = request(None);
        req.description = String::new();
        assert!(submit(&node, req).await.is_err());
    }

    #[tokio::test]
    async fn oversized_description_rejected() {
        let (node, _dir, _ctl) = test_node("alpha");
        let mut req = request(None);
        req.description = "x".repeat(MAX_DESCRIPTION_BYTES + 1);
        assert!(submit(&node, req).await.is_err());
    }

    #[tokio::test]
    async fn oversized_context_rejected() {
        let (node, _dir, _ctl) = test_node("alpha");
        let mut req = request(None);
        req.context = json!({ "blob": "y".repeat(MAX_CONTEXT_BYTES) });
        assert!(submit(&node, req).await.is_err());
    }

    #[tokio::test]
    async fn body_parse_rejects_unknown_enums() {
        assert!(SubmitRequest::from_value(&json!({
            "description": "x", "task_type": "sorcery"
        }))
        .is_err());
        assert!(SubmitRequest::from_value(&json!({
            "description": "x", "priority": "extreme"
        }))
        .is_err());
        let ok = SubmitRequest::from_value(&json!({ "description": "x" })).unwrap();
        assert_eq!(ok.task_type, TaskType::General);
        assert_eq!(ok.priority, Priority::Medium);
    }

    #[tokio::test]
    async fn offline_target_queues_with_first_backoff() {
        let (node, _dir, _ctl) = test_node("alpha");
        let before = now_ms();
        let outcome = submit(&node, request(Some("nobody"))).await.unwrap();
        let SubmitOutcome::Queued { task_id, next_retry_time, .. } = outcome else {
            panic!("expected queued outcome");
        };
        // base · 2^1 = 10 s out.
        assert!(next_retry_time >= before + 10_000);
        assert!(next_retry_time <= now_ms() + 10_000);

        let sent = node.sent_tasks.read().await;
        let task = sent.get(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::QueuedForRetry);
        assert_eq!(task.attempt_count, 1);
    }

    #[tokio::test]
    async fn broadcast_with_no_peers_is_pending() {
        let (node, _dir, _ctl) = test_node("alpha");
        let outcome = submit(&node, request(None)).await.unwrap();
        let SubmitOutcome::Sent { task_id, target, sent_to } = outcome else {
            panic!("expected sent outcome");
        };
        assert_eq!(target, "*");
        assert_eq!(sent_to, 0);
        let sent = node.sent_tasks.read().await;
        assert_eq!(sent.get(&task_id).unwrap().status, TaskStatus::Pending);
    }

    async fn force_due(node: &crate::state::Node, task_id: &str) {
        let mut sent = node.sent_tasks.write().await;
        sent.get_mut(task_id).unwrap().next_retry_time = Some(now_ms().saturating_sub(1));
    }

    #[tokio::test]
    async fn retries_exhaust_into_dead_letter() {
        let (node, _dir, _ctl) = test_node("alpha");
        let outcome = submit(&node, request(Some("ghost"))).await.unwrap();
        let SubmitOutcome::Queued { task_id, .. } = outcome else { panic!() };

        for expected_attempts in [2, 3] {
            force_due(&node, &task_id).await;
            retry_pass(&node).await;
            let sent = node.sent_tasks.read().await;
            let task = sent.get(&task_id).unwrap();
            assert_eq!(task.attempt_count, expected_attempts);
            assert!(task.attempt_count <= MAX_ATTEMPTS);
        }

        force_due(&node, &task_id).await;
        retry_pass(&node).await;

        assert!(!node.sent_tasks.read().await.contains_key(&task_id));
        let dead = node.dead_letter.read().await;
        let entry = dead.get(&task_id).unwrap();
        assert_eq!(entry.failure_reason, "Peer offline after 3 attempts");
        assert_eq!(entry.task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn past_deadline_dead_letters_regardless_of_attempts() {
        let (node, _dir, _ctl) = test_node("alpha");
        let mut req = request(None);
        req.deadline = Some(now_ms().saturating_sub(5_000));
        let outcome = submit(&node, req).await.unwrap();
        let SubmitOutcome::Sent { task_id, .. } = outcome else { panic!() };

        retry_pass(&node).await;

        let dead = node.dead_letter.read().await;
        assert_eq!(dead.get(&task_id).unwrap().failure_reason, "Deadline exceeded");
    }

    #[tokio::test]
    async fn requeue_resets_retry_budget() {
        let (node, _dir, _ctl) = test_node("alpha");
        let outcome = submit(&node, request(Some("ghost"))).await.unwrap();
        let SubmitOutcome::Queued { task_id, .. } = outcome else { panic!() };
        dead_letter(&node, &task_id, "Peer offline after 3 attempts").await;
        assert!(node.dead_letter.read().await.contains_key(&task_id));

        assert!(requeue(&node, &task_id).await);
        assert!(!node.dead_letter.read().await.contains_key(&task_id));

        let sent = node.sent_tasks.read().await;
        let task = sent.get(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::QueuedForRetry);
        assert_eq!(task.attempt_count, 0);
        assert!(task.next_retry_time.unwrap() <= now_ms());

        assert!(!requeue(&node, "no-such-task").await);
    }

    #[tokio::test]
    async fn terminal_tasks_are_left_alone() {
        let (node, _dir, _ctl) = test_node("alpha");
        let outcome = submit(&node, request(None)).await.unwrap();
        let SubmitOutcome::Sent { task_id, .. } = outcome else { panic!() };

        handle_task_response(
            &node,
            TaskResponseMsg {
                task_id: task_id.clone(),
                status: TaskStatus::Completed,
                result: Some(json!({ "ok": true })),
                error: None,
                responder: "cafebabe".into(),
            },
        )
        .await;

        retry_pass(&node).await;

        let sent = node.sent_tasks.read().await;
        let task = sent.get(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({ "ok": true })));
        assert_eq!(task.responder.as_deref(), Some("cafebabe"));
        assert!(task.completed_at.is_some());
        drop(sent);

        // A late contradictory response must not reopen it.
        handle_task_response(
            &node,
            TaskResponseMsg {
                task_id: task_id.clone(),
                status: TaskStatus::Failed,
                result: None,
                error: Some(json!("too late")),
                responder: "cafebabe".into(),
            },
        )
        .await;
        assert_eq!(
            node.sent_tasks.read().await.get(&task_id).unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn respond_validates_status_and_task() {
        let (node, _dir, _ctl) = test_node("alpha");
        assert!(matches!(
            respond(&node, "missing", TaskStatus::Completed, None, None).await,
            Err(RespondError::UnknownTask)
        ));
        assert!(matches!(
            respond(&node, "missing", TaskStatus::QueuedForRetry, None, None).await,
            Err(RespondError::InvalidStatus)
        ));
    }
}
