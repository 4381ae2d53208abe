//! Inner payloads carried by signed envelopes.
//!
//! The wire uses a free-form `type` discriminator; unknown types are kept as
//! opaque chat values so newer peers can talk past older ones.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    manifest::Manifest,
    task::{TaskPayload, TaskStatus, TaskType},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequestMsg {
    pub task_id: String,
    pub task_type: TaskType,
    pub payload: TaskPayload,
    pub deadline: Option<u64>,
    /// Sender's short id, advisory only.
    pub sender: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponseMsg {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    /// Responder's short id.
    pub responder: String,
}

/// One decoded peer message.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    Handshake(Manifest),
    TaskRequest(TaskRequestMsg),
    TaskResponse(TaskResponseMsg),
    /// Anything with an unknown (or missing) `type`: chat and friends.
    Chat(Value),
}

impl PeerMessage {
    /// Dispatch a parsed inner payload by its `type` field.
    ///
    /// Known types that fail structural validation degrade to `Chat` rather
    /// than being dropped: the envelope already verified, so the frame is
    /// authentic even if its shape is from a different protocol revision.
    pub fn from_value(value: Value) -> Self {
        match value.get("type").and_then(Value::as_str) {
            Some("handshake") => {
                match value
                    .get("manifest")
                    .cloned()
                    .map(serde_json::from_value::<Manifest>)
                {
                    Some(Ok(manifest)) => Self::Handshake(manifest),
                    _ => Self::Chat(value),
                }
            }
            Some("task_request") => match serde_json::from_value(value.clone()) {
                Ok(msg) => Self::TaskRequest(msg),
                Err(_) => Self::Chat(value),
            },
            Some("task_response") => match serde_json::from_value(value.clone()) {
                Ok(msg) => Self::TaskResponse(msg),
                Err(_) => Self::Chat(value),
            },
            _ => Self::Chat(value),
        }
    }

    /// Wire form, with the `type` discriminator attached.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Handshake(manifest) => json!({
                "type": "handshake",
                "manifest": manifest,
            }),
            Self::TaskRequest(msg) => {
                let mut v = serde_json::to_value(msg).unwrap_or(Value::Null);
                v["type"] = json!("task_request");
                v
            }
            Self::TaskResponse(msg) => {
                let mut v = serde_json::to_value(msg).unwrap_or(Value::Null);
                v["type"] = json!("task_response");
                v
            }
            Self::Chat(value) => value.clone(),
        }
    }
}

/// Recognise the bare unsigned heartbeat frame.
pub fn is_ping(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("ping")
}

/// The heartbeat frame itself.
pub fn ping_frame() -> Value {
    json!({ "type": "ping" })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;

    #[test]
    fn dispatches_handshake() {
        let v = json!({
            "type": "handshake",
            "manifest": { "role": "Coder", "skills": ["rust"], "agent_id": "bob" }
        });
        match PeerMessage::from_value(v) {
            PeerMessage::Handshake(m) => assert_eq!(m.agent_id, "bob"),
            other => panic!("expected handshake, got {other:?}"),
        }
    }

    #[test]
    fn dispatches_task_request() {
        let v = json!({
            "type": "task_request",
            "task_id": "id-1",
            "task_type": "analysis",
            "payload": { "description": "x", "context": {}, "priority": "high" },
            "deadline": null,
            "sender": "aabbccdd"
        });
        match PeerMessage::from_value(v) {
            PeerMessage::TaskRequest(req) => {
                assert_eq!(req.task_id, "id-1");
                assert_eq!(req.payload.priority, Priority::High);
            }
            other => panic!("expected task_request, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_falls_through_to_chat() {
        let v = json!({ "type": "CHAT", "text": "hello" });
        match PeerMessage::from_value(v.clone()) {
            PeerMessage::Chat(inner) => assert_eq!(inner, v),
            other => panic!("expected chat, got {other:?}"),
        }
    }

    #[test]
    fn malformed_known_type_degrades_to_chat() {
        // task_request without a payload is kept, not dropped.
        let v = json!({ "type": "task_request", "task_id": "id-2" });
        assert!(matches!(PeerMessage::from_value(v), PeerMessage::Chat(_)));
    }

    #[test]
    fn request_round_trips_with_type_tag() {
        let msg = PeerMessage::TaskRequest(TaskRequestMsg {
            task_id: "id-3".into(),
            task_type: TaskType::Research,
            payload: TaskPayload {
                description: "dig".into(),
                context: Value::Null,
                priority: Priority::Medium,
            },
            deadline: Some(123),
            sender: "0011aabb".into(),
        });
        let v = msg.to_value();
        assert_eq!(v["type"], "task_request");
        assert!(matches!(
            PeerMessage::from_value(v),
            PeerMessage::TaskRequest(_)
        ));
    }

    #[test]
    fn ping_recognition() {
        assert!(is_ping(&json!({ "type": "ping" })));
        assert!(!is_ping(&json!({ "type": "pong" })));
        assert!(is_ping(&ping_frame()));
    }
}
