use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{MAX_ATTEMPTS, RETRY_BASE_MS, RETRY_MAX_DELAY_MS};

/// Maximum bytes in a task description.
pub const MAX_DESCRIPTION_BYTES: usize = 10_000;

/// Maximum bytes in a task's serialised context.
pub const MAX_CONTEXT_BYTES: usize = 50_000;

// ============================================================================
// Closed enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    General,
    Analysis,
    CodeReview,
    Research,
    Test,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Task lifecycle states shared by the sender and receiver tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    QueuedForRetry,
    Accepted,
    InProgress,
    Completed,
    Failed,
    Rejected,
}

impl TaskStatus {
    /// Terminal tasks are never touched by the retry reaper.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// States a local agent may report for a received task.
    pub fn valid_response(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Rejected | Self::InProgress | Self::Completed | Self::Failed
        )
    }
}

// ============================================================================
// Payload
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub description: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub priority: Priority,
}

// ============================================================================
// Retry backoff
// ============================================================================

/// Delay before the next delivery attempt: min(base · 2^attempts, cap).
pub fn retry_backoff_ms(attempts: u32) -> u64 {
    RETRY_BASE_MS
        .saturating_mul(2u64.saturating_pow(attempts.min(16)))
        .min(RETRY_MAX_DELAY_MS)
}

/// True once a task has burned through its whole retry budget.
pub fn attempts_exhausted(attempts: u32) -> bool {
    attempts >= MAX_ATTEMPTS
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(retry_backoff_ms(0), 5_000);
        assert_eq!(retry_backoff_ms(1), 10_000);
        assert_eq!(retry_backoff_ms(2), 20_000);
        assert_eq!(retry_backoff_ms(3), 40_000);
        assert_eq!(retry_backoff_ms(4), 60_000);
        assert_eq!(retry_backoff_ms(30), 60_000);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Rejected.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::QueuedForRetry.is_terminal());
    }

    #[test]
    fn response_states_exclude_sender_only_states() {
        assert!(TaskStatus::Accepted.valid_response());
        assert!(TaskStatus::Completed.valid_response());
        assert!(!TaskStatus::Pending.valid_response());
        assert!(!TaskStatus::QueuedForRetry.valid_response());
    }

    #[test]
    fn enums_serialise_snake_case() {
        assert_eq!(
            serde_json::to_value(TaskType::CodeReview).unwrap(),
            "code_review"
        );
        assert_eq!(
            serde_json::to_value(TaskStatus::QueuedForRetry).unwrap(),
            "queued_for_retry"
        );
        assert_eq!(serde_json::to_value(Priority::Critical).unwrap(), "critical");
    }

    #[test]
    fn payload_defaults() {
        let p: TaskPayload = serde_json::from_value(serde_json::json!({
            "description": "x"
        }))
        .unwrap();
        assert_eq!(p.priority, Priority::Medium);
        assert!(p.context.is_null());
    }
}
