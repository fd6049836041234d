//! Terminal outcome events delivered to task originators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final outcome of a task, mirroring its terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

impl TaskOutcome {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
            Self::Canceled => "Canceled",
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single task, addressed to the task's callback URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeEvent {
    pub task_id: String,
    pub callback_url: String,
    pub outcome: TaskOutcome,
    /// Machine-readable reason, e.g. `ProvisioningTimeout`
    pub reason: String,
    pub pr_url: Option<String>,
    pub message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl OutcomeEvent {
    /// Body sent to the receiver. The callback URL is never part of it.
    #[must_use]
    pub fn payload(&self) -> CallbackPayload {
        CallbackPayload {
            task_id: self.task_id.clone(),
            outcome: self.outcome,
            reason: self.reason.clone(),
            pr_url: self.pr_url.clone(),
            message: self.message.clone(),
            completed_at: self.completed_at,
        }
    }
}

/// Wire format of the signed callback body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackPayload {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub outcome: TaskOutcome,
    pub reason: String,
    #[serde(rename = "prURL", default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
}
