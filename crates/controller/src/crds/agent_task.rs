//! `AgentTask` Custom Resource Definition: one unit of work bound to one sandbox

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_git_ref() -> String {
    "main".to_string()
}

/// Repository the worker operates on
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct RepositoryRef {
    /// Clone URL (e.g. `https://github.com/acme/app`)
    pub url: String,

    /// Branch, tag or commit to start from
    #[serde(rename = "ref", default = "default_git_ref")]
    pub git_ref: String,
}

impl RepositoryRef {
    /// `owner/name` extracted from the URL, if it has that shape
    #[must_use]
    pub fn slug(&self) -> Option<(String, String)> {
        let trimmed = self.url.trim_end_matches('/').trim_end_matches(".git");
        let mut parts = trimmed.rsplit(['/', ':']);
        let name = parts.next().filter(|s| !s.is_empty())?;
        let owner = parts.next().filter(|s| !s.is_empty())?;
        Some((owner.to_string(), name.to_string()))
    }
}

/// `AgentTask` CRD: declared intent of a task
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(group = "agents.platform", version = "v1", kind = "AgentTask")]
#[kube(namespaced)]
#[kube(status = "AgentTaskStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#)]
#[kube(printcolumn = r#"{"name":"Repo","type":"string","jsonPath":".spec.repository.url"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct AgentTaskSpec {
    /// What the worker should do
    pub description: String,

    /// Free-form context blob handed to the worker verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Where the task came from (issue URL, ticket key, ...)
    #[serde(
        default,
        rename = "sourceReference",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_reference: Option<String>,

    /// Target repository and ref
    pub repository: RepositoryRef,

    /// Where the signed terminal outcome is delivered
    #[serde(default, rename = "callbackUrl", skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    /// Sandbox template override (defaults to the controller's template)
    #[serde(
        default,
        rename = "sandboxTemplate",
        skip_serializing_if = "Option::is_none"
    )]
    pub sandbox_template: Option<String>,
}

/// Lifecycle phase of a task
///
/// Phases only move forward. The four terminal phases are equally final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Assigning,
    Running,
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

impl Phase {
    const fn ordinal(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Provisioning => 1,
            Self::Ready => 2,
            Self::Assigning => 3,
            Self::Running => 4,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Canceled => 5,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    /// Whether `next` is a legal successor of `self`
    #[must_use]
    pub const fn can_transition_to(self, next: Phase) -> bool {
        !self.is_terminal() && next.ordinal() > self.ordinal()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Provisioning => "Provisioning",
            Self::Ready => "Ready",
            Self::Assigning => "Assigning",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
            Self::Canceled => "Canceled",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task reached its terminal phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TerminalReason {
    Completed,
    WorkerReportedFailure,
    ProvisioningTimeout,
    AssignmentFailure,
    RunnerExitedWithoutStatus,
    TaskTimeout,
    Canceled,
}

impl TerminalReason {
    /// Terminal phase this reason lands in
    #[must_use]
    pub const fn phase(self) -> Phase {
        match self {
            Self::Completed => Phase::Completed,
            Self::WorkerReportedFailure
            | Self::AssignmentFailure
            | Self::RunnerExitedWithoutStatus => Phase::Failed,
            Self::ProvisioningTimeout | Self::TaskTimeout => Phase::TimedOut,
            Self::Canceled => Phase::Canceled,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "Completed",
            Self::WorkerReportedFailure => "WorkerReportedFailure",
            Self::ProvisioningTimeout => "ProvisioningTimeout",
            Self::AssignmentFailure => "AssignmentFailure",
            Self::RunnerExitedWithoutStatus => "RunnerExitedWithoutStatus",
            Self::TaskTimeout => "TaskTimeout",
            Self::Canceled => "Canceled",
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named facts recorded on a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    /// A credential grant was handed to the worker
    TokenIssued,
    /// Outcome callback result (`CallbackSent`, `CallbackFailed`, `NoCallback`)
    Notified,
    /// The sandbox reported readiness at least once
    SandboxReady,
    /// The sandbox claim was deleted during cleanup
    SandboxDeleted,
}

/// Condition for the `AgentTask`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    pub status: bool,

    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub last_transition_time: DateTime<Utc>,
}

/// Handle to the sandbox claim owned by a task
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRef {
    /// Name of the `SandboxClaim` object
    pub claim_name: String,

    /// Service FQDN, known once the sandbox is scheduled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Status of the `AgentTask`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskStatus {
    #[serde(default)]
    pub phase: Phase,

    /// Set together with a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminalReason>,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub conditions: Vec<TaskCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxRef>,

    /// Failed assignment attempts counted against the retry ceiling
    #[serde(default)]
    pub assignment_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assignment_error: Option<String>,

    /// Latest progress message reported by the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentTaskStatus {
    #[must_use]
    pub fn condition(&self, condition_type: ConditionType) -> Option<&TaskCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    #[must_use]
    pub fn has_condition(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type).is_some()
    }

    /// Insert or replace a condition; the transition time only moves when
    /// the boolean status changes.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: Option<String>,
    ) {
        let now = Utc::now();
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
            return;
        }

        self.conditions.push(TaskCondition {
            condition_type,
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: now,
        });
    }

    pub fn remove_condition(&mut self, condition_type: ConditionType) {
        self.conditions
            .retain(|c| c.condition_type != condition_type);
    }

    /// Move to a terminal phase, stamping reason and completion time.
    ///
    /// Returns `false` and leaves the status untouched when already terminal.
    pub fn terminate(&mut self, reason: TerminalReason, message: Option<String>) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.phase = reason.phase();
        self.reason = Some(reason);
        self.message = message;
        self.completed_at = Some(Utc::now());
        true
    }
}
