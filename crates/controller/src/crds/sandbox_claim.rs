//! `SandboxClaim` Custom Resource: a request for one ephemeral sandbox
//!
//! The claim is served by the cluster's sandbox operator, which schedules a
//! pod from the referenced template, fronts it with a headless service and
//! reports readiness through the `Ready` condition.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carried by every claim, pointing back at its owning task
pub const TASK_ID_LABEL: &str = "agents.platform/task-id";

/// Reference to a `SandboxTemplate`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct TemplateRef {
    pub name: String,
}

/// Resource limits requested for the sandbox container
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct SandboxResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "extensions.agents.x-k8s.io",
    version = "v1alpha1",
    kind = "SandboxClaim"
)]
#[kube(namespaced)]
#[kube(status = "SandboxClaimStatus")]
pub struct SandboxClaimSpec {
    #[serde(rename = "sandboxTemplateRef")]
    pub sandbox_template_ref: TemplateRef,

    /// Image override for the worker container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<SandboxResources>,
}

/// Status of the `SandboxClaim` as reported by the sandbox operator
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct SandboxClaimStatus {
    /// Fully-qualified service name of the sandbox, once scheduled
    #[serde(default, rename = "serviceFQDN", skip_serializing_if = "Option::is_none")]
    pub service_fqdn: Option<String>,

    #[serde(default)]
    pub conditions: Vec<ClaimCondition>,
}

/// Condition for the `SandboxClaim` (True, False, or Unknown)
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCondition {
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl SandboxClaimStatus {
    #[must_use]
    pub fn ready_condition(&self) -> Option<&ClaimCondition> {
        self.conditions.iter().find(|c| c.condition_type == "Ready")
    }
}
