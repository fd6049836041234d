//! Sandbox Provisioner: requests sandbox claims and observes their state.
//!
//! Readiness is polled, not pushed; `poll` is cheap and safe to call on
//! every reconcile pass. The provisioner never retries on its own: a failed
//! provision is reported once and the reconciler decides what happens next.

mod kube_claims;
mod memory;

pub use kube_claims::KubeSandboxProvisioner;
pub use memory::MemorySandboxProvisioner;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use crate::crds::SandboxRef;
use crate::crds::SandboxClaimStatus;
use crate::tasks::store::TaskRecord;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Sandbox claim rejected: {0}")]
    Rejected(String),
}

/// Observed state of a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxState {
    /// `Ready=True` and reachable at `address`
    Ready { address: String },
    /// `Ready=False`: not (or no longer) serving
    Exited { reason: Option<String> },
    /// No readiness signal yet
    Unknown,
    /// The claim does not exist
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// A claim seen while sweeping for orphans
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSummary {
    pub sandbox: SandboxRef,
    pub task_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// What every claim asks for, unless the task overrides the template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSettings {
    pub template: String,
    pub image: Option<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    /// Create the claim for a task and return a handle to it.
    ///
    /// Creating a claim that already exists returns the existing handle.
    async fn provision(&self, task: &TaskRecord) -> Result<SandboxRef, ProvisionError>;

    async fn poll(&self, sandbox: &SandboxRef) -> Result<SandboxState, ProvisionError>;

    /// Idempotent: deleting a missing claim reports `NotFound`, not an error.
    async fn delete(&self, sandbox: &SandboxRef) -> Result<DeleteOutcome, ProvisionError>;

    /// Every claim this controller created
    async fn list_claims(&self) -> Result<Vec<ClaimSummary>, ProvisionError>;
}

/// Map a claim's status onto a [`SandboxState`].
#[must_use]
pub fn interpret_claim_status(status: Option<&SandboxClaimStatus>) -> SandboxState {
    let Some(status) = status else {
        return SandboxState::Unknown;
    };
    let Some(ready) = status.ready_condition() else {
        return SandboxState::Unknown;
    };

    match ready.status.as_str() {
        "True" => match status.service_fqdn.as_deref().filter(|s| !s.is_empty()) {
            Some(address) => SandboxState::Ready {
                address: address.to_string(),
            },
            // Ready without an address cannot be assigned yet
            None => SandboxState::Unknown,
        },
        "False" => SandboxState::Exited {
            reason: ready.reason.clone(),
        },
        _ => SandboxState::Unknown,
    }
}
