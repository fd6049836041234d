//! In-process sandbox provisioner for tests and local runs.
//!
//! Claims never become ready on their own; callers drive them with
//! [`MemorySandboxProvisioner::set_state`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    ClaimSummary, DeleteOutcome, ProvisionError, SandboxProvisioner, SandboxRef, SandboxState,
};
use crate::tasks::naming::ResourceNaming;
use crate::tasks::store::TaskRecord;

#[derive(Debug, Clone)]
struct FakeClaim {
    task_id: String,
    state: SandboxState,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    claims: HashMap<String, FakeClaim>,
    creates: u32,
    delete_calls: u32,
    deletions: u32,
    failures_remaining: u32,
}

#[derive(Debug, Default)]
pub struct MemorySandboxProvisioner {
    inner: Mutex<Inner>,
}

impl MemorySandboxProvisioner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state reported for a task's claim, if it exists
    pub async fn set_state(&self, task_id: &str, state: SandboxState) {
        let mut inner = self.inner.lock().await;
        if let Some(claim) = inner.claims.get_mut(&ResourceNaming::claim_name(task_id)) {
            claim.state = state;
        }
    }

    /// Make the next `count` provisions fail
    pub async fn fail_next_provisions(&self, count: u32) {
        self.inner.lock().await.failures_remaining = count;
    }

    /// Drop a claim behind the controller's back
    pub async fn vanish(&self, task_id: &str) {
        self.inner
            .lock()
            .await
            .claims
            .remove(&ResourceNaming::claim_name(task_id));
    }

    /// Register a claim that no reconcile pass created
    pub async fn insert_claim(&self, task_id: &str, created_at: DateTime<Utc>) {
        self.inner.lock().await.claims.insert(
            ResourceNaming::claim_name(task_id),
            FakeClaim {
                task_id: task_id.to_string(),
                state: SandboxState::Unknown,
                created_at,
            },
        );
    }

    pub async fn exists(&self, task_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .claims
            .contains_key(&ResourceNaming::claim_name(task_id))
    }

    /// Claims actually created (adoptions excluded)
    pub async fn create_count(&self) -> u32 {
        self.inner.lock().await.creates
    }

    /// Every delete call, including ones that found nothing
    pub async fn delete_calls(&self) -> u32 {
        self.inner.lock().await.delete_calls
    }

    /// Deletes that removed a claim
    pub async fn deletion_count(&self) -> u32 {
        self.inner.lock().await.deletions
    }
}

#[async_trait]
impl SandboxProvisioner for MemorySandboxProvisioner {
    async fn provision(&self, task: &TaskRecord) -> Result<SandboxRef, ProvisionError> {
        let mut inner = self.inner.lock().await;
        if inner.failures_remaining > 0 {
            inner.failures_remaining -= 1;
            return Err(ProvisionError::Rejected(
                "injected provisioning failure".to_string(),
            ));
        }

        let claim_name = ResourceNaming::claim_name(&task.id);
        if !inner.claims.contains_key(&claim_name) {
            inner.creates += 1;
            inner.claims.insert(
                claim_name.clone(),
                FakeClaim {
                    task_id: task.id.clone(),
                    state: SandboxState::Unknown,
                    created_at: Utc::now(),
                },
            );
        }

        Ok(SandboxRef {
            claim_name,
            address: None,
        })
    }

    async fn poll(&self, sandbox: &SandboxRef) -> Result<SandboxState, ProvisionError> {
        Ok(self
            .inner
            .lock()
            .await
            .claims
            .get(&sandbox.claim_name)
            .map_or(SandboxState::NotFound, |c| c.state.clone()))
    }

    async fn delete(&self, sandbox: &SandboxRef) -> Result<DeleteOutcome, ProvisionError> {
        let mut inner = self.inner.lock().await;
        inner.delete_calls += 1;
        if inner.claims.remove(&sandbox.claim_name).is_some() {
            inner.deletions += 1;
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }

    async fn list_claims(&self) -> Result<Vec<ClaimSummary>, ProvisionError> {
        Ok(self
            .inner
            .lock()
            .await
            .claims
            .iter()
            .map(|(name, claim)| ClaimSummary {
                sandbox: SandboxRef {
                    claim_name: name.clone(),
                    address: None,
                },
                task_id: Some(claim.task_id.clone()),
                created_at: Some(claim.created_at),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::AgentTaskStatus;
    use crate::tasks::test_support::spec;

    fn record(id: &str) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            uid: None,
            spec: spec(),
            status: AgentTaskStatus::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_provision_is_idempotent_per_task() {
        let provisioner = MemorySandboxProvisioner::new();
        let first = provisioner.provision(&record("t1")).await.unwrap();
        let second = provisioner.provision(&record("t1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provisioner.create_count().await, 1);
        assert_eq!(provisioner.poll(&first).await.unwrap(), SandboxState::Unknown);
    }

    #[tokio::test]
    async fn test_delete_missing_claim_is_not_an_error() {
        let provisioner = MemorySandboxProvisioner::new();
        let sandbox = provisioner.provision(&record("t1")).await.unwrap();

        assert_eq!(
            provisioner.delete(&sandbox).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            provisioner.delete(&sandbox).await.unwrap(),
            DeleteOutcome::NotFound
        );
        assert_eq!(provisioner.poll(&sandbox).await.unwrap(), SandboxState::NotFound);
        assert_eq!(provisioner.deletion_count().await, 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let provisioner = MemorySandboxProvisioner::new();
        provisioner.fail_next_provisions(1).await;

        assert!(provisioner.provision(&record("t1")).await.is_err());
        assert!(provisioner.provision(&record("t1")).await.is_ok());
    }
}
