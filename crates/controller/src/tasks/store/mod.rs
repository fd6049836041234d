//! Task Store: the single source of truth for task records.
//!
//! Every mutation is a compare-and-swap against the version token read with
//! the record. There are no locks spanning operations; a writer that loses a
//! race re-reads and either re-applies its change or discards it.

mod kube_store;
mod memory;

pub use kube_store::KubeTaskStore;
pub use memory::MemoryTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::crds::{AgentTaskSpec, AgentTaskStatus, Phase};

/// Attempts a read-modify-write makes before giving up on contention
pub const MAX_CAS_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Task {0} already exists")]
    AlreadyExists(String),

    #[error("Version conflict writing task {0}")]
    Conflict(String),

    #[error("Illegal phase transition for task {id}: {from} -> {to}")]
    IllegalTransition { id: String, from: Phase, to: Phase },

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed task record {id}: {reason}")]
    Malformed { id: String, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A task as seen by the orchestration core
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    /// Stable object identity, used for owner references
    pub uid: Option<String>,
    pub spec: AgentTaskSpec,
    pub status: AgentTaskStatus,
    pub created_at: DateTime<Utc>,
}

/// A record together with the version token it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedTask {
    pub record: TaskRecord,
    pub version: String,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task in `Pending`. Fails with `AlreadyExists` for a taken ID.
    async fn create(&self, id: &str, spec: AgentTaskSpec) -> StoreResult<VersionedTask>;

    async fn get(&self, id: &str) -> StoreResult<Option<VersionedTask>>;

    async fn list(&self) -> StoreResult<Vec<VersionedTask>>;

    /// Replace the status if the stored version still equals `version`.
    ///
    /// Fails with `Conflict` on a stale version and with `IllegalTransition`
    /// if the new phase would move backwards or leave a terminal phase.
    async fn compare_and_swap(
        &self,
        id: &str,
        version: &str,
        status: AgentTaskStatus,
    ) -> StoreResult<VersionedTask>;

    /// Delete a task record. Returns `false` if it did not exist.
    async fn delete(&self, id: &str) -> StoreResult<bool>;
}

/// Reject writes that would break phase monotonicity.
pub(crate) fn check_transition(
    id: &str,
    current: &AgentTaskStatus,
    next: &AgentTaskStatus,
) -> StoreResult<()> {
    let legal = if current.phase.is_terminal() {
        next.phase == current.phase && next.reason == current.reason
    } else {
        next.phase == current.phase || current.phase.can_transition_to(next.phase)
    };

    if legal {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            id: id.to_string(),
            from: current.phase,
            to: next.phase,
        })
    }
}

/// Result of [`modify_status`]
#[derive(Debug)]
pub enum Modified {
    /// The change was written; carries the new version
    Applied(VersionedTask),
    /// The change function declined to write; carries the current version
    Unchanged(VersionedTask),
}

impl Modified {
    #[must_use]
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    #[must_use]
    pub fn into_task(self) -> VersionedTask {
        match self {
            Self::Applied(task) | Self::Unchanged(task) => task,
        }
    }
}

/// Optimistic read-modify-write of a task's status.
///
/// `change` sees the latest record and returns the status to write, or
/// `None` to leave the task alone. On a version conflict the record is
/// re-read and `change` runs again, so a change that only applies to a
/// non-terminal task is naturally discarded once another writer wins.
pub async fn modify_status<S, F>(store: &S, id: &str, mut change: F) -> StoreResult<Modified>
where
    S: TaskStore + ?Sized,
    F: FnMut(&TaskRecord) -> Option<AgentTaskStatus> + Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let current = store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let Some(next) = change(&current.record) else {
            return Ok(Modified::Unchanged(current));
        };

        match store.compare_and_swap(id, &current.version, next).await {
            Ok(updated) => return Ok(Modified::Applied(updated)),
            Err(StoreError::Conflict(_)) => {
                debug!(task_id = %id, attempt, "Status write lost a race, re-reading");
            }
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::Conflict(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::TerminalReason;
    use crate::tasks::test_support::spec;

    #[test]
    fn test_check_transition_rejects_regression() {
        let current = AgentTaskStatus {
            phase: Phase::Running,
            ..Default::default()
        };
        let next = AgentTaskStatus {
            phase: Phase::Provisioning,
            ..Default::default()
        };
        assert!(matches!(
            check_transition("t", &current, &next),
            Err(StoreError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn test_check_transition_freezes_terminal_outcome() {
        let mut current = AgentTaskStatus::default();
        current.terminate(TerminalReason::Completed, None);

        let mut same = current.clone();
        same.last_progress = Some("late".to_string());
        assert!(check_transition("t", &current, &same).is_ok());

        let mut rewritten = current.clone();
        rewritten.reason = Some(TerminalReason::RunnerExitedWithoutStatus);
        assert!(check_transition("t", &current, &rewritten).is_err());
    }

    #[tokio::test]
    async fn test_modify_status_discards_change_after_concurrent_terminal_write() {
        let store = MemoryTaskStore::new();
        let created = store.create("t1", spec()).await.unwrap();

        // Another writer terminalizes between our read and our write.
        let mut completed = created.record.status.clone();
        completed.terminate(TerminalReason::Completed, None);
        store
            .compare_and_swap("t1", &created.version, completed)
            .await
            .unwrap();

        let result = modify_status(&store, "t1", |record| {
            let mut status = record.status.clone();
            status
                .terminate(TerminalReason::RunnerExitedWithoutStatus, None)
                .then_some(status)
        })
        .await
        .unwrap();

        assert!(!result.applied());
        let task = result.into_task();
        assert_eq!(task.record.status.reason, Some(TerminalReason::Completed));
    }

    #[tokio::test]
    async fn test_modify_status_unknown_task() {
        let store = MemoryTaskStore::new();
        let result = modify_status(&store, "missing", |r| Some(r.status.clone())).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
