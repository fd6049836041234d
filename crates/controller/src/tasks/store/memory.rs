//! In-memory task store with the same versioning contract as the cluster.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{check_transition, StoreError, StoreResult, TaskRecord, TaskStore, VersionedTask};
use crate::crds::{AgentTaskSpec, AgentTaskStatus};

struct Entry {
    record: TaskRecord,
    version: u64,
}

impl Entry {
    fn versioned(&self) -> VersionedTask {
        VersionedTask {
            record: self.record.clone(),
            version: self.version.to_string(),
        }
    }
}

/// Versioned in-memory map of task records
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Entry>>,
}

impl MemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, id: &str, spec: AgentTaskSpec) -> StoreResult<VersionedTask> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }

        let entry = Entry {
            record: TaskRecord {
                id: id.to_string(),
                uid: Some(Uuid::new_v4().to_string()),
                spec,
                status: AgentTaskStatus::default(),
                created_at: Utc::now(),
            },
            version: 1,
        };
        let versioned = entry.versioned();
        tasks.insert(id.to_string(), entry);
        Ok(versioned)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<VersionedTask>> {
        Ok(self.tasks.read().await.get(id).map(Entry::versioned))
    }

    async fn list(&self) -> StoreResult<Vec<VersionedTask>> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<VersionedTask> = tasks.values().map(Entry::versioned).collect();
        all.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        Ok(all)
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        version: &str,
        status: AgentTaskStatus,
    ) -> StoreResult<VersionedTask> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if entry.version.to_string() != version {
            return Err(StoreError::Conflict(id.to_string()));
        }
        check_transition(id, &entry.record.status, &status)?;

        entry.record.status = status;
        entry.version += 1;
        Ok(entry.versioned())
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        Ok(self.tasks.write().await.remove(id).is_some())
    }
}
