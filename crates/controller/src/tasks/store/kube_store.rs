//! Task store backed by the `AgentTask` custom resource.
//!
//! The version token is `metadata.resourceVersion`. Status writes are merge
//! patches that carry the expected `resourceVersion`, which the API server
//! enforces as a precondition and answers with `409 Conflict` when stale.

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Error as KubeError, ResourceExt};
use serde_json::{json, Map, Value};

use super::{check_transition, StoreError, StoreResult, TaskRecord, TaskStore, VersionedTask};
use crate::crds::{AgentTask, AgentTaskSpec, AgentTaskStatus};

pub struct KubeTaskStore {
    api: Api<AgentTask>,
}

impl KubeTaskStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    pub(crate) fn to_versioned(task: AgentTask) -> StoreResult<VersionedTask> {
        let id = task.name_any();
        let version = task
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| StoreError::Malformed {
                id: id.clone(),
                reason: "missing resourceVersion".to_string(),
            })?;
        let created_at = task
            .metadata
            .creation_timestamp
            .as_ref()
            .map_or_else(Utc::now, |t| t.0);

        Ok(VersionedTask {
            record: TaskRecord {
                id,
                uid: task.metadata.uid.clone(),
                spec: task.spec,
                status: task.status.unwrap_or_default(),
                created_at,
            },
            version,
        })
    }
}

/// Build a merge patch that turns `old` into `new`.
///
/// Merge patches leave absent keys untouched, so keys that disappeared are
/// written as explicit nulls. Arrays are replaced wholesale by the server.
fn status_merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (key, new_value) in new_map {
                let value = match old_map.get(key) {
                    Some(old_value) => status_merge_patch(old_value, new_value),
                    None => new_value.clone(),
                };
                patch.insert(key.clone(), value);
            }
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

fn is_status(err: &KubeError, code: u16) -> bool {
    matches!(err, KubeError::Api(response) if response.code == code)
}

#[async_trait]
impl TaskStore for KubeTaskStore {
    async fn create(&self, id: &str, spec: AgentTaskSpec) -> StoreResult<VersionedTask> {
        let task = AgentTask::new(id, spec);
        match self.api.create(&PostParams::default(), &task).await {
            Ok(created) => Self::to_versioned(created),
            Err(e) if is_status(&e, 409) => Err(StoreError::AlreadyExists(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> StoreResult<Option<VersionedTask>> {
        self.api
            .get_opt(id)
            .await?
            .map(Self::to_versioned)
            .transpose()
    }

    async fn list(&self) -> StoreResult<Vec<VersionedTask>> {
        self.api
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .map(Self::to_versioned)
            .collect()
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        version: &str,
        status: AgentTaskStatus,
    ) -> StoreResult<VersionedTask> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if current.version != version {
            return Err(StoreError::Conflict(id.to_string()));
        }
        check_transition(id, &current.record.status, &status)?;

        let old_status = serde_json::to_value(&current.record.status)?;
        let new_status = serde_json::to_value(&status)?;
        let patch = json!({
            "metadata": { "resourceVersion": version },
            "status": status_merge_patch(&old_status, &new_status),
        });

        match self
            .api
            .patch_status(id, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Self::to_versioned(updated),
            Err(e) if is_status(&e, 409) => Err(StoreError::Conflict(id.to_string())),
            Err(e) if is_status(&e, 404) => Err(StoreError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        match self.api.delete(id, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
