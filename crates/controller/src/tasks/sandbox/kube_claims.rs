//! Sandbox provisioner backed by `SandboxClaim` objects.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Api, Client, Error as KubeError, ResourceExt};
use tracing::{debug, info};

use super::{
    interpret_claim_status, ClaimSummary, DeleteOutcome, ProvisionError, SandboxProvisioner,
    SandboxRef, SandboxSettings, SandboxState,
};
use crate::crds::{
    SandboxClaim, SandboxClaimSpec, SandboxResources, TemplateRef, TASK_ID_LABEL,
};
use crate::tasks::naming::ResourceNaming;
use crate::tasks::store::TaskRecord;

pub struct KubeSandboxProvisioner {
    api: Api<SandboxClaim>,
    settings: SandboxSettings,
}

impl KubeSandboxProvisioner {
    #[must_use]
    pub fn new(client: Client, namespace: &str, settings: SandboxSettings) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            settings,
        }
    }

    fn build_claim(&self, task: &TaskRecord) -> SandboxClaim {
        let mut labels = BTreeMap::new();
        labels.insert(TASK_ID_LABEL.to_string(), task.id.clone());
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "sandbox-controller".to_string(),
        );

        // Ties the claim's lifetime to the task as a second line of defence
        let owner_references = task.uid.as_ref().map(|uid| {
            vec![OwnerReference {
                api_version: "agents.platform/v1".to_string(),
                kind: "AgentTask".to_string(),
                name: task.id.clone(),
                uid: uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]
        });

        let template = task
            .spec
            .sandbox_template
            .clone()
            .unwrap_or_else(|| self.settings.template.clone());

        let resources = (self.settings.cpu.is_some() || self.settings.memory.is_some()).then(|| {
            SandboxResources {
                cpu: self.settings.cpu.clone(),
                memory: self.settings.memory.clone(),
            }
        });

        SandboxClaim {
            metadata: ObjectMeta {
                name: Some(ResourceNaming::claim_name(&task.id)),
                labels: Some(labels),
                owner_references,
                ..Default::default()
            },
            spec: SandboxClaimSpec {
                sandbox_template_ref: TemplateRef { name: template },
                image: self.settings.image.clone(),
                resources,
            },
            status: None,
        }
    }
}

#[async_trait]
impl SandboxProvisioner for KubeSandboxProvisioner {
    async fn provision(&self, task: &TaskRecord) -> Result<SandboxRef, ProvisionError> {
        let claim = self.build_claim(task);
        let claim_name = claim.name_any();

        match self.api.create(&PostParams::default(), &claim).await {
            Ok(_) => {
                info!(task_id = %task.id, claim = %claim_name, "Created sandbox claim");
            }
            Err(KubeError::Api(response)) if response.code == 409 => {
                debug!(task_id = %task.id, claim = %claim_name, "Sandbox claim already exists, adopting");
            }
            Err(KubeError::Api(response)) if response.code == 422 || response.code == 400 => {
                return Err(ProvisionError::Rejected(response.message));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(SandboxRef {
            claim_name,
            address: None,
        })
    }

    async fn poll(&self, sandbox: &SandboxRef) -> Result<SandboxState, ProvisionError> {
        Ok(match self.api.get_opt(&sandbox.claim_name).await? {
            Some(claim) => interpret_claim_status(claim.status.as_ref()),
            None => SandboxState::NotFound,
        })
    }

    async fn delete(&self, sandbox: &SandboxRef) -> Result<DeleteOutcome, ProvisionError> {
        match self
            .api
            .delete(&sandbox.claim_name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!(claim = %sandbox.claim_name, "Deleted sandbox claim");
                Ok(DeleteOutcome::Deleted)
            }
            Err(KubeError::Api(response)) if response.code == 404 => {
                debug!(claim = %sandbox.claim_name, "Sandbox claim already gone");
                Ok(DeleteOutcome::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_claims(&self) -> Result<Vec<ClaimSummary>, ProvisionError> {
        let claims = self
            .api
            .list(&ListParams::default().labels(TASK_ID_LABEL))
            .await?;

        Ok(claims
            .items
            .into_iter()
            .map(|claim| ClaimSummary {
                task_id: claim.labels().get(TASK_ID_LABEL).cloned(),
                created_at: claim.metadata.creation_timestamp.as_ref().map(|t| t.0),
                sandbox: SandboxRef {
                    claim_name: claim.name_any(),
                    address: claim.status.as_ref().and_then(|s| s.service_fqdn.clone()),
                },
            })
            .collect())
    }
}
