//! Credential Issuer: at most one scoped credential per task.
//!
//! Issuance is reserved by writing `TokenIssued=True` through the store's
//! compare-and-swap before any upstream call is made. Of N concurrent
//! requests exactly one wins the reservation; the others see the condition
//! and are told `AlreadyIssued`. An upstream failure, or the request being
//! dropped mid-exchange, releases the reservation so nothing about the
//! failure lands on the task.

mod github_app;

pub use github_app::{GitHubAppExchange, GitHubAppSettings};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::crds::{ConditionType, Phase, RepositoryRef};
use crate::tasks::store::{modify_status, StoreError, TaskStore};

const REASON_ISSUED: &str = "Issued";

/// Credential handed to a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialGrant {
    pub credential: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Worth another attempt: transport failure, upstream 5xx or 429
    #[error("Transient upstream failure: {0}")]
    Transient(String),

    #[error("Upstream rejected exchange with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to sign assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("Repository URL '{0}' does not name an owner and repository")]
    InvalidRepository(String),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Task {0} not found")]
    UnknownTask(String),

    #[error("Credential already issued for task {0}")]
    AlreadyIssued(String),

    #[error("Task {id} is already {phase}")]
    TaskTerminal { id: String, phase: Phase },

    #[error("Credential exchange is not configured")]
    NotConfigured,

    #[error("Credential exchange failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Swaps the controller's identity for a credential scoped to one repository
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn exchange(&self, repository: &RepositoryRef) -> Result<CredentialGrant, ExchangeError>;
}

#[derive(Clone)]
pub struct CredentialIssuer {
    store: Arc<dyn TaskStore>,
    exchange: Option<Arc<dyn CredentialExchange>>,
}

enum Reservation {
    Reserved(RepositoryRef),
    Refused(CredentialError),
}

impl CredentialIssuer {
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, exchange: Option<Arc<dyn CredentialExchange>>) -> Self {
        Self { store, exchange }
    }

    /// Issue the task's single credential.
    pub async fn issue(&self, task_id: &str) -> Result<CredentialGrant, CredentialError> {
        let exchange = self
            .exchange
            .as_ref()
            .ok_or(CredentialError::NotConfigured)?;

        let repository = match self.reserve(task_id).await? {
            Reservation::Reserved(repository) => repository,
            Reservation::Refused(err) => return Err(err),
        };

        let guard = ReservationGuard {
            issuer: Some(self.clone()),
            task_id: task_id.to_string(),
        };
        match exchange.exchange(&repository).await {
            Ok(grant) => {
                guard.disarm();
                info!(task_id, expires_at = %grant.expires_at, "Issued credential");
                Ok(grant)
            }
            Err(err) => {
                guard.disarm();
                warn!(task_id, error = %err, "Credential exchange failed, releasing reservation");
                self.release(task_id).await;
                Err(err.into())
            }
        }
    }

    async fn reserve(&self, task_id: &str) -> Result<Reservation, CredentialError> {
        let modified = modify_status(self.store.as_ref(), task_id, |record| {
            let status = &record.status;
            if status.phase.is_terminal() || status.has_condition(ConditionType::TokenIssued) {
                return None;
            }
            let mut next = status.clone();
            next.set_condition(ConditionType::TokenIssued, true, REASON_ISSUED, None);
            Some(next)
        })
        .await
        .map_err(|e| match e {
            StoreError::NotFound(id) => CredentialError::UnknownTask(id),
            other => CredentialError::Store(other),
        })?;

        let applied = modified.applied();
        let record = modified.into_task().record;
        if applied {
            return Ok(Reservation::Reserved(record.spec.repository));
        }

        let refusal = if record.status.phase.is_terminal() {
            CredentialError::TaskTerminal {
                id: record.id,
                phase: record.status.phase,
            }
        } else {
            CredentialError::AlreadyIssued(record.id)
        };
        Ok(Reservation::Refused(refusal))
    }

    async fn release(&self, task_id: &str) {
        let result = modify_status(self.store.as_ref(), task_id, |record| {
            if !record.status.has_condition(ConditionType::TokenIssued) {
                return None;
            }
            let mut next = record.status.clone();
            next.remove_condition(ConditionType::TokenIssued);
            Some(next)
        })
        .await;

        if let Err(e) = result {
            warn!(task_id, error = %e, "Failed to release credential reservation");
        }
    }
}

/// Releases a reservation whose exchange never finished, e.g. because the
/// caller went away while waiting on upstream.
struct ReservationGuard {
    issuer: Option<CredentialIssuer>,
    task_id: String,
}

impl ReservationGuard {
    fn disarm(mut self) {
        self.issuer = None;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let Some(issuer) = self.issuer.take() else {
            return;
        };
        let task_id = std::mem::take(&mut self.task_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(task_id, "Credential request abandoned mid-exchange, releasing reservation");
                runtime.spawn(async move { issuer.release(&task_id).await });
            }
            Err(_) => warn!(task_id, "No runtime to release abandoned credential reservation"),
        }
    }
}
