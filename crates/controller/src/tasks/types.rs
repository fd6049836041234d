use std::sync::Arc;

use kube::Client;
use thiserror::Error;

use crate::tasks::reconcile::{ReconcileError, Reconciler};
use crate::tasks::sandbox::ProvisionError;
use crate::tasks::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sandbox error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<ReconcileError> for Error {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Store(e) => Self::Store(e),
            ReconcileError::Provision(e) => Self::Provision(e),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to every reconcile pass
pub(crate) struct Context {
    pub client: Client,
    pub namespace: String,
    pub reconciler: Arc<Reconciler>,
}
