use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::crds::{AgentTask, SandboxClaim};

pub mod assign;
pub mod config;
pub mod credentials;
pub mod ingest;
pub mod naming;
pub mod reconcile;
pub mod sandbox;
pub mod store;
pub mod sweep;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use reconcile::{ReconcileOutcome, ReconcilePolicy, Reconciler};
pub use types::{Error, Result};

use store::KubeTaskStore;
use types::Context;

pub const TASK_FINALIZER_NAME: &str = "agents.platform/sandbox-cleanup";

/// Default location of the mounted controller configuration
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Fixed delay before retrying a pass that errored
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// Load configuration from the mounted file (or `CONTROLLER_CONFIG_PATH`),
/// falling back to defaults when the file is missing or unreadable.
pub fn load_config() -> Result<ControllerConfig> {
    let path =
        std::env::var("CONTROLLER_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    debug!(%path, "Loading controller configuration");

    let config = match ControllerConfig::from_mounted_file(&path) {
        Ok(cfg) => {
            debug!("Successfully loaded controller configuration");
            cfg
        }
        Err(e) => {
            warn!("Failed to load configuration, using defaults: {}", e);
            ControllerConfig::default()
        }
    };

    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }
    debug!("Configuration validation passed");
    Ok(config)
}

/// Main entry point for the task controller
#[instrument(skip(client, reconciler), fields(namespace = %namespace))]
pub async fn run_task_controller(
    client: Client,
    namespace: String,
    reconciler: Arc<Reconciler>,
) -> Result<()> {
    info!("Starting task controller in namespace: {}", namespace);

    let context = Arc::new(Context {
        client: client.clone(),
        namespace: namespace.clone(),
        reconciler,
    });

    let tasks_api: Api<AgentTask> = Api::namespaced(client.clone(), &namespace);
    let claims_api: Api<SandboxClaim> = Api::namespaced(client, &namespace);

    // Startup visibility: how much in-flight work we are picking up
    match tasks_api.list(&ListParams::default()).await {
        Ok(list) => {
            let live = list
                .items
                .iter()
                .filter(|t| !t.status.as_ref().is_some_and(|s| s.phase.is_terminal()))
                .count();
            info!(
                total = list.items.len(),
                live, "Controller startup: found existing AgentTasks"
            );
        }
        Err(e) => error!("Failed to list AgentTasks at startup: {}", e),
    }

    let watcher_config = Config::default().any_semantic();

    Controller::new(tasks_api, watcher_config.clone())
        .owns(claims_api, watcher_config)
        .run(reconcile_task, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("task_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(task) => debug!(resource = ?task, "AgentTask reconciliation successful"),
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "AgentTask reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("Task controller shutting down");
    Ok(())
}

#[instrument(skip(task, ctx), fields(task_id = %task.name_any()))]
async fn reconcile_task(task: Arc<AgentTask>, ctx: Arc<Context>) -> Result<Action> {
    let tasks_api: Api<AgentTask> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    finalizer(&tasks_api, TASK_FINALIZER_NAME, task, |event| async {
        match event {
            FinalizerEvent::Apply(task) => apply_task(&task, &ctx).await,
            FinalizerEvent::Cleanup(task) => cleanup_task(&task, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("Invalid finalizer name".to_string())
        }
    })
}

async fn apply_task(task: &AgentTask, ctx: &Context) -> Result<Action> {
    let outcome = ctx.reconciler.reconcile(&task.name_any()).await?;
    Ok(match outcome {
        ReconcileOutcome::Requeue(after) => {
            Action::requeue(after.max(Duration::from_millis(500)))
        }
        ReconcileOutcome::Done => Action::await_change(),
    })
}

/// The task is being deleted: make sure its claim goes with it.
async fn cleanup_task(task: &AgentTask, ctx: &Context) -> Result<Action> {
    let record = KubeTaskStore::to_versioned(task.clone())?.record;
    ctx.reconciler.release_sandbox(&record).await?;
    info!(task_id = %record.id, "AgentTask deleted, sandbox released");
    Ok(Action::await_change())
}

fn error_policy(task: Arc<AgentTask>, err: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        error = %err,
        task_id = %task.name_any(),
        namespace = %ctx.namespace,
        "AgentTask reconciliation failed, retrying"
    );
    Action::requeue(ERROR_REQUEUE)
}
