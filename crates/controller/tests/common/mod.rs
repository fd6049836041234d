//! Shared harness: in-memory store and sandboxes, a wiremock worker and a
//! wiremock callback receiver.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use notify::{CallbackChannel, Notifier, NotifyChannel, RetryPolicy};
use sandbox_controller::api::{router, AppState};
use sandbox_controller::crds::{AgentTaskSpec, AgentTaskStatus, RepositoryRef};
use sandbox_controller::tasks::assign::HttpAssignmentClient;
use sandbox_controller::tasks::credentials::{
    CredentialExchange, CredentialGrant, CredentialIssuer, ExchangeError,
};
use sandbox_controller::tasks::sandbox::{MemorySandboxProvisioner, SandboxState};
use sandbox_controller::tasks::store::{MemoryTaskStore, TaskStore};
use sandbox_controller::{ReconcilePolicy, Reconciler};
use wiremock::MockServer;

pub const SIGNING_SECRET: &[u8] = b"callback-secret";

/// Exchange that hands out numbered tokens and counts upstream calls
#[derive(Default)]
pub struct CountingExchange {
    calls: AtomicU32,
}

impl CountingExchange {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialExchange for CountingExchange {
    async fn exchange(&self, _repository: &RepositoryRef) -> Result<CredentialGrant, ExchangeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        // Give concurrent requests a chance to interleave.
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(CredentialGrant {
            credential: format!("ghs_token_{n}"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryTaskStore>,
    pub sandboxes: Arc<MemorySandboxProvisioner>,
    pub exchange: Arc<CountingExchange>,
    pub reconciler: Arc<Reconciler>,
    pub issuer: CredentialIssuer,
    pub worker: MockServer,
    pub receiver: MockServer,
}

pub fn policy() -> ReconcilePolicy {
    ReconcilePolicy {
        provisioning_window: Duration::from_secs(30),
        provisioning_poll: Duration::from_millis(100),
        running_poll: Duration::from_millis(500),
        task_timeout: Duration::from_secs(120),
        assignment_max_attempts: 3,
        assignment_initial_backoff: Duration::from_millis(10),
        assignment_max_backoff: Duration::from_millis(40),
        callback_api_address: "http://sandbox-controller.agents.svc:8080".to_string(),
    }
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_policy(policy()).await
    }

    pub async fn with_policy(policy: ReconcilePolicy) -> Self {
        let worker = MockServer::start().await;
        let receiver = MockServer::start().await;

        let store = Arc::new(MemoryTaskStore::new());
        let sandboxes = Arc::new(MemorySandboxProvisioner::new());
        let exchange = Arc::new(CountingExchange::default());

        let assigner =
            HttpAssignmentClient::new(worker.address().port(), Duration::from_secs(2)).unwrap();
        let callbacks = CallbackChannel::new(
            SIGNING_SECRET,
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(10),
                request_timeout: Duration::from_secs(2),
            },
        );
        let notifier = Notifier::with_channels(vec![Arc::new(callbacks) as Arc<dyn NotifyChannel>]);

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            sandboxes.clone(),
            Arc::new(assigner),
            Arc::new(notifier),
            policy,
        ));
        let issuer = CredentialIssuer::new(store.clone(), Some(exchange.clone()));

        Self {
            store,
            sandboxes,
            exchange,
            reconciler,
            issuer,
            worker,
            receiver,
        }
    }

    pub fn app(&self) -> axum::Router {
        router(AppState {
            store: self.store.clone(),
            reconciler: self.reconciler.clone(),
            issuer: self.issuer.clone(),
        })
    }

    pub fn spec(&self) -> AgentTaskSpec {
        AgentTaskSpec {
            description: "make the build green".to_string(),
            context: None,
            source_reference: Some("https://github.com/acme/app/issues/9".to_string()),
            repository: RepositoryRef {
                url: "https://github.com/acme/app".to_string(),
                git_ref: "main".to_string(),
            },
            callback_url: Some(format!("{}/hooks/tasks", self.receiver.uri())),
            sandbox_template: None,
        }
    }

    pub async fn create(&self, id: &str) {
        self.store.create(id, self.spec()).await.unwrap();
    }

    pub async fn status(&self, id: &str) -> AgentTaskStatus {
        self.store.get(id).await.unwrap().unwrap().record.status
    }

    pub async fn pass(&self, id: &str) {
        self.reconciler.reconcile(id).await.unwrap();
    }

    /// Report the sandbox ready at the worker mock's address
    pub async fn sandbox_ready(&self, id: &str) {
        self.sandboxes
            .set_state(
                id,
                SandboxState::Ready {
                    address: self.worker.address().ip().to_string(),
                },
            )
            .await;
    }

    pub async fn sandbox_exited(&self, id: &str) {
        self.sandboxes
            .set_state(
                id,
                SandboxState::Exited {
                    reason: Some("PodCompleted".to_string()),
                },
            )
            .await;
    }
}
