//! Reconciler: drives one task through its phases.
//!
//! A pass reads the task, looks at the world (sandbox state, clocks) and
//! performs at most one externally visible step before returning when to
//! look again. Everything it needs to resume is in the persisted status, so
//! a pass interrupted at any point is finished by the next one.
//!
//! Terminal transitions race with status ingest. Both go through
//! [`modify_status`], so the first writer wins and the other's change is
//! dropped on re-read.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{Delivery, Notifier, OutcomeEvent, TaskOutcome};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::crds::{AgentTaskStatus, ConditionType, Phase, TerminalReason};
use crate::tasks::assign::{AssignError, AssignmentClient};
use crate::tasks::config::ControllerConfig;
use crate::tasks::naming::ResourceNaming;
use crate::tasks::sandbox::{
    DeleteOutcome, ProvisionError, SandboxProvisioner, SandboxRef, SandboxState,
};
use crate::tasks::store::{modify_status, StoreError, TaskRecord, TaskStore, VersionedTask};

const REASON_CALLBACK_SENT: &str = "CallbackSent";
const REASON_CALLBACK_FAILED: &str = "CallbackFailed";
const REASON_NO_CALLBACK: &str = "NoCallback";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

/// When to look at a task again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Requeue(Duration),
    /// Nothing left to do until the task changes
    Done,
}

/// Timing and retry policy for the state machine
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub provisioning_window: Duration,
    pub provisioning_poll: Duration,
    pub running_poll: Duration,
    pub task_timeout: Duration,
    pub assignment_max_attempts: u32,
    pub assignment_initial_backoff: Duration,
    pub assignment_max_backoff: Duration,
    /// Address workers report status to
    pub callback_api_address: String,
}

impl ReconcilePolicy {
    #[must_use]
    pub fn from_config(config: &ControllerConfig, callback_api_address: &str) -> Self {
        Self {
            provisioning_window: Duration::from_secs(config.provisioning.window_seconds),
            provisioning_poll: Duration::from_secs(config.provisioning.poll_interval_seconds),
            running_poll: Duration::from_secs(config.running.poll_interval_seconds),
            task_timeout: Duration::from_secs(config.running.task_timeout_seconds),
            assignment_max_attempts: config.assignment.max_attempts,
            assignment_initial_backoff: Duration::from_secs(
                config.assignment.initial_backoff_seconds,
            ),
            assignment_max_backoff: Duration::from_secs(config.assignment.max_backoff_seconds),
            callback_api_address: callback_api_address.to_string(),
        }
    }

    /// Delay before assignment attempt `attempts + 1`
    #[must_use]
    pub fn assignment_backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.assignment_initial_backoff
            .saturating_mul(factor)
            .min(self.assignment_max_backoff)
    }
}

fn elapsed_since(instant: DateTime<Utc>) -> Duration {
    (Utc::now() - instant).to_std().unwrap_or_default()
}

fn sandbox_of(record: &TaskRecord) -> SandboxRef {
    record.status.sandbox.clone().unwrap_or_else(|| SandboxRef {
        claim_name: ResourceNaming::claim_name(&record.id),
        address: None,
    })
}

fn outcome_of(phase: Phase) -> TaskOutcome {
    match phase {
        Phase::Completed => TaskOutcome::Completed,
        Phase::TimedOut => TaskOutcome::TimedOut,
        Phase::Canceled => TaskOutcome::Canceled,
        _ => TaskOutcome::Failed,
    }
}

pub struct Reconciler {
    store: Arc<dyn TaskStore>,
    provisioner: Arc<dyn SandboxProvisioner>,
    assigner: Arc<dyn AssignmentClient>,
    notifier: Arc<Notifier>,
    policy: ReconcilePolicy,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        provisioner: Arc<dyn SandboxProvisioner>,
        assigner: Arc<dyn AssignmentClient>,
        notifier: Arc<Notifier>,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            store,
            provisioner,
            assigner,
            notifier,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Run one reconcile pass for a task.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, task_id: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(task) = self.store.get(task_id).await? else {
            debug!("Task no longer exists");
            return Ok(ReconcileOutcome::Done);
        };
        let phase = task.record.status.phase;

        if phase.is_terminal() {
            return self.cleanup(task).await;
        }

        if elapsed_since(task.record.created_at) >= self.policy.task_timeout {
            return self
                .finish(
                    task_id,
                    TerminalReason::TaskTimeout,
                    format!(
                        "task exceeded its {}s deadline in phase {phase}",
                        self.policy.task_timeout.as_secs()
                    ),
                )
                .await;
        }

        match phase {
            Phase::Pending => self.start_provisioning(task).await,
            Phase::Provisioning => self.await_readiness(task).await,
            Phase::Ready | Phase::Assigning => self.assign(task).await,
            Phase::Running => self.watch_running(task).await,
            Phase::Completed | Phase::Failed | Phase::TimedOut | Phase::Canceled => {
                self.cleanup(task).await
            }
        }
    }

    /// Cancel a task. Returns the phase it ended in, or `None` if unknown.
    ///
    /// Already-terminal tasks keep their outcome. Cleanup runs on the next
    /// reconcile pass.
    pub async fn cancel(&self, task_id: &str) -> Result<Option<Phase>, ReconcileError> {
        let result = modify_status(self.store.as_ref(), task_id, |record| {
            let mut status = record.status.clone();
            status
                .terminate(
                    TerminalReason::Canceled,
                    Some("canceled by request".to_string()),
                )
                .then_some(status)
        })
        .await;

        match result {
            Ok(modified) => {
                let applied = modified.applied();
                let phase = modified.into_task().record.status.phase;
                if applied {
                    info!(task_id, "Task canceled");
                }
                Ok(Some(phase))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a task's claim regardless of phase; used when the task itself
    /// is being deleted.
    pub async fn release_sandbox(&self, record: &TaskRecord) -> Result<(), ReconcileError> {
        if record.status.has_condition(ConditionType::SandboxDeleted) {
            return Ok(());
        }
        let sandbox = sandbox_of(record);
        let outcome = self.provisioner.delete(&sandbox).await?;
        info!(task_id = %record.id, claim = %sandbox.claim_name, ?outcome, "Released sandbox");
        Ok(())
    }

    async fn start_provisioning(&self, task: VersionedTask) -> Result<ReconcileOutcome, ReconcileError> {
        let modified = modify_status(self.store.as_ref(), &task.record.id, |record| {
            if record.status.phase != Phase::Pending {
                return None;
            }
            let mut status = record.status.clone();
            status.phase = Phase::Provisioning;
            status.provisioning_started_at = Some(Utc::now());
            Some(status)
        })
        .await?;

        let task = modified.into_task();
        match task.record.status.phase {
            Phase::Provisioning => {
                info!(task_id = %task.record.id, "Provisioning sandbox");
                self.await_readiness(task).await
            }
            _ => Ok(ReconcileOutcome::Requeue(Duration::ZERO)),
        }
    }

    async fn await_readiness(&self, task: VersionedTask) -> Result<ReconcileOutcome, ReconcileError> {
        let record = &task.record;
        let started = record
            .status
            .provisioning_started_at
            .unwrap_or(record.created_at);
        let window_elapsed = elapsed_since(started) >= self.policy.provisioning_window;

        let Some(sandbox) = record.status.sandbox.clone() else {
            if window_elapsed {
                return self.provisioning_timeout(&record.id).await;
            }
            return self.provision(record).await;
        };

        match self.provisioner.poll(&sandbox).await? {
            SandboxState::Ready { address } => self.mark_ready(&record.id, address).await,
            _ if window_elapsed => self.provisioning_timeout(&record.id).await,
            // Before readiness, Ready=False only means the sandbox is still starting.
            SandboxState::Unknown | SandboxState::Exited { .. } => {
                Ok(self.requeue(record, self.policy.provisioning_poll))
            }
            SandboxState::NotFound => {
                // Nothing has been assigned yet, so start over with a fresh claim.
                warn!(task_id = %record.id, claim = %sandbox.claim_name, "Sandbox claim vanished before readiness, re-provisioning");
                modify_status(self.store.as_ref(), &record.id, |current| {
                    if current.status.phase != Phase::Provisioning
                        || current.status.sandbox.is_none()
                    {
                        return None;
                    }
                    let mut status = current.status.clone();
                    status.sandbox = None;
                    Some(status)
                })
                .await?;
                Ok(self.requeue(record, self.policy.provisioning_poll))
            }
        }
    }

    async fn provision(&self, record: &TaskRecord) -> Result<ReconcileOutcome, ReconcileError> {
        let sandbox = match self.provisioner.provision(record).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!(task_id = %record.id, error = %e, "Sandbox provisioning failed");
                return Ok(self.requeue(record, self.policy.provisioning_poll));
            }
        };

        let modified = modify_status(self.store.as_ref(), &record.id, |current| {
            if current.status.phase != Phase::Provisioning || current.status.sandbox.is_some() {
                return None;
            }
            let mut status = current.status.clone();
            status.sandbox = Some(sandbox.clone());
            Some(status)
        })
        .await?;

        if modified.applied() {
            info!(task_id = %record.id, claim = %sandbox.claim_name, "Sandbox claim requested");
        }
        Ok(self.requeue(record, self.policy.provisioning_poll))
    }

    async fn mark_ready(
        &self,
        task_id: &str,
        address: String,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let modified = modify_status(self.store.as_ref(), task_id, |record| {
            if record.status.phase != Phase::Provisioning {
                return None;
            }
            let mut status = record.status.clone();
            status.phase = Phase::Ready;
            status.ready_at = Some(Utc::now());
            status.set_condition(ConditionType::SandboxReady, true, "Ready", None);
            if let Some(sandbox) = status.sandbox.as_mut() {
                sandbox.address = Some(address.clone());
            }
            Some(status)
        })
        .await?;

        if modified.applied() {
            info!(task_id, %address, "Sandbox ready");
        }
        let task = modified.into_task();
        if task.record.status.phase == Phase::Ready {
            self.assign(task).await
        } else {
            Ok(ReconcileOutcome::Requeue(Duration::ZERO))
        }
    }

    async fn provisioning_timeout(&self, task_id: &str) -> Result<ReconcileOutcome, ReconcileError> {
        self.finish(
            task_id,
            TerminalReason::ProvisioningTimeout,
            format!(
                "sandbox not ready within {}s",
                self.policy.provisioning_window.as_secs()
            ),
        )
        .await
    }

    async fn assign(&self, task: VersionedTask) -> Result<ReconcileOutcome, ReconcileError> {
        let record = &task.record;
        let sandbox = sandbox_of(record);

        let address = match self.provisioner.poll(&sandbox).await? {
            SandboxState::Ready { address } => address,
            SandboxState::Unknown => match sandbox.address.clone() {
                Some(address) => address,
                None => return Ok(self.requeue(record, self.policy.provisioning_poll)),
            },
            state @ (SandboxState::Exited { .. } | SandboxState::NotFound) => {
                return self
                    .finish(
                        &record.id,
                        TerminalReason::RunnerExitedWithoutStatus,
                        format!("sandbox went away before the task started ({state:?})"),
                    )
                    .await;
            }
        };

        // Record that an assignment may be in flight before sending it.
        if record.status.phase == Phase::Ready {
            let modified = modify_status(self.store.as_ref(), &record.id, |current| {
                if current.status.phase != Phase::Ready {
                    return None;
                }
                let mut status = current.status.clone();
                status.phase = Phase::Assigning;
                Some(status)
            })
            .await?;
            if modified.into_task().record.status.phase != Phase::Assigning {
                return Ok(ReconcileOutcome::Requeue(Duration::ZERO));
            }
        }

        let attempt = record.status.assignment_attempts + 1;
        debug!(task_id = %record.id, attempt, %address, "Assigning task");

        match self
            .assigner
            .assign(&address, &record.id, &self.policy.callback_api_address)
            .await
        {
            Ok(assignment) => {
                let modified = modify_status(self.store.as_ref(), &record.id, |current| {
                    if !matches!(current.status.phase, Phase::Ready | Phase::Assigning) {
                        return None;
                    }
                    let mut status = current.status.clone();
                    status.phase = Phase::Running;
                    status.assigned_at.get_or_insert_with(Utc::now);
                    status.last_assignment_error = None;
                    Some(status)
                })
                .await?;
                if modified.applied() {
                    info!(task_id = %record.id, ?assignment, "Task assigned");
                }
                Ok(self.requeue(record, self.policy.running_poll))
            }
            Err(AssignError::ConnectionRefused(_)) if self.within_grace(&record.status) => {
                debug!(task_id = %record.id, "Worker not listening yet");
                self.record_assignment_error(&record.id, "connection refused", false)
                    .await?;
                Ok(self.requeue(record, self.policy.provisioning_poll))
            }
            Err(e) => {
                let message = e.to_string();
                if attempt >= self.policy.assignment_max_attempts {
                    warn!(task_id = %record.id, attempt, error = %message, "Assignment retries exhausted");
                    return self
                        .finish(
                            &record.id,
                            TerminalReason::AssignmentFailure,
                            format!("assignment failed after {attempt} attempts: {message}"),
                        )
                        .await;
                }
                warn!(task_id = %record.id, attempt, error = %message, "Assignment attempt failed");
                self.record_assignment_error(&record.id, &message, true)
                    .await?;
                Ok(self.requeue(record, self.policy.assignment_backoff(attempt)))
            }
        }
    }

    /// Connection refusals are expected while the worker boots, for as long
    /// as the provisioning window would have allowed.
    fn within_grace(&self, status: &AgentTaskStatus) -> bool {
        status
            .ready_at
            .or(status.provisioning_started_at)
            .is_some_and(|since| elapsed_since(since) < self.policy.provisioning_window)
    }

    async fn record_assignment_error(
        &self,
        task_id: &str,
        message: &str,
        counted: bool,
    ) -> Result<(), ReconcileError> {
        modify_status(self.store.as_ref(), task_id, |record| {
            if record.status.phase != Phase::Assigning {
                return None;
            }
            let mut status = record.status.clone();
            if counted {
                status.assignment_attempts += 1;
            }
            status.last_assignment_error = Some(message.to_string());
            Some(status)
        })
        .await?;
        Ok(())
    }

    async fn watch_running(&self, task: VersionedTask) -> Result<ReconcileOutcome, ReconcileError> {
        let record = &task.record;
        match self.provisioner.poll(&sandbox_of(record)).await? {
            SandboxState::Ready { .. } | SandboxState::Unknown => {
                Ok(self.requeue(record, self.policy.running_poll))
            }
            SandboxState::Exited { reason } => {
                self.finish(
                    &record.id,
                    TerminalReason::RunnerExitedWithoutStatus,
                    format!(
                        "worker exited without reporting an outcome ({})",
                        reason.as_deref().unwrap_or("no reason given")
                    ),
                )
                .await
            }
            SandboxState::NotFound => {
                self.finish(
                    &record.id,
                    TerminalReason::RunnerExitedWithoutStatus,
                    "sandbox disappeared without the worker reporting an outcome".to_string(),
                )
                .await
            }
        }
    }

    /// Terminalize a task, unless another writer already did, then clean up.
    async fn finish(
        &self,
        task_id: &str,
        reason: TerminalReason,
        message: String,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let modified = modify_status(self.store.as_ref(), task_id, |record| {
            let mut status = record.status.clone();
            status
                .terminate(reason, Some(message.clone()))
                .then_some(status)
        })
        .await?;

        if modified.applied() {
            info!(task_id, %reason, %message, "Task finished");
        } else {
            debug!(task_id, %reason, "Task already terminal, keeping existing outcome");
        }
        self.cleanup(modified.into_task()).await
    }

    /// Delete the sandbox, then notify. Each step is recorded as a condition
    /// and skipped once recorded, so cleanup can be re-run safely.
    async fn cleanup(&self, task: VersionedTask) -> Result<ReconcileOutcome, ReconcileError> {
        let record = task.record;

        if !record.status.has_condition(ConditionType::SandboxDeleted) {
            let sandbox = sandbox_of(&record);
            let outcome = self.provisioner.delete(&sandbox).await?;
            let reason = match outcome {
                DeleteOutcome::Deleted => "Deleted",
                DeleteOutcome::NotFound => "AlreadyGone",
            };
            modify_status(self.store.as_ref(), &record.id, |current| {
                if current.status.has_condition(ConditionType::SandboxDeleted) {
                    return None;
                }
                let mut status = current.status.clone();
                status.set_condition(ConditionType::SandboxDeleted, true, reason, None);
                Some(status)
            })
            .await?;
            info!(task_id = %record.id, claim = %sandbox.claim_name, ?outcome, "Sandbox cleaned up");
        }

        if !record.status.has_condition(ConditionType::Notified) {
            let (delivered, reason, message) = self.notify(&record).await;
            modify_status(self.store.as_ref(), &record.id, |current| {
                if current.status.has_condition(ConditionType::Notified) {
                    return None;
                }
                let mut status = current.status.clone();
                status.set_condition(ConditionType::Notified, delivered, reason, message.clone());
                Some(status)
            })
            .await?;
        }

        Ok(ReconcileOutcome::Done)
    }

    async fn notify(&self, record: &TaskRecord) -> (bool, &'static str, Option<String>) {
        let Some(callback_url) = record.spec.callback_url.clone() else {
            return (false, REASON_NO_CALLBACK, None);
        };

        let status = &record.status;
        let event = OutcomeEvent {
            task_id: record.id.clone(),
            callback_url,
            outcome: outcome_of(status.phase),
            reason: status
                .reason
                .map_or_else(|| status.phase.to_string(), |r| r.to_string()),
            pr_url: status.pull_request_url.clone(),
            message: status.message.clone(),
            completed_at: status.completed_at.unwrap_or_else(Utc::now),
        };

        match self.notifier.deliver(&event).await {
            Delivery::Sent => (true, REASON_CALLBACK_SENT, None),
            Delivery::Failed(message) => {
                warn!(task_id = %record.id, %message, "Outcome callback failed");
                (false, REASON_CALLBACK_FAILED, Some(message))
            }
        }
    }

    /// Requeue no later than the task's overall deadline.
    fn requeue(&self, record: &TaskRecord, after: Duration) -> ReconcileOutcome {
        let remaining = self
            .policy
            .task_timeout
            .saturating_sub(elapsed_since(record.created_at));
        ReconcileOutcome::Requeue(after.min(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::assign::Assignment;
    use crate::tasks::sandbox::MemorySandboxProvisioner;
    use crate::tasks::store::MemoryTaskStore;
    use crate::tasks::test_support::{spec, RecordingChannel, ScriptedAssigner};

    struct Harness {
        store: Arc<MemoryTaskStore>,
        sandboxes: Arc<MemorySandboxProvisioner>,
        assigner: Arc<ScriptedAssigner>,
        callbacks: Arc<RecordingChannel>,
        reconciler: Reconciler,
    }

    fn policy() -> ReconcilePolicy {
        ReconcilePolicy {
            provisioning_window: Duration::from_secs(60),
            provisioning_poll: Duration::from_secs(1),
            running_poll: Duration::from_secs(5),
            task_timeout: Duration::from_secs(600),
            assignment_max_attempts: 3,
            assignment_initial_backoff: Duration::from_secs(2),
            assignment_max_backoff: Duration::from_secs(5),
            callback_api_address: "http://controller:8080".to_string(),
        }
    }

    fn harness_with(policy: ReconcilePolicy) -> Harness {
        let store = Arc::new(MemoryTaskStore::new());
        let sandboxes = Arc::new(MemorySandboxProvisioner::new());
        let assigner = Arc::new(ScriptedAssigner::default());
        let callbacks = Arc::new(RecordingChannel::default());
        let notifier = Arc::new(Notifier::with_channels(vec![
            callbacks.clone() as Arc<dyn notify::NotifyChannel>
        ]));
        let reconciler = Reconciler::new(
            store.clone(),
            sandboxes.clone(),
            assigner.clone(),
            notifier,
            policy,
        );
        Harness {
            store,
            sandboxes,
            assigner,
            callbacks,
            reconciler,
        }
    }

    fn harness() -> Harness {
        harness_with(policy())
    }

    impl Harness {
        async fn create(&self, id: &str) {
            let mut spec = spec();
            spec.callback_url = Some("https://origin.example.com/hook".to_string());
            self.store.create(id, spec).await.unwrap();
        }

        async fn status(&self, id: &str) -> AgentTaskStatus {
            self.store.get(id).await.unwrap().unwrap().record.status
        }

        async fn pass(&self, id: &str) -> ReconcileOutcome {
            self.reconciler.reconcile(id).await.unwrap()
        }

        async fn ready(&self, id: &str) {
            self.sandboxes
                .set_state(
                    id,
                    SandboxState::Ready {
                        address: format!("sbx-{id}.agents.svc"),
                    },
                )
                .await;
        }

        /// Drive a fresh task to `Running`
        async fn running(&self, id: &str) {
            self.create(id).await;
            self.pass(id).await;
            self.ready(id).await;
            self.assigner.reply(Ok(Assignment::Accepted)).await;
            self.pass(id).await;
            assert_eq!(self.status(id).await.phase, Phase::Running);
        }
    }

    #[test]
    fn test_assignment_backoff_is_capped() {
        let policy = policy();
        assert_eq!(policy.assignment_backoff(1), Duration::from_secs(2));
        assert_eq!(policy.assignment_backoff(2), Duration::from_secs(4));
        assert_eq!(policy.assignment_backoff(3), Duration::from_secs(5));
        assert_eq!(policy.assignment_backoff(30), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pending_task_gets_one_claim() {
        let h = harness();
        h.create("t1").await;

        let outcome = h.pass("t1").await;
        h.pass("t1").await;
        h.pass("t1").await;

        assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(1)));
        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::Provisioning);
        assert_eq!(status.sandbox.unwrap().claim_name, "sbx-t1");
        assert!(status.provisioning_started_at.is_some());
        assert_eq!(h.sandboxes.create_count().await, 1);
    }

    #[tokio::test]
    async fn test_ready_sandbox_is_assigned() {
        let h = harness();
        h.running("t1").await;

        let status = h.status("t1").await;
        assert!(status.has_condition(ConditionType::SandboxReady));
        assert!(status.assigned_at.is_some());
        assert_eq!(
            status.sandbox.unwrap().address.as_deref(),
            Some("sbx-t1.agents.svc")
        );
        assert_eq!(
            h.assigner.calls().await,
            vec![("sbx-t1.agents.svc".to_string(), "t1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_conflict_reply_counts_as_assigned() {
        let h = harness();
        h.create("t1").await;
        h.pass("t1").await;
        h.ready("t1").await;
        h.assigner
            .reply(Err(AssignError::UnexpectedStatus {
                status: 504,
                body: "gateway timeout".to_string(),
            }))
            .await;
        h.assigner.reply(Ok(Assignment::AlreadyAssigned)).await;

        assert_eq!(
            h.pass("t1").await,
            ReconcileOutcome::Requeue(Duration::from_secs(2))
        );
        assert_eq!(h.status("t1").await.assignment_attempts, 1);
        h.pass("t1").await;

        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::Running);
        assert_eq!(status.last_assignment_error, None);
        assert_eq!(h.sandboxes.create_count().await, 1);
    }

    #[tokio::test]
    async fn test_assignment_ceiling_fails_task() {
        let h = harness();
        h.create("t1").await;
        h.pass("t1").await;
        h.ready("t1").await;
        for _ in 0..3 {
            h.assigner
                .reply(Err(AssignError::UnexpectedStatus {
                    status: 500,
                    body: String::new(),
                }))
                .await;
        }

        h.pass("t1").await;
        h.pass("t1").await;
        let outcome = h.pass("t1").await;

        assert_eq!(outcome, ReconcileOutcome::Done);
        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.reason, Some(TerminalReason::AssignmentFailure));
        assert!(status.has_condition(ConditionType::SandboxDeleted));
        assert!(!h.sandboxes.exists("t1").await);
    }

    #[tokio::test]
    async fn test_connection_refused_within_grace_is_not_counted() {
        let h = harness();
        h.create("t1").await;
        h.pass("t1").await;
        h.ready("t1").await;
        for _ in 0..5 {
            h.assigner
                .reply(Err(AssignError::ConnectionRefused("sbx".to_string())))
                .await;
        }
        h.assigner.reply(Ok(Assignment::Accepted)).await;

        for _ in 0..6 {
            h.pass("t1").await;
        }

        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::Running);
        assert_eq!(status.assignment_attempts, 0);
    }

    #[tokio::test]
    async fn test_provisioning_timeout_skips_assignment() {
        let mut policy = policy();
        policy.provisioning_window = Duration::from_millis(50);
        let h = harness_with(policy);
        h.create("t1").await;
        h.pass("t1").await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let outcome = h.pass("t1").await;

        assert_eq!(outcome, ReconcileOutcome::Done);
        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::TimedOut);
        assert_eq!(status.reason, Some(TerminalReason::ProvisioningTimeout));
        assert!(h.assigner.calls().await.is_empty());
        assert_eq!(h.sandboxes.deletion_count().await, 1);
    }

    #[tokio::test]
    async fn test_not_ready_sandbox_is_waited_on() {
        let h = harness();
        h.create("t1").await;
        h.pass("t1").await;
        h.sandboxes
            .set_state(
                "t1",
                SandboxState::Exited {
                    reason: Some("SandboxNotReady".to_string()),
                },
            )
            .await;

        for _ in 0..3 {
            let outcome = h.pass("t1").await;
            assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(1)));
        }

        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::Provisioning);
        assert!(status.sandbox.is_some());
        assert!(h.sandboxes.exists("t1").await);
        assert_eq!(h.sandboxes.delete_calls().await, 0);
        assert_eq!(h.sandboxes.create_count().await, 1);

        h.ready("t1").await;
        h.assigner.reply(Ok(Assignment::Accepted)).await;
        h.pass("t1").await;
        assert_eq!(h.status("t1").await.phase, Phase::Running);
    }

    #[tokio::test]
    async fn test_not_ready_sandbox_times_out() {
        let mut policy = policy();
        policy.provisioning_window = Duration::from_millis(50);
        let h = harness_with(policy);
        h.create("t1").await;
        h.pass("t1").await;
        h.sandboxes
            .set_state("t1", SandboxState::Exited { reason: None })
            .await;
        h.pass("t1").await;
        assert_eq!(h.sandboxes.delete_calls().await, 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        h.pass("t1").await;

        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::TimedOut);
        assert_eq!(status.reason, Some(TerminalReason::ProvisioningTimeout));
        assert_eq!(h.sandboxes.deletion_count().await, 1);
    }

    #[tokio::test]
    async fn test_vanished_claim_before_ready_reprovisions() {
        let h = harness();
        h.create("t1").await;
        h.pass("t1").await;
        h.sandboxes.vanish("t1").await;

        h.pass("t1").await;
        assert!(h.status("t1").await.sandbox.is_none());
        assert_eq!(h.sandboxes.delete_calls().await, 0);
        h.pass("t1").await;

        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::Provisioning);
        assert!(status.sandbox.is_some());
        assert_eq!(h.sandboxes.create_count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_provision_is_retried() {
        let h = harness();
        h.sandboxes.fail_next_provisions(2).await;
        h.create("t1").await;

        h.pass("t1").await;
        h.pass("t1").await;
        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::Provisioning);
        assert!(status.sandbox.is_none());
        assert_eq!(h.sandboxes.create_count().await, 0);

        h.pass("t1").await;
        let status = h.status("t1").await;
        assert!(status.sandbox.is_some());
        assert_eq!(h.sandboxes.create_count().await, 1);

        h.ready("t1").await;
        h.assigner.reply(Ok(Assignment::Accepted)).await;
        h.pass("t1").await;
        assert_eq!(h.status("t1").await.phase, Phase::Running);
        assert_eq!(h.sandboxes.create_count().await, 1);
    }

    #[tokio::test]
    async fn test_persistent_provision_failure_times_out() {
        let mut policy = policy();
        policy.provisioning_window = Duration::from_millis(50);
        let h = harness_with(policy);
        h.sandboxes.fail_next_provisions(u32::MAX).await;
        h.create("t1").await;

        h.pass("t1").await;
        h.pass("t1").await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        h.pass("t1").await;

        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::TimedOut);
        assert_eq!(status.reason, Some(TerminalReason::ProvisioningTimeout));
        assert_eq!(h.sandboxes.create_count().await, 0);
        assert!(h.assigner.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_runner_exit_fails_task() {
        let h = harness();
        h.running("t1").await;
        h.sandboxes
            .set_state(
                "t1",
                SandboxState::Exited {
                    reason: Some("PodExited".to_string()),
                },
            )
            .await;

        h.pass("t1").await;

        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.reason, Some(TerminalReason::RunnerExitedWithoutStatus));
        let sent = h.callbacks.events().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome, TaskOutcome::Failed);
        assert_eq!(sent[0].reason, "RunnerExitedWithoutStatus");
    }

    #[tokio::test]
    async fn test_task_timeout_while_running() {
        let mut policy = policy();
        policy.task_timeout = Duration::from_millis(100);
        policy.provisioning_window = Duration::from_millis(50);
        let h = harness_with(policy);
        h.running("t1").await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        h.pass("t1").await;

        let status = h.status("t1").await;
        assert_eq!(status.phase, Phase::TimedOut);
        assert_eq!(status.reason, Some(TerminalReason::TaskTimeout));
    }

    #[tokio::test]
    async fn test_cleanup_runs_once() {
        let h = harness();
        h.running("t1").await;
        h.reconciler.cancel("t1").await.unwrap();

        for _ in 0..3 {
            assert_eq!(h.pass("t1").await, ReconcileOutcome::Done);
        }

        assert_eq!(h.sandboxes.delete_calls().await, 1);
        assert_eq!(h.callbacks.events().await.len(), 1);
        let status = h.status("t1").await;
        let notified = status.condition(ConditionType::Notified).unwrap();
        assert!(notified.status);
        assert_eq!(notified.reason, REASON_CALLBACK_SENT);
    }

    #[tokio::test]
    async fn test_cleanup_resumes_after_partial_run() {
        let h = harness();
        h.running("t1").await;

        // Terminal with the claim already gone, as after a crash mid-cleanup.
        h.reconciler.cancel("t1").await.unwrap();
        h.sandboxes.vanish("t1").await;
        h.pass("t1").await;

        let status = h.status("t1").await;
        assert_eq!(
            status.condition(ConditionType::SandboxDeleted).unwrap().reason,
            "AlreadyGone"
        );
        assert!(status.has_condition(ConditionType::Notified));
    }

    #[tokio::test]
    async fn test_cancel_keeps_existing_outcome() {
        let h = harness();
        h.running("t1").await;
        h.sandboxes
            .set_state("t1", SandboxState::Exited { reason: None })
            .await;
        h.pass("t1").await;

        let phase = h.reconciler.cancel("t1").await.unwrap();
        assert_eq!(phase, Some(Phase::Failed));
        assert_eq!(h.reconciler.cancel("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_callback_is_recorded() {
        let h = harness();
        h.store.create("t1", spec()).await.unwrap();
        h.reconciler.cancel("t1").await.unwrap();
        h.pass("t1").await;

        let status = h.status("t1").await;
        let notified = status.condition(ConditionType::Notified).unwrap();
        assert!(!notified.status);
        assert_eq!(notified.reason, REASON_NO_CALLBACK);
        assert!(h.callbacks.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_callback_is_recorded_not_retried() {
        let h = harness();
        h.callbacks.fail_all().await;
        h.running("t1").await;
        h.reconciler.cancel("t1").await.unwrap();

        h.pass("t1").await;
        h.pass("t1").await;

        let status = h.status("t1").await;
        let notified = status.condition(ConditionType::Notified).unwrap();
        assert!(!notified.status);
        assert_eq!(notified.reason, REASON_CALLBACK_FAILED);
        assert_eq!(h.callbacks.attempts().await, 1);
        assert_eq!(status.phase, Phase::Canceled);
    }
}
