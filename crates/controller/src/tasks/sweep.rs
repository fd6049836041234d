//! Safety net for claims the reconciler cannot reach, plus retention of
//! finished tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::crds::ConditionType;
use crate::tasks::config::ControllerConfig;
use crate::tasks::sandbox::SandboxProvisioner;
use crate::tasks::store::{TaskRecord, TaskStore};
use crate::tasks::types::Result;

/// What a sweep removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub claims_deleted: usize,
    pub tasks_deleted: usize,
}

pub struct OrphanSweeper {
    store: Arc<dyn TaskStore>,
    provisioner: Arc<dyn SandboxProvisioner>,
    interval: Duration,
    orphan_grace: Duration,
    /// `None` keeps terminal tasks forever
    retention: Option<Duration>,
}

impl OrphanSweeper {
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        provisioner: Arc<dyn SandboxProvisioner>,
        interval: Duration,
        orphan_grace: Duration,
        retention: Option<Duration>,
    ) -> Self {
        Self {
            store,
            provisioner,
            interval,
            orphan_grace,
            retention,
        }
    }

    #[must_use]
    pub fn from_config(
        store: Arc<dyn TaskStore>,
        provisioner: Arc<dyn SandboxProvisioner>,
        config: &ControllerConfig,
    ) -> Self {
        let ttl = config.retention.terminal_task_ttl_minutes;
        Self::new(
            store,
            provisioner,
            Duration::from_secs(config.sweep.interval_seconds),
            Duration::from_secs(config.sweep.orphan_grace_seconds),
            (ttl > 0).then(|| Duration::from_secs(ttl.saturating_mul(60))),
        )
    }

    /// Sweep forever on the configured interval.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            grace_secs = self.orphan_grace.as_secs(),
            "Starting orphan sweeper"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) if report != SweepReport::default() => {
                    info!(
                        claims_deleted = report.claims_deleted,
                        tasks_deleted = report.tasks_deleted,
                        "Sweep finished"
                    );
                }
                Ok(_) => debug!("Sweep found nothing to do"),
                Err(e) => warn!(error = %e, "Sweep failed"),
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let tasks: HashMap<String, TaskRecord> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|t| (t.record.id.clone(), t.record))
            .collect();

        let mut report = SweepReport::default();

        for claim in self.provisioner.list_claims().await? {
            let Some(task_id) = claim.task_id.as_deref() else {
                continue;
            };
            let old_enough = claim.created_at.map_or(true, |created| {
                (Utc::now() - created).to_std().unwrap_or_default() >= self.orphan_grace
            });
            if !old_enough {
                continue;
            }

            let orphaned = match tasks.get(task_id) {
                None => true,
                Some(task) => {
                    task.status.phase.is_terminal()
                        && task.status.has_condition(ConditionType::SandboxDeleted)
                }
            };
            if !orphaned {
                continue;
            }

            match self.provisioner.delete(&claim.sandbox).await {
                Ok(_) => {
                    info!(task_id, claim = %claim.sandbox.claim_name, "Deleted orphaned sandbox claim");
                    report.claims_deleted += 1;
                }
                Err(e) => {
                    warn!(task_id, claim = %claim.sandbox.claim_name, error = %e, "Failed to delete orphaned claim");
                }
            }
        }

        if let Some(ttl) = self.retention {
            for task in tasks.values() {
                if !expired(task, ttl) {
                    continue;
                }
                if self.store.delete(&task.id).await? {
                    info!(task_id = %task.id, phase = %task.status.phase, "Deleted expired task");
                    report.tasks_deleted += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Terminal, fully cleaned up, and finished longer ago than `ttl`
fn expired(task: &TaskRecord, ttl: Duration) -> bool {
    let status = &task.status;
    if !status.phase.is_terminal()
        || !status.has_condition(ConditionType::SandboxDeleted)
        || !status.has_condition(ConditionType::Notified)
    {
        return false;
    }
    status
        .completed_at
        .is_some_and(|done| (Utc::now() - done).to_std().unwrap_or_default() >= ttl)
}
