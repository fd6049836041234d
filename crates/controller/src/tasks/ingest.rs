//! Status Ingest: folds worker-reported events into the task record.
//!
//! A terminal event is applied with a single compare-and-swap. Whoever
//! terminalizes the task first wins; every later terminal report, from the
//! worker or from the reconciler's exit detection, is acknowledged without
//! effect.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::crds::{Phase, TerminalReason};
use crate::tasks::store::{modify_status, Modified, StoreError, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Started,
    Progress,
    Completed,
    Failed,
}

impl EventKind {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One report from a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl StatusEvent {
    /// Pull request URL carried in `details`, under any of the spellings
    /// workers use
    #[must_use]
    pub fn pr_url(&self) -> Option<String> {
        let details = self.details.as_ref()?;
        ["prURL", "prUrl", "pr_url"]
            .iter()
            .find_map(|key| details.get(key).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnknownTask,
    /// Non-terminal event for a task that already finished
    AlreadyTerminal(Phase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// `changed` is false for a duplicate terminal report
    Accepted { phase: Phase, changed: bool },
    Rejected(Rejection),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Apply a status event to a task.
pub async fn apply(
    store: &dyn TaskStore,
    task_id: &str,
    event: &StatusEvent,
) -> Result<IngestOutcome, IngestError> {
    let pr_url = event.pr_url();

    let result = modify_status(store, task_id, |record| {
        let mut status = record.status.clone();
        if status.phase.is_terminal() {
            return None;
        }

        match event.event {
            EventKind::Started | EventKind::Progress => {
                if matches!(status.phase, Phase::Ready | Phase::Assigning) {
                    status.phase = Phase::Running;
                    status.assigned_at.get_or_insert_with(Utc::now);
                }
                if event.message.is_some() {
                    status.last_progress.clone_from(&event.message);
                }
            }
            EventKind::Completed | EventKind::Failed => {
                let reason = if event.event == EventKind::Completed {
                    TerminalReason::Completed
                } else {
                    TerminalReason::WorkerReportedFailure
                };
                status.terminate(reason, event.message.clone());
                if pr_url.is_some() {
                    status.pull_request_url.clone_from(&pr_url);
                }
            }
        }

        (status != record.status).then_some(status)
    })
    .await;

    let modified = match result {
        Ok(modified) => modified,
        Err(StoreError::NotFound(_)) => {
            debug!(task_id, event = ?event.event, "Status event for unknown task");
            return Ok(IngestOutcome::Rejected(Rejection::UnknownTask));
        }
        Err(e) => return Err(e.into()),
    };

    let changed = modified.applied();
    let phase = modified.into_task().record.status.phase;

    if changed {
        info!(task_id, event = ?event.event, %phase, "Applied status event");
        return Ok(IngestOutcome::Accepted { phase, changed });
    }

    if phase.is_terminal() && !event.event.is_terminal() {
        debug!(task_id, event = ?event.event, %phase, "Dropping late status event");
        return Ok(IngestOutcome::Rejected(Rejection::AlreadyTerminal(phase)));
    }

    if event.event.is_terminal() {
        debug!(task_id, event = ?event.event, %phase, "Duplicate terminal report");
    }
    Ok(IngestOutcome::Accepted { phase, changed })
}
