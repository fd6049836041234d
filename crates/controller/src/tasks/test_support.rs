//! Fixtures shared by unit tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use notify::{ChannelError, NotifyChannel, OutcomeEvent};
use tokio::sync::Mutex;

use crate::crds::{AgentTaskSpec, RepositoryRef};
use crate::tasks::assign::{AssignError, Assignment, AssignmentClient};

pub(crate) fn spec() -> AgentTaskSpec {
    AgentTaskSpec {
        description: "fix the flaky test".to_string(),
        context: Some("see CI run 1234".to_string()),
        source_reference: Some("https://linear.app/acme/issue/ENG-1".to_string()),
        repository: RepositoryRef {
            url: "https://github.com/acme/app".to_string(),
            git_ref: "main".to_string(),
        },
        callback_url: None,
        sandbox_template: None,
    }
}

/// Assignment client answering from a script; accepts once the script runs out
#[derive(Default)]
pub(crate) struct ScriptedAssigner {
    replies: Mutex<VecDeque<Result<Assignment, AssignError>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedAssigner {
    pub(crate) async fn reply(&self, reply: Result<Assignment, AssignError>) {
        self.replies.lock().await.push_back(reply);
    }

    /// `(address, task_id)` of every assignment
    pub(crate) async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl AssignmentClient for ScriptedAssigner {
    async fn assign(
        &self,
        address: &str,
        task_id: &str,
        _callback_api_address: &str,
    ) -> Result<Assignment, AssignError> {
        self.calls
            .lock()
            .await
            .push((address.to_string(), task_id.to_string()));
        self.replies
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(Assignment::Accepted))
    }
}

/// Notification channel that keeps what it was sent
#[derive(Default)]
pub(crate) struct RecordingChannel {
    events: Mutex<Vec<OutcomeEvent>>,
    attempts: Mutex<u32>,
    failing: Mutex<bool>,
}

impl RecordingChannel {
    pub(crate) async fn fail_all(&self) {
        *self.failing.lock().await = true;
    }

    /// Events delivered successfully
    pub(crate) async fn events(&self) -> Vec<OutcomeEvent> {
        self.events.lock().await.clone()
    }

    pub(crate) async fn attempts(&self) -> u32 {
        *self.attempts.lock().await
    }
}

#[async_trait]
impl NotifyChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &OutcomeEvent) -> Result<(), ChannelError> {
        *self.attempts.lock().await += 1;
        if *self.failing.lock().await {
            return Err(ChannelError::Rejected { status: 500 });
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
