//! Assignment Client: hands a task to the worker listening in its sandbox.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AssignError {
    /// Nothing is listening yet. Expected right after the sandbox's address
    /// appears; the reconciler decides whether it counts as an attempt.
    #[error("Connection refused by worker at {0}")]
    ConnectionRefused(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Worker answered {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// `200` or `202`
    Accepted,
    /// `409`: the worker already has this task
    AlreadyAssigned,
}

#[derive(Debug, Serialize)]
struct AssignmentRequest<'a> {
    #[serde(rename = "taskID")]
    task_id: &'a str,
    #[serde(rename = "callbackAPIAddress")]
    callback_api_address: &'a str,
}

#[async_trait]
pub trait AssignmentClient: Send + Sync {
    async fn assign(
        &self,
        address: &str,
        task_id: &str,
        callback_api_address: &str,
    ) -> Result<Assignment, AssignError>;
}

/// Posts assignments to `http://{address}:{port}/task`
pub struct HttpAssignmentClient {
    client: reqwest::Client,
    port: u16,
}

impl HttpAssignmentClient {
    pub fn new(port: u16, request_timeout: Duration) -> Result<Self, AssignError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client, port })
    }
}

#[async_trait]
impl AssignmentClient for HttpAssignmentClient {
    async fn assign(
        &self,
        address: &str,
        task_id: &str,
        callback_api_address: &str,
    ) -> Result<Assignment, AssignError> {
        let url = format!("http://{address}:{}/task", self.port);
        debug!(task_id, %url, "Delivering assignment");

        let response = self
            .client
            .post(&url)
            .json(&AssignmentRequest {
                task_id,
                callback_api_address,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    AssignError::ConnectionRefused(address.to_string())
                } else {
                    AssignError::Transport(e)
                }
            })?;

        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(Assignment::Accepted),
            StatusCode::CONFLICT => Ok(Assignment::AlreadyAssigned),
            status => Err(AssignError::UnexpectedStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}
