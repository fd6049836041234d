//! Signed HTTP callback channel.
//!
//! Delivers the terminal outcome of a task to the URL supplied by its
//! originator. The body is signed with a shared secret (see
//! [`crate::signature`]) and delivery is retried a bounded number of times.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::OutcomeEvent;
use crate::signature::{self, SIGNATURE_HEADER, TASK_ID_HEADER};
use crate::NotifyChannel;

/// Environment variable holding the shared signing secret.
const ENV_CALLBACK_SIGNING_SECRET: &str = "CALLBACK_SIGNING_SECRET";

/// Bounded retry policy for callback delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exponent)
    }
}

/// Callback channel posting signed outcome payloads.
pub struct CallbackChannel {
    secret: Option<Vec<u8>>,
    policy: RetryPolicy,
    client: reqwest::Client,
}

impl CallbackChannel {
    /// Create a callback channel from environment variables.
    #[must_use]
    pub fn from_env(policy: RetryPolicy) -> Self {
        let secret = std::env::var(ENV_CALLBACK_SIGNING_SECRET)
            .ok()
            .filter(|s| !s.is_empty());

        if secret.is_some() {
            debug!("Callback notifications enabled");
        } else {
            warn!("Callback notifications disabled (CALLBACK_SIGNING_SECRET not set)");
        }

        Self {
            secret: secret.map(String::into_bytes),
            policy,
            client: reqwest::Client::new(),
        }
    }

    /// Create a callback channel with a specific secret.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>, policy: RetryPolicy) -> Self {
        Self {
            secret: Some(secret.into()),
            policy,
            client: reqwest::Client::new(),
        }
    }

    async fn post_once(
        &self,
        event: &OutcomeEvent,
        body: &[u8],
        signature: &str,
    ) -> Result<(), AttemptError> {
        let response = self
            .client
            .post(&event.callback_url)
            .timeout(self.policy.request_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(TASK_ID_HEADER, &event.task_id)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if is_permanent(status) {
            Err(AttemptError::Permanent(status.as_u16()))
        } else {
            Err(AttemptError::Retryable(format!("HTTP {status}")))
        }
    }
}

enum AttemptError {
    Retryable(String),
    Permanent(u16),
}

/// Client errors other than timeout/rate limiting will not improve on retry.
fn is_permanent(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl NotifyChannel for CallbackChannel {
    fn name(&self) -> &'static str {
        "callback"
    }

    fn enabled(&self) -> bool {
        self.secret.is_some()
    }

    async fn send(&self, event: &OutcomeEvent) -> Result<(), ChannelError> {
        let Some(secret) = &self.secret else {
            return Err(ChannelError::NotConfigured(
                "CALLBACK_SIGNING_SECRET not set".to_string(),
            ));
        };

        let body = serde_json::to_vec(&event.payload())?;
        let signature = signature::sign(secret, &body)?;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.post_once(event, &body, &signature).await {
                Ok(()) => {
                    debug!(
                        task_id = %event.task_id,
                        attempt,
                        "Callback delivered"
                    );
                    return Ok(());
                }
                Err(AttemptError::Permanent(status)) => {
                    warn!(
                        task_id = %event.task_id,
                        status,
                        "Callback rejected by receiver, not retrying"
                    );
                    return Err(ChannelError::Rejected { status });
                }
                Err(AttemptError::Retryable(reason)) => {
                    warn!(
                        task_id = %event.task_id,
                        attempt,
                        max_attempts,
                        error = %reason,
                        "Callback attempt failed"
                    );
                    last_error = reason;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        Err(ChannelError::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TaskOutcome;
    use chrono::Utc;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            request_timeout: Duration::from_secs(2),
        }
    }

    fn event(url: String) -> OutcomeEvent {
        OutcomeEvent {
            task_id: "t1".to_string(),
            callback_url: url,
            outcome: TaskOutcome::Completed,
            reason: "Completed".to_string(),
            pr_url: Some("https://github.com/acme/app/pull/1".to_string()),
            message: None,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_delivers_signed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cb"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = CallbackChannel::new("secret", fast_policy(3));
        channel
            .send(&event(format!("{}/cb", server.uri())))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let header = request
            .headers
            .get(SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(signature::verify(b"secret", &request.body, header));

        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["prURL"], "https://github.com/acme/app/pull/1");
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let channel = CallbackChannel::new("secret", fast_policy(3));
        let err = channel
            .send(&event(format!("{}/cb", server.uri())))
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let channel = CallbackChannel::new("secret", fast_policy(3));
        let err = channel
            .send(&event(format!("{}/cb", server.uri())))
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::Rejected { status: 400 }));
    }
}
