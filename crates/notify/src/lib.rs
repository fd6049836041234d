//! Terminal-outcome notifications for sandbox tasks.
//!
//! When a task reaches a terminal phase the controller tells the task's
//! originator what happened by posting a signed payload to the callback URL
//! supplied at task creation.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{Delivery, Notifier, OutcomeEvent, RetryPolicy, TaskOutcome};
//!
//! # async fn run() {
//! let notifier = Notifier::from_env(RetryPolicy::default());
//!
//! let delivery = notifier
//!     .deliver(&OutcomeEvent {
//!         task_id: "t-42".to_string(),
//!         callback_url: "https://origin.example.com/hooks/tasks".to_string(),
//!         outcome: TaskOutcome::Completed,
//!         reason: "Completed".to_string(),
//!         pr_url: Some("https://github.com/acme/app/pull/7".to_string()),
//!         message: None,
//!         completed_at: chrono::Utc::now(),
//!     })
//!     .await;
//! assert!(matches!(delivery, Delivery::Sent | Delivery::Failed(_)));
//! # }
//! ```
//!
//! # Configuration
//!
//! - `CALLBACK_SIGNING_SECRET`: shared secret used for the
//!   `X-Signature-256` header (enables the callback channel)
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications
//!
//! # Architecture
//!
//! - [`NotifyChannel`] trait defines the interface for notification channels
//! - [`CallbackChannel`] implements signed HTTP callbacks with bounded retry
//! - [`Notifier`] dispatches events to all enabled channels and reports a
//!   single [`Delivery`] result

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;
pub mod signature;

pub use channels::callback::{CallbackChannel, RetryPolicy};
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{CallbackPayload, OutcomeEvent, TaskOutcome};

use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Result of delivering one outcome event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Every enabled channel accepted the event
    Sent,
    /// At least one channel failed; the message describes the first failure
    Failed(String),
}

/// Central notification dispatcher.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Create a new notifier from environment variables.
    #[must_use]
    pub fn from_env(policy: RetryPolicy) -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = vec![];

        let callback = CallbackChannel::from_env(policy);
        if callback.enabled() {
            info!("Callback notifications enabled");
            channels.push(Arc::new(callback));
        }

        if channels.is_empty() {
            warn!("No notification channels configured");
        }

        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Deliver an event to every enabled channel and wait for the result.
    ///
    /// A notifier with no channels reports `Failed`: the originator asked
    /// for a callback and did not get one.
    pub async fn deliver(&self, event: &OutcomeEvent) -> Delivery {
        if !self.has_channels() {
            debug!(task_id = %event.task_id, "No notification channels, skipping event");
            return Delivery::Failed("no notification channel configured".to_string());
        }

        let mut first_failure = None;

        for channel in &self.channels {
            let channel_name = channel.name();

            if !channel.enabled() {
                debug!(channel = channel_name, "Channel disabled, skipping");
                continue;
            }

            match channel.send(event).await {
                Ok(()) => {
                    info!(
                        channel = channel_name,
                        task_id = %event.task_id,
                        outcome = %event.outcome,
                        "Notification sent"
                    );
                }
                Err(e) => {
                    error!(
                        channel = channel_name,
                        task_id = %event.task_id,
                        error = %e,
                        "Failed to send notification"
                    );
                    first_failure.get_or_insert_with(|| format!("{channel_name}: {e}"));
                }
            }
        }

        match first_failure {
            None => Delivery::Sent,
            Some(message) => Delivery::Failed(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel {
        sent: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl NotifyChannel for CountingChannel {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, _event: &OutcomeEvent) -> Result<(), ChannelError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ChannelError::Rejected { status: 410 })
            } else {
                Ok(())
            }
        }
    }

    fn event() -> OutcomeEvent {
        OutcomeEvent {
            task_id: "t1".to_string(),
            callback_url: "http://example.invalid".to_string(),
            outcome: TaskOutcome::Failed,
            reason: "AssignmentFailure".to_string(),
            pr_url: None,
            message: Some("worker unreachable".to_string()),
            completed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_disabled_notifier() {
        let notifier = Notifier::disabled();
        assert!(!notifier.has_channels());
    }

    #[tokio::test]
    async fn test_disabled_notifier_reports_failure() {
        let delivery = Notifier::disabled().deliver(&event()).await;
        assert!(matches!(delivery, Delivery::Failed(_)));
    }

    #[tokio::test]
    async fn test_deliver_reports_sent() {
        let channel = Arc::new(CountingChannel {
            sent: AtomicUsize::new(0),
            fail: false,
        });
        let notifier = Notifier::with_channels(vec![channel.clone()]);

        assert_eq!(notifier.deliver(&event()).await, Delivery::Sent);
        assert_eq!(channel.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deliver_reports_channel_failure() {
        let notifier = Notifier::with_channels(vec![Arc::new(CountingChannel {
            sent: AtomicUsize::new(0),
            fail: true,
        })]);

        match notifier.deliver(&event()).await {
            Delivery::Failed(message) => assert!(message.starts_with("counting:")),
            Delivery::Sent => panic!("expected failure"),
        }
    }
}
