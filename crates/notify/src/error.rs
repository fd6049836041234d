//! Error types for the notification system.

use thiserror::Error;

/// Errors that can occur when sending notifications.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Receiver answered with a status that will not change on retry
    #[error("Callback rejected with HTTP {status}")]
    Rejected { status: u16 },

    /// Every delivery attempt failed
    #[error("Delivery failed after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}
