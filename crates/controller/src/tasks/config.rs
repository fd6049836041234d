//! Controller Configuration
//!
//! Orchestration policy read from the mounted `config.yaml`. Every section
//! and field has a default, so an empty file is a valid configuration.
//! Secrets never live here; they come from the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tasks::sandbox::SandboxSettings;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ControllerConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    #[serde(default)]
    pub running: RunningConfig,

    #[serde(default)]
    pub assignment: AssignmentConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub sweep: SweepConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

/// What each sandbox claim asks for
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SandboxConfig {
    /// `SandboxTemplate` used when the task does not name one
    #[serde(default = "default_template")]
    pub template: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// How long a sandbox may take to become ready
    #[serde(rename = "windowSeconds", default = "default_provisioning_window")]
    pub window_seconds: u64,

    #[serde(rename = "pollIntervalSeconds", default = "default_provisioning_poll")]
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RunningConfig {
    #[serde(rename = "pollIntervalSeconds", default = "default_running_poll")]
    pub poll_interval_seconds: u64,

    /// Overall deadline from task creation, independent of sandbox health
    #[serde(rename = "taskTimeoutSeconds", default = "default_task_timeout")]
    pub task_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AssignmentConfig {
    #[serde(rename = "maxAttempts", default = "default_assignment_attempts")]
    pub max_attempts: u32,

    #[serde(rename = "initialBackoffSeconds", default = "default_assignment_backoff")]
    pub initial_backoff_seconds: u64,

    #[serde(rename = "maxBackoffSeconds", default = "default_assignment_max_backoff")]
    pub max_backoff_seconds: u64,

    #[serde(rename = "requestTimeoutSeconds", default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Port the worker listens on inside the sandbox
    #[serde(rename = "workerPort", default = "default_worker_port")]
    pub worker_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CredentialsConfig {
    #[serde(rename = "maxAttempts", default = "default_credential_attempts")]
    pub max_attempts: u32,

    #[serde(rename = "initialBackoffMillis", default = "default_credential_backoff")]
    pub initial_backoff_millis: u64,

    #[serde(rename = "apiBase", default = "default_github_api")]
    pub api_base: String,

    #[serde(rename = "requestTimeoutSeconds", default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct NotifyConfig {
    #[serde(rename = "maxAttempts", default = "default_notify_attempts")]
    pub max_attempts: u32,

    #[serde(rename = "initialBackoffSeconds", default = "default_notify_backoff")]
    pub initial_backoff_seconds: u64,

    #[serde(rename = "timeoutSeconds", default = "default_request_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SweepConfig {
    #[serde(rename = "intervalSeconds", default = "default_sweep_interval")]
    pub interval_seconds: u64,

    /// Minimum claim age before an orphan is deleted
    #[serde(rename = "orphanGraceSeconds", default = "default_orphan_grace")]
    pub orphan_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Terminal tasks older than this are deleted; `0` keeps them forever
    #[serde(rename = "terminalTaskTtlMinutes", default = "default_retention")]
    pub terminal_task_ttl_minutes: u64,
}

fn default_template() -> String {
    "agent-worker".to_string()
}

fn default_provisioning_window() -> u64 {
    300 // 5 minutes
}

fn default_provisioning_poll() -> u64 {
    5
}

fn default_running_poll() -> u64 {
    30
}

fn default_task_timeout() -> u64 {
    3600 // 1 hour
}

fn default_assignment_attempts() -> u32 {
    5
}

fn default_assignment_backoff() -> u64 {
    2
}

fn default_assignment_max_backoff() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    10
}

fn default_worker_port() -> u16 {
    8888
}

fn default_credential_attempts() -> u32 {
    3
}

fn default_credential_backoff() -> u64 {
    500
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_notify_attempts() -> u32 {
    3
}

fn default_notify_backoff() -> u64 {
    1
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_orphan_grace() -> u64 {
    600
}

fn default_retention() -> u64 {
    1440 // 24 hours
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            image: None,
            cpu: None,
            memory: None,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_provisioning_window(),
            poll_interval_seconds: default_provisioning_poll(),
        }
    }
}

impl Default for RunningConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_running_poll(),
            task_timeout_seconds: default_task_timeout(),
        }
    }
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_assignment_attempts(),
            initial_backoff_seconds: default_assignment_backoff(),
            max_backoff_seconds: default_assignment_max_backoff(),
            request_timeout_seconds: default_request_timeout(),
            worker_port: default_worker_port(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_credential_attempts(),
            initial_backoff_millis: default_credential_backoff(),
            api_base: default_github_api(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_notify_attempts(),
            initial_backoff_seconds: default_notify_backoff(),
            timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_sweep_interval(),
            orphan_grace_seconds: default_orphan_grace(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            terminal_task_ttl_minutes: default_retention(),
        }
    }
}

impl ControllerConfig {
    /// Validate that every interval and budget is usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let positive = [
            ("provisioning.windowSeconds", self.provisioning.window_seconds),
            (
                "provisioning.pollIntervalSeconds",
                self.provisioning.poll_interval_seconds,
            ),
            ("running.pollIntervalSeconds", self.running.poll_interval_seconds),
            ("running.taskTimeoutSeconds", self.running.task_timeout_seconds),
            (
                "assignment.maxAttempts",
                u64::from(self.assignment.max_attempts),
            ),
            (
                "assignment.initialBackoffSeconds",
                self.assignment.initial_backoff_seconds,
            ),
            (
                "assignment.requestTimeoutSeconds",
                self.assignment.request_timeout_seconds,
            ),
            (
                "assignment.workerPort",
                u64::from(self.assignment.worker_port),
            ),
            (
                "credentials.maxAttempts",
                u64::from(self.credentials.max_attempts),
            ),
            (
                "credentials.requestTimeoutSeconds",
                self.credentials.request_timeout_seconds,
            ),
            ("notify.maxAttempts", u64::from(self.notify.max_attempts)),
            ("notify.timeoutSeconds", self.notify.timeout_seconds),
            ("sweep.intervalSeconds", self.sweep.interval_seconds),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(anyhow::anyhow!("{field} must be greater than zero"));
            }
        }

        if self.assignment.max_backoff_seconds < self.assignment.initial_backoff_seconds {
            return Err(anyhow::anyhow!(
                "assignment.maxBackoffSeconds ({}) must not be smaller than assignment.initialBackoffSeconds ({})",
                self.assignment.max_backoff_seconds,
                self.assignment.initial_backoff_seconds
            ));
        }

        if self.running.task_timeout_seconds <= self.provisioning.window_seconds {
            return Err(anyhow::anyhow!(
                "running.taskTimeoutSeconds ({}) must exceed provisioning.windowSeconds ({})",
                self.running.task_timeout_seconds,
                self.provisioning.window_seconds
            ));
        }

        if self.sandbox.template.trim().is_empty() {
            return Err(anyhow::anyhow!("sandbox.template must not be empty"));
        }

        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }

    #[must_use]
    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            template: self.sandbox.template.clone(),
            image: self.sandbox.image.clone(),
            cpu: self.sandbox.cpu.clone(),
            memory: self.sandbox.memory.clone(),
        }
    }

    #[must_use]
    pub fn notify_policy(&self) -> notify::RetryPolicy {
        notify::RetryPolicy {
            max_attempts: self.notify.max_attempts,
            initial_backoff: Duration::from_secs(self.notify.initial_backoff_seconds),
            request_timeout: Duration::from_secs(self.notify.timeout_seconds),
        }
    }
}
