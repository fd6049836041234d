use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

const MAX_K8S_NAME_LENGTH: usize = 63;
const CLAIM_PREFIX: &str = "sbx-";

/// Longest task ID whose claim name still fits a DNS label
pub const MAX_TASK_ID_LENGTH: usize = MAX_K8S_NAME_LENGTH - CLAIM_PREFIX.len();

lazy_static! {
    /// RFC 1123 label
    static ref DNS_LABEL: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
}

pub struct ResourceNaming;

impl ResourceNaming {
    /// Claim name for a task. Deterministic, so a repeated provision for the
    /// same task lands on the same object instead of a second sandbox.
    #[must_use]
    pub fn claim_name(task_id: &str) -> String {
        format!("{CLAIM_PREFIX}{task_id}")
    }

    /// Generate an ID for a task created without one
    #[must_use]
    pub fn generate_task_id() -> String {
        format!("task-{}", Uuid::new_v4())
    }

    /// Task IDs double as object names, so they must be DNS labels short
    /// enough to carry the claim prefix.
    pub fn validate_task_id(task_id: &str) -> Result<(), String> {
        if task_id.is_empty() {
            return Err("task ID must not be empty".to_string());
        }
        if task_id.len() > MAX_TASK_ID_LENGTH {
            return Err(format!(
                "task ID '{task_id}' exceeds {MAX_TASK_ID_LENGTH} characters"
            ));
        }
        if !DNS_LABEL.is_match(task_id) {
            return Err(format!(
                "task ID '{task_id}' must consist of lowercase alphanumerics and '-', starting and ending with an alphanumeric"
            ));
        }
        Ok(())
    }
}
