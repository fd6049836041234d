/*
 * 5D Labs Agent Platform - Sandbox Task Orchestrator
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Sandbox task orchestration core
//!
//! Provisions an ephemeral sandbox per task, hands the task to the worker
//! inside it, issues the worker a single-use credential, folds the worker's
//! status reports and the sandbox's own exit signal into one terminal
//! outcome, reclaims the sandbox and reports the outcome to the caller.

pub mod api;
pub mod crds;
pub mod tasks;

// Re-export commonly used types
pub use crds::{AgentTask, AgentTaskSpec, AgentTaskStatus, Phase, SandboxClaim, TerminalReason};
pub use tasks::config::ControllerConfig;
pub use tasks::{ReconcileOutcome, ReconcilePolicy, Reconciler};
