//! Deployment outcome models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::deployment::{HostId, LifecyclePhase};

/// Why a host stopped short of `Succeeded`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Non-zero exit, or killed by a signal (`exit_code` is then absent)
    HookFailed { exit_code: Option<i32> },
    HookTimedOut { timeout_secs: u64 },
    HookUnstartable { message: String },
    SecretUnavailable { name: String, message: String },
    /// More than one running workload matched the selector; needs an operator
    AmbiguousTargetState { matches: Vec<String> },
    WorkloadProbeFailed { message: String },
    RegistryAuth { message: String },
    RegistryUnreachable { message: String },
    ArtifactNotFound { reference: String },
    Cancelled,
    Internal { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::HookFailed { exit_code: Some(code) } => {
                write!(f, "hook exited with code {}", code)
            }
            FailureReason::HookFailed { exit_code: None } => {
                write!(f, "hook terminated by signal")
            }
            FailureReason::HookTimedOut { timeout_secs } => {
                write!(f, "hook timed out after {}s", timeout_secs)
            }
            FailureReason::HookUnstartable { message } => {
                write!(f, "hook could not be started: {}", message)
            }
            FailureReason::SecretUnavailable { name, message } => {
                write!(f, "secret {} unavailable: {}", name, message)
            }
            FailureReason::AmbiguousTargetState { matches } => {
                write!(
                    f,
                    "{} running workloads match the selector: {}",
                    matches.len(),
                    matches.join(", ")
                )
            }
            FailureReason::WorkloadProbeFailed { message } => {
                write!(f, "workload probe failed: {}", message)
            }
            FailureReason::RegistryAuth { message } => {
                write!(f, "registry authentication failed: {}", message)
            }
            FailureReason::RegistryUnreachable { message } => {
                write!(f, "registry unreachable: {}", message)
            }
            FailureReason::ArtifactNotFound { reference } => {
                write!(f, "artifact not found: {}", reference)
            }
            FailureReason::Cancelled => write!(f, "deployment cancelled"),
            FailureReason::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

/// A failed host with phase and hook attribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFailure {
    pub host: HostId,
    pub phase: LifecyclePhase,

    /// The hook that failed, absent when nothing ran (e.g. ambiguous target)
    pub hook: Option<String>,

    pub reason: FailureReason,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hook {
            Some(hook) => write!(f, "{} failed at {} ({}): {}", self.host, self.phase, hook, self.reason),
            None => write!(f, "{} failed at {}: {}", self.host, self.phase, self.reason),
        }
    }
}

/// Outcome of running the `Rollback` phase on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub host: HostId,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<HostFailure>,
}

/// Overall deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
    RolledBack,
}

impl OverallStatus {
    /// Collapse host counts. `unsuccessful` counts failed and never-started hosts.
    pub fn aggregate(succeeded: usize, unsuccessful: usize) -> Self {
        match (succeeded, unsuccessful) {
            (s, 0) if s > 0 => OverallStatus::Succeeded,
            (s, _) if s > 0 => OverallStatus::PartiallyFailed,
            _ => OverallStatus::Failed,
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallStatus::Succeeded => "Succeeded",
            OverallStatus::PartiallyFailed => "PartiallyFailed",
            OverallStatus::Failed => "Failed",
            OverallStatus::RolledBack => "RolledBack",
        };
        f.write_str(s)
    }
}

/// Final result of one deployment request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub deployment_id: Uuid,
    pub artifact_reference: String,
    pub succeeded_hosts: Vec<HostId>,
    pub failed_hosts: Vec<HostFailure>,

    /// Hosts never started because the rollout halted or was cancelled
    pub skipped_hosts: Vec<HostId>,

    pub rollbacks: Vec<RollbackOutcome>,
    pub overall_status: OverallStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DeploymentResult {
    pub fn failure_for(&self, host: &HostId) -> Option<&HostFailure> {
        self.failed_hosts.iter().find(|f| &f.host == host)
    }

    pub fn is_success(&self) -> bool {
        self.overall_status == OverallStatus::Succeeded
    }
}
