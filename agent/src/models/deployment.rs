//! Deployment request models

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DeployError;
use crate::utils::{is_env_name, shell_quote};

/// User that marks a hook as privileged
pub const ROOT_USER: &str = "root";

/// Identifier of a target host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A named stage of the deployment lifecycle.
///
/// The declaration order is the forward execution order; `Rollback` sits
/// outside of it and is only run by the coordinator on failed hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LifecyclePhase {
    BeforeInstall,
    ApplicationStop,
    AfterInstall,
    ApplicationStart,
    ValidateService,
    Rollback,
}

impl LifecyclePhase {
    /// Phases run on every host, in order
    pub const FORWARD: [LifecyclePhase; 5] = [
        LifecyclePhase::BeforeInstall,
        LifecyclePhase::ApplicationStop,
        LifecyclePhase::AfterInstall,
        LifecyclePhase::ApplicationStart,
        LifecyclePhase::ValidateService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::BeforeInstall => "BeforeInstall",
            LifecyclePhase::ApplicationStop => "ApplicationStop",
            LifecyclePhase::AfterInstall => "AfterInstall",
            LifecyclePhase::ApplicationStart => "ApplicationStart",
            LifecyclePhase::ValidateService => "ValidateService",
            LifecyclePhase::Rollback => "Rollback",
        }
    }

    pub fn is_forward(&self) -> bool {
        *self != LifecyclePhase::Rollback
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecyclePhase {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BeforeInstall" => Ok(LifecyclePhase::BeforeInstall),
            "ApplicationStop" => Ok(LifecyclePhase::ApplicationStop),
            "AfterInstall" => Ok(LifecyclePhase::AfterInstall),
            "ApplicationStart" => Ok(LifecyclePhase::ApplicationStart),
            "ValidateService" => Ok(LifecyclePhase::ValidateService),
            "Rollback" => Ok(LifecyclePhase::Rollback),
            _ => Err(DeployError::ValidationError(format!(
                "Unknown lifecycle phase: {}",
                s
            ))),
        }
    }
}

/// A single lifecycle hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    /// Phase the hook is bound to
    pub phase: LifecyclePhase,

    /// Executable followed by its arguments
    pub command: Vec<String>,

    /// Time budget, always > 0
    pub timeout_secs: u64,

    /// User the hook runs as; `None` keeps the engine's own user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as: Option<String>,
}

impl HookSpec {
    /// Create a validated hook
    pub fn new<I, S>(phase: LifecyclePhase, command: I, timeout_secs: u64) -> Result<Self, DeployError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let hook = Self {
            phase,
            command: command.into_iter().map(Into::into).collect(),
            timeout_secs,
            run_as: None,
        };
        hook.validate()?;
        Ok(hook)
    }

    /// Run as `root` when `privileged`, as the engine's user otherwise
    pub fn privileged(self, privileged: bool) -> Self {
        if privileged {
            self.run_as(ROOT_USER)
        } else {
            Self { run_as: None, ..self }
        }
    }

    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    pub fn is_privileged(&self) -> bool {
        self.run_as.as_deref() == Some(ROOT_USER)
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        if self.timeout_secs == 0 {
            return Err(DeployError::ValidationError(format!(
                "Hook {} in {} has a zero timeout",
                self.display_command(),
                self.phase
            )));
        }
        if let Some(user) = &self.run_as {
            if user.is_empty() || !user.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
                return Err(DeployError::ValidationError(format!(
                    "Hook {} in {} has an invalid run-as user: {:?}",
                    self.display_command(),
                    self.phase,
                    user
                )));
            }
        }
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(()),
            _ => Err(DeployError::ValidationError(format!(
                "Hook in {} has an empty command",
                self.phase
            ))),
        }
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Command rendered as a shell line, for logs, failure attribution and
    /// the descriptor's `location`
    pub fn display_command(&self) -> String {
        self.command
            .iter()
            .map(|part| shell_quote(part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Ordered hook lists keyed by phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookSet {
    hooks: BTreeMap<LifecyclePhase, Vec<HookSpec>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook to the end of its phase list
    pub fn push(&mut self, hook: HookSpec) {
        self.hooks.entry(hook.phase).or_default().push(hook);
    }

    pub fn with(mut self, hook: HookSpec) -> Self {
        self.push(hook);
        self
    }

    pub fn hooks_for(&self, phase: LifecyclePhase) -> &[HookSpec] {
        self.hooks.get(&phase).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has_rollback(&self) -> bool {
        !self.hooks_for(LifecyclePhase::Rollback).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LifecyclePhase, &[HookSpec])> {
        self.hooks.iter().map(|(phase, hooks)| (*phase, hooks.as_slice()))
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        for (phase, hooks) in &self.hooks {
            for hook in hooks {
                if hook.phase != *phase {
                    return Err(DeployError::ValidationError(format!(
                        "Hook {} declared for {} is listed under {}",
                        hook.display_command(),
                        hook.phase,
                        phase
                    )));
                }
                hook.validate()?;
            }
        }
        Ok(())
    }
}

/// Rollout policy across the target group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RolloutPolicy {
    AllAtOnce,
    OneAtATime,
    Canary { percentage: u8 },
}

impl RolloutPolicy {
    /// Whether a failed host stops the rollout to undeployed hosts
    pub fn halts_on_failure(&self) -> bool {
        !matches!(self, RolloutPolicy::AllAtOnce)
    }

    /// Split the target group into sequential batches
    pub fn batches(&self, hosts: &[HostId]) -> Vec<Vec<HostId>> {
        if hosts.is_empty() {
            return Vec::new();
        }
        match self {
            RolloutPolicy::AllAtOnce => vec![hosts.to_vec()],
            RolloutPolicy::OneAtATime => hosts.iter().map(|h| vec![h.clone()]).collect(),
            RolloutPolicy::Canary { percentage } => {
                let size = canary_size(hosts.len(), *percentage);
                let (canary, rest) = hosts.split_at(size);
                let mut batches = vec![canary.to_vec()];
                if !rest.is_empty() {
                    batches.push(rest.to_vec());
                }
                batches
            }
        }
    }
}

/// Floor-rounded canary subset, never empty for a non-empty group
pub fn canary_size(hosts: usize, percentage: u8) -> usize {
    let floor = hosts * usize::from(percentage.min(100)) / 100;
    floor.clamp(1, hosts.max(1))
}

impl fmt::Display for RolloutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutPolicy::AllAtOnce => f.write_str("all-at-once"),
            RolloutPolicy::OneAtATime => f.write_str("one-at-a-time"),
            RolloutPolicy::Canary { percentage } => write!(f, "canary:{}", percentage),
        }
    }
}

impl FromStr for RolloutPolicy {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all-at-once" => Ok(RolloutPolicy::AllAtOnce),
            "one-at-a-time" => Ok(RolloutPolicy::OneAtATime),
            other => {
                let pct = other
                    .strip_prefix("canary:")
                    .and_then(|p| p.trim_end_matches('%').parse::<u8>().ok())
                    .ok_or_else(|| {
                        DeployError::ValidationError(format!("Invalid rollout policy: {}", s))
                    })?;
                Ok(RolloutPolicy::Canary { percentage: pct })
            }
        }
    }
}

/// Deployment policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub policy: RolloutPolicy,

    /// Roll back already succeeded hosts when the deployment does not succeed
    #[serde(default)]
    pub rollback_on_failure: bool,
}

impl DeploymentConfig {
    pub fn new(policy: RolloutPolicy) -> Self {
        Self {
            policy,
            rollback_on_failure: false,
        }
    }

    pub fn with_rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self::new(RolloutPolicy::AllAtOnce)
    }
}

/// Selection criteria for the running workload a stop hook acts on,
/// expressed as a container runtime filter (e.g. `label=app=web`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadSelector(String);

impl WorkloadSelector {
    pub fn new(filter: impl Into<String>) -> Self {
        Self(filter.into())
    }

    pub fn filter(&self) -> &str {
        &self.0
    }
}

/// An immutable request to converge a host group onto one artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    id: Uuid,
    artifact_reference: String,
    target_group: Vec<HostId>,
    hooks: HookSet,
    config: DeploymentConfig,
    /// Logical secret name -> secret store path
    #[serde(default)]
    secrets: BTreeMap<String, String>,
    #[serde(default)]
    workload_selector: Option<WorkloadSelector>,
}

impl DeploymentRequest {
    /// Create and validate a request
    pub fn new(
        artifact_reference: impl Into<String>,
        target_group: impl IntoIterator<Item = HostId>,
        hooks: HookSet,
        config: DeploymentConfig,
    ) -> Result<Self, DeployError> {
        let request = Self {
            id: Uuid::new_v4(),
            artifact_reference: artifact_reference.into(),
            target_group: target_group.into_iter().collect(),
            hooks,
            config,
            secrets: BTreeMap::new(),
            workload_selector: None,
        };
        request.validate()?;
        Ok(request)
    }

    /// Attach the logical name -> store path mapping; names become hook
    /// environment variables and must be valid shell names
    pub fn with_secrets(mut self, secrets: BTreeMap<String, String>) -> Result<Self, DeployError> {
        self.secrets = secrets;
        self.validate()?;
        Ok(self)
    }

    pub fn with_workload_selector(mut self, selector: WorkloadSelector) -> Self {
        self.workload_selector = Some(selector);
        self
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        if self.artifact_reference.trim().is_empty() {
            return Err(DeployError::ValidationError(
                "Artifact reference is empty".to_string(),
            ));
        }
        if self.target_group.is_empty() {
            return Err(DeployError::ValidationError(
                "Target group is empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for host in &self.target_group {
            if !seen.insert(host) {
                return Err(DeployError::ValidationError(format!(
                    "Duplicate host in target group: {}",
                    host
                )));
            }
        }
        if let RolloutPolicy::Canary { percentage } = self.config.policy {
            if percentage == 0 || percentage > 100 {
                return Err(DeployError::ValidationError(format!(
                    "Canary percentage must be within 1..=100, got {}",
                    percentage
                )));
            }
        }
        for (name, path) in &self.secrets {
            if !is_env_name(name) {
                return Err(DeployError::ValidationError(format!(
                    "Secret name {:?} is not a valid environment variable name",
                    name
                )));
            }
            if path.trim().is_empty() {
                return Err(DeployError::ValidationError(format!(
                    "Secret {} has an empty store path",
                    name
                )));
            }
        }
        self.hooks.validate()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn artifact_reference(&self) -> &str {
        &self.artifact_reference
    }

    pub fn target_group(&self) -> &[HostId] {
        &self.target_group
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn secrets(&self) -> &BTreeMap<String, String> {
        &self.secrets
    }

    pub fn workload_selector(&self) -> Option<&WorkloadSelector> {
        self.workload_selector.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<HostId> {
        names.iter().map(|n| HostId::from(*n)).collect()
    }

    #[test]
    fn test_hook_rejects_zero_timeout() {
        let result = HookSpec::new(LifecyclePhase::AfterInstall, ["true"], 0);
        assert!(matches!(result, Err(DeployError::ValidationError(_))));
    }

    #[test]
    fn test_hook_rejects_empty_command() {
        let result = HookSpec::new(LifecyclePhase::AfterInstall, Vec::<String>::new(), 5);
        assert!(result.is_err());
    }

    #[test]
    fn test_hookset_keeps_declared_order() {
        let set = HookSet::new()
            .with(HookSpec::new(LifecyclePhase::AfterInstall, ["first"], 5).unwrap())
            .with(HookSpec::new(LifecyclePhase::AfterInstall, ["second"], 5).unwrap());

        let names: Vec<_> = set
            .hooks_for(LifecyclePhase::AfterInstall)
            .iter()
            .map(|h| h.program().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(set.hooks_for(LifecyclePhase::BeforeInstall).is_empty());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("all-at-once".parse::<RolloutPolicy>().unwrap(), RolloutPolicy::AllAtOnce);
        assert_eq!("one-at-a-time".parse::<RolloutPolicy>().unwrap(), RolloutPolicy::OneAtATime);
        assert_eq!(
            "canary:25".parse::<RolloutPolicy>().unwrap(),
            RolloutPolicy::Canary { percentage: 25 }
        );
        assert!("sideways".parse::<RolloutPolicy>().is_err());
    }

    #[test]
    fn test_canary_batches_floor() {
        let group = hosts(&["a", "b", "c", "d", "e", "f", "g"]);
        let batches = RolloutPolicy::Canary { percentage: 30 }.batches(&group);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], hosts(&["a", "b"]));
        assert_eq!(batches[1].len(), 5);
    }

    #[test]
    fn test_canary_size_never_empty() {
        assert_eq!(canary_size(3, 10), 1);
        assert_eq!(canary_size(10, 100), 10);
        assert_eq!(canary_size(4, 50), 2);
    }

    #[test]
    fn test_one_at_a_time_batches() {
        let group = hosts(&["a", "b", "c"]);
        let batches = RolloutPolicy::OneAtATime.batches(&group);
        assert_eq!(batches, vec![hosts(&["a"]), hosts(&["b"]), hosts(&["c"])]);
    }

    #[test]
    fn test_request_rejects_duplicate_hosts() {
        let result = DeploymentRequest::new(
            "registry/app:1",
            hosts(&["a", "a"]),
            HookSet::new(),
            DeploymentConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_request_rejects_bad_canary() {
        let result = DeploymentRequest::new(
            "registry/app:1",
            hosts(&["a"]),
            HookSet::new(),
            DeploymentConfig::new(RolloutPolicy::Canary { percentage: 0 }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_request_rejects_unexportable_secret_names() {
        let request = || {
            DeploymentRequest::new("registry/app:1", hosts(&["a"]), HookSet::new(), DeploymentConfig::default())
                .unwrap()
        };
        let secrets = |name: &str| BTreeMap::from([(name.to_string(), "/app/secret".to_string())]);

        assert!(request().with_secrets(secrets("DB_PASSWORD")).is_ok());
        for name in ["db-password", "X=1; touch /tmp/owned; Y", "9LIVES", ""] {
            assert!(
                matches!(request().with_secrets(secrets(name)), Err(DeployError::ValidationError(_))),
                "{:?} accepted",
                name
            );
        }
    }

    #[test]
    fn test_hook_run_as() {
        let hook = HookSpec::new(LifecyclePhase::ApplicationStart, ["start.sh"], 5).unwrap();
        assert_eq!(hook.run_as, None);
        assert!(hook.clone().privileged(true).is_privileged());
        assert!(!hook.clone().privileged(true).privileged(false).is_privileged());

        let as_app = hook.clone().run_as("ubuntu");
        assert_eq!(as_app.run_as.as_deref(), Some("ubuntu"));
        assert!(!as_app.is_privileged());
        assert!(hook.run_as("root; reboot").validate().is_err());
    }

    #[test]
    fn test_display_command_quotes_arguments() {
        let hook = HookSpec::new(LifecyclePhase::AfterInstall, ["/opt/app/run.sh", "--msg", "hello world"], 5).unwrap();
        assert_eq!(hook.display_command(), "/opt/app/run.sh --msg 'hello world'");
    }
}
