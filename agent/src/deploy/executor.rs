//! Per-host lifecycle executor
//!
//! Drives one host through the forward phases, one hook at a time, and
//! records every move in the host's state machine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fsm::{HostDeploymentState, LifecycleEvent};
use super::registry::ArtifactRegistry;
use super::runner::{HookEnv, HookRunner, HookStatus};
use super::workload::{HostRuntime, WorkloadInspector, TARGET_WORKLOAD_VAR};
use crate::errors::DeployError;
use crate::models::deployment::{DeploymentRequest, HookSpec, HostId, LifecyclePhase};
use crate::models::result::{FailureReason, HostFailure, RollbackOutcome};
use crate::secrets::{AuthContext, ResolvedSecrets, SecretResolver};

/// Hook name used when the artifact pull before `ApplicationStart` fails
pub const ARTIFACT_PULL_HOOK: &str = "artifact-pull";

/// Shared collaborators of the engine
#[derive(Clone)]
pub struct EngineContext {
    pub runner: Arc<dyn HookRunner>,
    pub resolver: Arc<SecretResolver>,
    pub inspector: Option<Arc<dyn WorkloadInspector>>,
    pub registry: Option<Arc<dyn ArtifactRegistry>>,
    pub auth: AuthContext,
}

impl EngineContext {
    pub fn new(runner: Arc<dyn HookRunner>, resolver: Arc<SecretResolver>) -> Self {
        Self {
            runner,
            resolver,
            inspector: None,
            registry: None,
            auth: AuthContext::anonymous(),
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn WorkloadInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ArtifactRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_auth(mut self, auth: AuthContext) -> Self {
        self.auth = auth;
        self
    }
}

/// How a host's forward run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostOutcome {
    Succeeded,
    Failed(HostFailure),

    /// Cancelled before the first phase
    NotStarted,
}

/// Report sent from a host task to the aggregator
#[derive(Debug, Clone)]
pub struct HostReport {
    pub host: HostId,
    pub outcome: HostOutcome,
    pub state: HostDeploymentState,
}

/// Runs the lifecycle on a single host
pub struct HostExecutor {
    ctx: EngineContext,
    request: Arc<DeploymentRequest>,
    cancel: CancellationToken,
    state: HostDeploymentState,
    runtime: HostRuntime,
    progress: Option<watch::Sender<HostDeploymentState>>,
}

impl HostExecutor {
    pub fn new(
        ctx: EngineContext,
        request: Arc<DeploymentRequest>,
        host: HostId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            request,
            cancel,
            state: HostDeploymentState::new(host),
            runtime: HostRuntime::new(),
            progress: None,
        }
    }

    /// Publish a copy of the host state after every transition, so the
    /// caller still knows where the host was if the task dies
    pub fn with_progress(mut self, progress: watch::Sender<HostDeploymentState>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn publish(&self) {
        if let Some(progress) = &self.progress {
            progress.send_replace(self.state.clone());
        }
    }

    pub fn host(&self) -> &HostId {
        self.state.host_id()
    }

    /// Run every forward phase, stopping at the first failure
    pub async fn execute(mut self) -> HostReport {
        if self.cancel.is_cancelled() {
            debug!(host = %self.host(), "Deployment cancelled before host started");
            return self.report(HostOutcome::NotStarted);
        }

        info!(host = %self.host(), artifact = self.request.artifact_reference(), "Deploying host");
        for phase in LifecyclePhase::FORWARD {
            if let Err(failure) = self.run_phase(phase).await {
                warn!(host = %self.host(), "{}", failure);
                return self.report(HostOutcome::Failed(failure));
            }
        }

        if let Err(e) = self.state.process(LifecycleEvent::Complete) {
            error!(host = %self.host(), "Failed to complete host: {}", e);
            let failure = self.fail(
                LifecyclePhase::ValidateService,
                None,
                FailureReason::Internal {
                    message: e.to_string(),
                },
            );
            return self.report(HostOutcome::Failed(failure));
        }

        info!(host = %self.host(), "Host deployed successfully");
        self.report(HostOutcome::Succeeded)
    }

    async fn run_phase(&mut self, phase: LifecyclePhase) -> Result<(), HostFailure> {
        self.transition(phase, LifecycleEvent::Enter(phase))?;
        if self.cancel.is_cancelled() {
            return Err(self.fail(phase, None, FailureReason::Cancelled));
        }
        debug!(host = %self.host(), phase = %phase, "Entered phase");

        let mut extra = Vec::new();
        match phase {
            LifecyclePhase::ApplicationStop => {
                if let Some(target) = self.select_stop_target().await? {
                    extra.push((TARGET_WORKLOAD_VAR, target));
                }
            }
            LifecyclePhase::ApplicationStart => self.pull_artifact().await?,
            _ => {}
        }

        let request = self.request.clone();
        for hook in request.hooks().hooks_for(phase) {
            if self.cancel.is_cancelled() {
                return Err(self.fail(
                    phase,
                    Some(hook.display_command()),
                    FailureReason::Cancelled,
                ));
            }
            if let Err(reason) = self.run_hook(hook, &extra).await {
                return Err(self.fail(phase, Some(hook.display_command()), reason));
            }
        }

        self.transition(phase, LifecycleEvent::PhaseSucceeded)
    }

    /// Probe running workloads when the request names a selector
    async fn select_stop_target(&mut self) -> Result<Option<String>, HostFailure> {
        let phase = LifecyclePhase::ApplicationStop;
        let Some(selector) = self.request.workload_selector().cloned() else {
            return Ok(None);
        };
        let Some(inspector) = self.ctx.inspector.clone() else {
            warn!(host = %self.host(), "Workload selector set but no inspector configured, skipping probe");
            return Ok(None);
        };

        match inspector.running(self.host(), &selector, &self.ctx.auth).await {
            Ok(workloads) => self.runtime.record(workloads),
            Err(e) => {
                let reason = failure_reason(e);
                return Err(self.fail(phase, None, reason));
            }
        }

        let target = self.runtime.stop_target().map(|t| t.map(str::to_string));
        match target {
            Ok(target) => {
                if target.is_none() {
                    info!(host = %self.host(), selector = selector.filter(), "No running workload matches, nothing to stop");
                }
                Ok(target)
            }
            Err(_) => {
                let matches = self.runtime.observed().unwrap_or_default().to_vec();
                Err(self.fail(phase, None, FailureReason::AmbiguousTargetState { matches }))
            }
        }
    }

    async fn pull_artifact(&mut self) -> Result<(), HostFailure> {
        let Some(registry) = self.ctx.registry.clone() else {
            return Ok(());
        };
        let reference = self.request.artifact_reference().to_string();
        match registry.pull(self.host(), &reference, &self.ctx.auth).await {
            Ok(handle) => {
                debug!(host = %self.host(), digest = ?handle.digest, "Artifact pulled");
                Ok(())
            }
            Err(e) => Err(self.fail(
                LifecyclePhase::ApplicationStart,
                Some(ARTIFACT_PULL_HOOK.to_string()),
                failure_reason(e),
            )),
        }
    }

    async fn run_hook(
        &self,
        hook: &HookSpec,
        extra: &[(&str, String)],
    ) -> Result<(), FailureReason> {
        run_single_hook(&self.ctx, &self.request, self.host(), hook, extra).await
    }

    fn transition(&mut self, phase: LifecyclePhase, event: LifecycleEvent) -> Result<(), HostFailure> {
        let result = self.state.process(event);
        self.publish();
        result.map_err(|e| {
            error!(host = %self.state.host_id(), "State machine rejected event: {}", e);
            HostFailure {
                host: self.state.host_id().clone(),
                phase,
                hook: None,
                reason: FailureReason::Internal {
                    message: e.to_string(),
                },
            }
        })
    }

    /// Record the failure in the state machine and build its attribution
    fn fail(&mut self, phase: LifecyclePhase, hook: Option<String>, reason: FailureReason) -> HostFailure {
        if let Err(e) = self.state.process(LifecycleEvent::Fail {
            hook: hook.clone(),
            reason: reason.clone(),
        }) {
            error!(host = %self.host(), "Failed to record failure: {}", e);
        }
        self.publish();
        HostFailure {
            host: self.host().clone(),
            phase,
            hook,
            reason,
        }
    }

    fn report(self, outcome: HostOutcome) -> HostReport {
        HostReport {
            host: self.state.host_id().clone(),
            outcome,
            state: self.state,
        }
    }
}

/// Run the `Rollback` hooks on one host
pub async fn rollback_host(
    ctx: &EngineContext,
    request: &DeploymentRequest,
    host: &HostId,
) -> RollbackOutcome {
    info!(host = %host, "Rolling back host");
    for hook in request.hooks().hooks_for(LifecyclePhase::Rollback) {
        if let Err(reason) = run_single_hook(ctx, request, host, hook, &[]).await {
            let failure = HostFailure {
                host: host.clone(),
                phase: LifecyclePhase::Rollback,
                hook: Some(hook.display_command()),
                reason,
            };
            warn!(host = %host, "Rollback failed: {}", failure);
            return RollbackOutcome {
                host: host.clone(),
                succeeded: false,
                failure: Some(failure),
            };
        }
    }
    RollbackOutcome {
        host: host.clone(),
        succeeded: true,
        failure: None,
    }
}

/// Resolve secrets, run one hook and classify its outcome
async fn run_single_hook(
    ctx: &EngineContext,
    request: &DeploymentRequest,
    host: &HostId,
    hook: &HookSpec,
    extra: &[(&str, String)],
) -> Result<(), FailureReason> {
    // Fresh resolution per hook, never reused
    let secrets = ctx
        .resolver
        .resolve_all(request.secrets(), &ctx.auth)
        .await
        .map_err(failure_reason)?;

    let env = hook_env(request, host, hook, extra, secrets).map_err(failure_reason)?;

    let outcome = ctx
        .runner
        .run(host, hook, &env, &ctx.auth)
        .await
        .map_err(failure_reason)?;

    match outcome.status() {
        HookStatus::Succeeded => {
            debug!(
                host = %host,
                phase = %hook.phase,
                hook = %hook.display_command(),
                duration_ms = outcome.duration_ms,
                "Hook succeeded"
            );
            Ok(())
        }
        HookStatus::Failed(exit_code) => {
            warn!(
                host = %host,
                phase = %hook.phase,
                hook = %hook.display_command(),
                exit_code = ?exit_code,
                "Hook failed, output:\n{}",
                outcome.truncated_output
            );
            Err(FailureReason::HookFailed { exit_code })
        }
        HookStatus::TimedOut => Err(FailureReason::HookTimedOut {
            timeout_secs: hook.timeout_secs,
        }),
    }
}

fn hook_env(
    request: &DeploymentRequest,
    host: &HostId,
    hook: &HookSpec,
    extra: &[(&str, String)],
    secrets: ResolvedSecrets,
) -> Result<HookEnv, DeployError> {
    let mut env = HookEnv::new()
        .var("DEPLOYMENT_ID", request.id().to_string())?
        .var("LIFECYCLE_EVENT", hook.phase.as_str())?
        .var("ARTIFACT_REFERENCE", request.artifact_reference())?
        .var("DEPLOY_HOST", host.as_str())?;
    for (key, value) in extra {
        env = env.var(*key, value.clone())?;
    }
    env.with_secrets(secrets)
}

/// Map a collaborator error onto the reason recorded for the host
pub fn failure_reason(err: DeployError) -> FailureReason {
    match err {
        DeployError::SecretUnavailable { name, message } => {
            FailureReason::SecretUnavailable { name, message }
        }
        DeployError::HookUnstartable(message) => FailureReason::HookUnstartable { message },
        DeployError::WorkloadProbe(message) => FailureReason::WorkloadProbeFailed { message },
        DeployError::RegistryAuthError(message) => FailureReason::RegistryAuth { message },
        DeployError::RegistryUnreachable(message) => FailureReason::RegistryUnreachable { message },
        DeployError::ArtifactNotFound(reference) => FailureReason::ArtifactNotFound { reference },
        other => FailureReason::Internal {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(
            failure_reason(DeployError::HookUnstartable("no such file".to_string())),
            FailureReason::HookUnstartable {
                message: "no such file".to_string()
            }
        );
        assert_eq!(
            failure_reason(DeployError::ArtifactNotFound("shop:9".to_string())),
            FailureReason::ArtifactNotFound {
                reference: "shop:9".to_string()
            }
        );
        assert!(matches!(
            failure_reason(DeployError::Internal("boom".to_string())),
            FailureReason::Internal { .. }
        ));
    }
}
