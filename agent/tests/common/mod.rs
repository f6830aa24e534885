//! Scripted collaborators shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fleetdeploy::deploy::executor::EngineContext;
use fleetdeploy::deploy::registry::{ArtifactHandle, ArtifactRegistry};
use fleetdeploy::deploy::runner::{HookEnv, HookOutcome, HookRunner};
use fleetdeploy::deploy::workload::WorkloadInspector;
use fleetdeploy::errors::DeployError;
use fleetdeploy::models::deployment::{
    DeploymentConfig, DeploymentRequest, HookSet, HookSpec, HostId, LifecyclePhase, RolloutPolicy,
    WorkloadSelector,
};
use fleetdeploy::secrets::{AuthContext, Credential, MemorySecretStore, RetryPolicy, SecretResolver};

/// Env keys the runner copies from each hook invocation
const RECORDED_VARS: [&str; 5] = [
    "DEPLOYMENT_ID",
    "LIFECYCLE_EVENT",
    "ARTIFACT_REFERENCE",
    "DEPLOY_HOST",
    "DEPLOY_TARGET_WORKLOAD",
];

/// What a scripted hook does
#[derive(Debug, Clone)]
pub enum Script {
    Exit(i32),
    TimeOut,
    Unstartable,
}

/// One recorded hook invocation
#[derive(Debug, Clone)]
pub struct Call {
    pub host: HostId,
    pub phase: LifecyclePhase,
    pub command: String,
    pub vars: BTreeMap<String, String>,
}

/// Hook runner replaying scripted outcomes; unscripted hooks exit 0
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<(String, String), Script>>,
    calls: Mutex<Vec<Call>>,
    cancel_on: Mutex<Option<(String, String, CancellationToken)>>,
    delay: Option<Duration>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn script(&self, host: &str, command: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert((host.to_string(), command.to_string()), script);
    }

    /// Fire `token` when `command` runs on `host`
    pub fn cancel_when(&self, host: &str, command: &str, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((host.to_string(), command.to_string(), token));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, host: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.host.as_str() == host)
            .collect()
    }

    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.calls_for(host).into_iter().map(|c| c.command).collect()
    }
}

#[async_trait]
impl HookRunner for ScriptedRunner {
    async fn run(
        &self,
        host: &HostId,
        hook: &HookSpec,
        env: &HookEnv,
        _auth: &AuthContext,
    ) -> Result<HookOutcome, DeployError> {
        let command = hook.display_command();
        let vars = RECORDED_VARS
            .iter()
            .filter_map(|k| env.get(k).map(|v| (k.to_string(), v.to_string())))
            .collect();
        self.calls.lock().unwrap().push(Call {
            host: host.clone(),
            phase: hook.phase,
            command: command.clone(),
            vars,
        });

        if let Some((h, c, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if h == host.as_str() && *c == command {
                token.cancel();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&(host.to_string(), command))
            .cloned()
            .unwrap_or(Script::Exit(0));
        match script {
            Script::Exit(code) => Ok(HookOutcome {
                exit_code: Some(code),
                timed_out: false,
                duration_ms: 1,
                truncated_output: String::new(),
            }),
            Script::TimeOut => Ok(HookOutcome {
                exit_code: None,
                timed_out: true,
                duration_ms: hook.timeout_secs * 1000,
                truncated_output: String::new(),
            }),
            Script::Unstartable => Err(DeployError::HookUnstartable(format!(
                "{}: No such file or directory",
                hook.display_command()
            ))),
        }
    }
}

/// Inspector returning fixed workload lists per host
#[derive(Default)]
pub struct FakeInspector {
    running: HashMap<String, Vec<String>>,
}

impl FakeInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running_on(mut self, host: &str, ids: &[&str]) -> Self {
        self.running
            .insert(host.to_string(), ids.iter().map(|s| s.to_string()).collect());
        self
    }
}

#[async_trait]
impl WorkloadInspector for FakeInspector {
    async fn running(
        &self,
        host: &HostId,
        _selector: &WorkloadSelector,
        _auth: &AuthContext,
    ) -> Result<Vec<String>, DeployError> {
        Ok(self.running.get(host.as_str()).cloned().unwrap_or_default())
    }
}

/// Registry whose pulls fail on selected hosts
#[derive(Default)]
pub struct FakeRegistry {
    missing_on: HashSet<String>,
    pulls: Mutex<Vec<HostId>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing_on(mut self, host: &str) -> Self {
        self.missing_on.insert(host.to_string());
        self
    }

    pub fn pulls(&self) -> Vec<HostId> {
        self.pulls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactRegistry for FakeRegistry {
    async fn push(&self, _reference: &str, _credential: &Credential) -> Result<(), DeployError> {
        Ok(())
    }

    async fn pull(
        &self,
        host: &HostId,
        reference: &str,
        _auth: &AuthContext,
    ) -> Result<ArtifactHandle, DeployError> {
        self.pulls.lock().unwrap().push(host.clone());
        if self.missing_on.contains(host.as_str()) {
            return Err(DeployError::ArtifactNotFound(reference.to_string()));
        }
        Ok(ArtifactHandle {
            host: host.clone(),
            reference: reference.to_string(),
            digest: None,
        })
    }
}

pub const ARTIFACT: &str = "registry.example.com/shop:1.4.2";

pub fn hosts(names: &[&str]) -> Vec<HostId> {
    names.iter().map(|n| HostId::from(*n)).collect()
}

pub fn hook(phase: LifecyclePhase, script: &str) -> HookSpec {
    HookSpec::new(phase, [script], 60).unwrap()
}

/// One hook per forward phase, named after the phase
pub fn standard_hooks() -> HookSet {
    HookSet::new()
        .with(hook(LifecyclePhase::BeforeInstall, "before_install.sh"))
        .with(hook(LifecyclePhase::ApplicationStop, "stop_container.sh"))
        .with(hook(LifecyclePhase::AfterInstall, "after_install.sh"))
        .with(hook(LifecyclePhase::ApplicationStart, "start_container.sh"))
        .with(hook(LifecyclePhase::ValidateService, "validate.sh"))
}

pub fn request(names: &[&str], hooks: HookSet, policy: RolloutPolicy) -> DeploymentRequest {
    DeploymentRequest::new(ARTIFACT, hosts(names), hooks, DeploymentConfig::new(policy)).unwrap()
}

pub fn store() -> MemorySecretStore {
    [("/shop/db/password", "s3cret")].into_iter().collect()
}

pub fn context(runner: Arc<ScriptedRunner>) -> EngineContext {
    let resolver = SecretResolver::new(Arc::new(store())).with_retry(RetryPolicy::none());
    EngineContext::new(runner, Arc::new(resolver))
}
