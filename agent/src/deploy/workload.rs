//! Running-workload inspection on a host
//!
//! Used at `ApplicationStop` to decide which workload the stop hooks act on.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::runner::{HookEnv, HookRunner, HookStatus};
use crate::errors::DeployError;
use crate::models::deployment::{HookSpec, HostId, LifecyclePhase, WorkloadSelector};
use crate::secrets::AuthContext;

/// Environment variable carrying the selected workload id to stop hooks
pub const TARGET_WORKLOAD_VAR: &str = "DEPLOY_TARGET_WORKLOAD";

const PROBE_TIMEOUT_SECS: u64 = 30;

/// Lists running workloads on a host
#[async_trait]
pub trait WorkloadInspector: Send + Sync {
    /// Ids of the running workloads matching `selector`
    async fn running(
        &self,
        host: &HostId,
        selector: &WorkloadSelector,
        auth: &AuthContext,
    ) -> Result<Vec<String>, DeployError>;
}

/// Inspector asking the docker daemon on the host through the hook runner
pub struct DockerWorkloadInspector {
    runner: Arc<dyn HookRunner>,
    timeout_secs: u64,
}

impl DockerWorkloadInspector {
    pub fn new(runner: Arc<dyn HookRunner>) -> Self {
        Self {
            runner,
            timeout_secs: PROBE_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs.max(1);
        self
    }
}

#[async_trait]
impl WorkloadInspector for DockerWorkloadInspector {
    async fn running(
        &self,
        host: &HostId,
        selector: &WorkloadSelector,
        auth: &AuthContext,
    ) -> Result<Vec<String>, DeployError> {
        let probe = HookSpec::new(
            LifecyclePhase::ApplicationStop,
            ["docker", "ps", "--quiet", "--no-trunc", "--filter", selector.filter()],
            self.timeout_secs,
        )?;
        let outcome = self.runner.run(host, &probe, &HookEnv::new(), auth).await?;

        match outcome.status() {
            HookStatus::Succeeded => {
                let ids = parse_container_ids(&outcome.truncated_output);
                debug!(host = %host, selector = selector.filter(), matches = ids.len(), "Probed running workloads");
                Ok(ids)
            }
            HookStatus::Failed(code) => Err(DeployError::WorkloadProbe(format!(
                "docker ps exited with {:?}: {}",
                code,
                outcome.truncated_output.trim()
            ))),
            HookStatus::TimedOut => Err(DeployError::WorkloadProbe(format!(
                "docker ps timed out after {}s",
                self.timeout_secs
            ))),
        }
    }
}

/// Keep the lines that look like container ids; stderr noise is dropped
fn parse_container_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.len() >= 12 && line.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_string)
        .collect()
}

/// What the executor observed about one host's workloads.
///
/// Owned by a single host executor; never shared across hosts.
#[derive(Debug, Default)]
pub struct HostRuntime {
    observed: Option<Vec<String>>,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, workloads: Vec<String>) {
        self.observed = Some(workloads);
    }

    pub fn observed(&self) -> Option<&[String]> {
        self.observed.as_deref()
    }

    /// The single workload stop hooks should act on.
    ///
    /// `Ok(None)` when nothing was probed or nothing is running; more than
    /// one match is never resolved by picking one.
    pub fn stop_target(&self) -> Result<Option<&str>, DeployError> {
        match self.observed.as_deref() {
            None | Some([]) => Ok(None),
            Some([only]) => Ok(Some(only.as_str())),
            Some(many) => Err(DeployError::AmbiguousTargetState(many.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::deploy::runner::HookOutcome;

    struct CannedRunner {
        output: String,
        exit_code: Option<i32>,
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl HookRunner for CannedRunner {
        async fn run(
            &self,
            _host: &HostId,
            hook: &HookSpec,
            _env: &HookEnv,
            _auth: &AuthContext,
        ) -> Result<HookOutcome, DeployError> {
            self.seen.lock().unwrap().push(hook.command.clone());
            Ok(HookOutcome {
                exit_code: self.exit_code,
                timed_out: false,
                duration_ms: 3,
                truncated_output: self.output.clone(),
            })
        }
    }

    fn canned(output: &str, exit_code: Option<i32>) -> Arc<CannedRunner> {
        Arc::new(CannedRunner {
            output: output.to_string(),
            exit_code,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_parse_container_ids() {
        let output = "3f4e2a1b9c8d7e6f5a4b3c2d1e0f9a8b\nWARNING: something\n\n0123456789ab\n";
        assert_eq!(
            parse_container_ids(output),
            vec!["3f4e2a1b9c8d7e6f5a4b3c2d1e0f9a8b", "0123456789ab"]
        );
        assert!(parse_container_ids("").is_empty());
    }

    #[tokio::test]
    async fn test_docker_inspector_passes_filter() {
        let runner = canned("0123456789abcdef\n", Some(0));
        let inspector = DockerWorkloadInspector::new(runner.clone());
        let ids = inspector
            .running(
                &HostId::from("web-1"),
                &WorkloadSelector::new("label=app=shop"),
                &AuthContext::anonymous(),
            )
            .await
            .unwrap();

        assert_eq!(ids, vec!["0123456789abcdef"]);
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].last().map(String::as_str), Some("label=app=shop"));
    }

    #[tokio::test]
    async fn test_docker_inspector_probe_failure() {
        let inspector = DockerWorkloadInspector::new(canned("Cannot connect to the Docker daemon", Some(1)));
        let result = inspector
            .running(
                &HostId::from("web-1"),
                &WorkloadSelector::new("name=shop"),
                &AuthContext::anonymous(),
            )
            .await;
        assert!(matches!(result, Err(DeployError::WorkloadProbe(_))));
    }

    #[test]
    fn test_stop_target() {
        let mut runtime = HostRuntime::new();
        assert_eq!(runtime.stop_target().unwrap(), None);

        runtime.record(vec![]);
        assert_eq!(runtime.stop_target().unwrap(), None);

        runtime.record(vec!["abc".to_string()]);
        assert_eq!(runtime.stop_target().unwrap(), Some("abc"));

        runtime.record(vec!["abc".to_string(), "def".to_string()]);
        assert!(matches!(
            runtime.stop_target(),
            Err(DeployError::AmbiguousTargetState(2))
        ));
    }
}
