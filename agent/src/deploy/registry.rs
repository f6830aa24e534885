//! Artifact registry client

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::runner::{HookEnv, HookRunner, HookStatus};
use crate::errors::DeployError;
use crate::models::deployment::{HookSpec, HostId, LifecyclePhase};
use crate::secrets::{AuthContext, Credential};

const DEFAULT_PULL_TIMEOUT_SECS: u64 = 600;
const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(600);

/// An artifact present on a host after a successful pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub host: HostId,
    pub reference: String,

    /// Content digest when the registry reported one
    pub digest: Option<String>,
}

/// Pushes and pulls versioned artifacts
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Publish a locally built artifact
    async fn push(&self, reference: &str, credential: &Credential) -> Result<(), DeployError>;

    /// Fetch the artifact onto `host`
    async fn pull(
        &self,
        host: &HostId,
        reference: &str,
        auth: &AuthContext,
    ) -> Result<ArtifactHandle, DeployError>;
}

/// Registry client driving the docker CLI
pub struct DockerRegistryClient {
    runner: Arc<dyn HookRunner>,
    pull_timeout_secs: u64,
}

impl DockerRegistryClient {
    pub fn new(runner: Arc<dyn HookRunner>) -> Self {
        Self {
            runner,
            pull_timeout_secs: DEFAULT_PULL_TIMEOUT_SECS,
        }
    }

    pub fn with_pull_timeout(mut self, timeout_secs: u64) -> Self {
        self.pull_timeout_secs = timeout_secs.max(1);
        self
    }
}

#[async_trait]
impl ArtifactRegistry for DockerRegistryClient {
    async fn push(&self, reference: &str, credential: &Credential) -> Result<(), DeployError> {
        info!("Publishing artifact: {}", reference);

        // Password goes through stdin only
        debug!("Authenticating with registry {}", credential.url);
        docker(
            &["login", &credential.url, "-u", &credential.username, "--password-stdin"],
            Some(credential.password.expose_secret()),
        )
        .await
        .map_err(|e| match e {
            DeployError::ArtifactNotFound(msg) => DeployError::RegistryAuthError(msg),
            other => other,
        })?;

        let output = docker(&["push", reference], None).await.map_err(|e| match e {
            DeployError::ArtifactNotFound(_) => DeployError::ArtifactNotFound(reference.to_string()),
            other => other,
        })?;
        debug!("docker push: {}", output.trim());

        info!("Published artifact: {}", reference);
        Ok(())
    }

    async fn pull(
        &self,
        host: &HostId,
        reference: &str,
        auth: &AuthContext,
    ) -> Result<ArtifactHandle, DeployError> {
        debug!(host = %host, "Pulling artifact: {}", reference);
        let hook = HookSpec::new(
            LifecyclePhase::ApplicationStart,
            ["docker", "pull", reference],
            self.pull_timeout_secs,
        )?;
        let outcome = self.runner.run(host, &hook, &HookEnv::new(), auth).await?;

        match outcome.status() {
            HookStatus::Succeeded => Ok(ArtifactHandle {
                host: host.clone(),
                reference: reference.to_string(),
                digest: parse_digest(&outcome.truncated_output),
            }),
            HookStatus::TimedOut => Err(DeployError::RegistryUnreachable(format!(
                "pull of {} timed out after {}s",
                reference, self.pull_timeout_secs
            ))),
            HookStatus::Failed(_) => Err(match classify(&outcome.truncated_output) {
                DeployError::ArtifactNotFound(_) => DeployError::ArtifactNotFound(reference.to_string()),
                other => other,
            }),
        }
    }
}

/// Run a local docker command, returning stdout
async fn docker(args: &[&str], stdin: Option<&str>) -> Result<String, DeployError> {
    let mut child = Command::new("docker")
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DeployError::RegistryUnreachable(format!("failed to run docker: {}", e)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        // Closing stdin ends --password-stdin input
        drop(pipe);
    }

    let output = tokio::time::timeout(DEFAULT_PUSH_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| DeployError::RegistryUnreachable(format!("docker {} timed out", args[0])))??;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(classify(&String::from_utf8_lossy(&output.stderr)))
    }
}

/// Map docker CLI error output to a registry error kind
fn classify(stderr: &str) -> DeployError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("manifest unknown")
        || lower.contains("not found")
        || lower.contains("does not exist")
    {
        DeployError::ArtifactNotFound(message)
    } else if lower.contains("unauthorized")
        || lower.contains("authentication required")
        || lower.contains("denied")
        || lower.contains("incorrect username or password")
    {
        DeployError::RegistryAuthError(message)
    } else {
        DeployError::RegistryUnreachable(message)
    }
}

fn parse_digest(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Digest:"))
        .map(|digest| digest.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::runner::HookOutcome;

    struct CannedRunner {
        exit_code: Option<i32>,
        output: &'static str,
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
            assert_eq!(hook.program(), "docker");
            Ok(HookOutcome {
                exit_code: self.exit_code,
                timed_out: false,
                duration_ms: 10,
                truncated_output: self.output.to_string(),
            })
        }
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify("Error response from daemon: manifest for shop:9 not found: manifest unknown"),
            DeployError::ArtifactNotFound(_)
        ));
        assert!(matches!(
            classify("Error response from daemon: Get \"https://r.example.com/v2/\": unauthorized"),
            DeployError::RegistryAuthError(_)
        ));
        assert!(matches!(
            classify("dial tcp: lookup r.example.com: no such host"),
            DeployError::RegistryUnreachable(_)
        ));
    }

    #[test]
    fn test_parse_digest() {
        let output = "1.4: Pulling from shop\nDigest: sha256:abc123\nStatus: Downloaded newer image\n";
        assert_eq!(parse_digest(output), Some("sha256:abc123".to_string()));
        assert_eq!(parse_digest("Status: Image is up to date"), None);
    }

    #[tokio::test]
    async fn test_pull_through_runner() {
        let client = DockerRegistryClient::new(Arc::new(CannedRunner {
            exit_code: Some(0),
            output: "Digest: sha256:feed\n",
        }));
        let handle = client
            .pull(&HostId::from("web-1"), "registry.example.com/shop:1.4", &AuthContext::anonymous())
            .await
            .unwrap();
        assert_eq!(handle.digest.as_deref(), Some("sha256:feed"));
        assert_eq!(handle.reference, "registry.example.com/shop:1.4");
    }

    #[tokio::test]
    async fn test_pull_not_found_names_reference() {
        let client = DockerRegistryClient::new(Arc::new(CannedRunner {
            exit_code: Some(1),
            output: "Error response from daemon: manifest unknown",
        }));
        let err = client
            .pull(&HostId::from("web-1"), "shop:missing", &AuthContext::anonymous())
            .await
            .unwrap_err();
        match err {
            DeployError::ArtifactNotFound(reference) => assert_eq!(reference, "shop:missing"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
