//! Lifecycle and build descriptor documents
//!
//! `appspec.yml` lists, per lifecycle phase, the hook scripts to run on a host.
//! `buildspec.yml` is produced for the upstream build provider; the engine only
//! reads its `env.parameter-store` mapping.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::deployment::{HookSet, HookSpec, LifecyclePhase};
use crate::utils::{is_env_name, split_shell_words};

/// Timeout applied to entries that do not declare one
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 3600;

/// Lifecycle descriptor (`appspec.yml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppSpec {
    #[serde(default, skip_serializing_if = "serde_yaml::Value::is_null")]
    pub version: serde_yaml::Value,

    pub os: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileMapping>,

    #[serde(default)]
    pub hooks: BTreeMap<LifecyclePhase, Vec<HookEntry>>,
}

/// Bundle file copied onto the host during install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMapping {
    pub source: String,
    pub destination: String,
}

/// One hook entry as written in the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookEntry {
    /// Script path, optionally followed by arguments, in shell word syntax
    pub location: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runas: Option<String>,
}

impl AppSpec {
    pub fn from_yaml(contents: &str) -> Result<Self, DeployError> {
        let spec: AppSpec = serde_yaml::from_str(contents)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_yaml(&self) -> Result<String, DeployError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DeployError> {
        let contents = File::new(path.as_ref()).read_string().await?;
        Self::from_yaml(&contents)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), DeployError> {
        File::new(path.as_ref()).write_string(&self.to_yaml()?).await
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        match self.os.as_str() {
            "linux" | "windows" => {}
            other => {
                return Err(DeployError::DescriptorError(format!(
                    "Unsupported os: {}",
                    other
                )))
            }
        }
        for (phase, entries) in &self.hooks {
            for entry in entries {
                if entry.location.trim().is_empty() {
                    return Err(DeployError::DescriptorError(format!(
                        "Hook in {} has an empty location",
                        phase
                    )));
                }
                if entry.timeout == Some(0) {
                    return Err(DeployError::DescriptorError(format!(
                        "Hook {} in {} has a zero timeout",
                        entry.location, phase
                    )));
                }
            }
        }
        Ok(())
    }

    /// Convert entries into hook specs. Relative script paths are resolved
    /// against `bundle_root` when one is given.
    pub fn hook_set(&self, bundle_root: Option<&Path>) -> Result<HookSet, DeployError> {
        let mut set = HookSet::new();
        for (phase, entries) in &self.hooks {
            for entry in entries {
                set.push(entry.to_hook(*phase, bundle_root)?);
            }
        }
        Ok(set)
    }

    /// Build a descriptor from an in-memory hook set
    pub fn from_hook_set(os: impl Into<String>, hooks: &HookSet) -> Self {
        let mut entries: BTreeMap<LifecyclePhase, Vec<HookEntry>> = BTreeMap::new();
        for (phase, specs) in hooks.iter() {
            if specs.is_empty() {
                continue;
            }
            entries.insert(phase, specs.iter().map(HookEntry::from_hook).collect());
        }
        Self {
            version: serde_yaml::Value::from(0.0),
            os: os.into(),
            files: Vec::new(),
            hooks: entries,
        }
    }
}

impl HookEntry {
    fn to_hook(&self, phase: LifecyclePhase, bundle_root: Option<&Path>) -> Result<HookSpec, DeployError> {
        let words = split_shell_words(&self.location).ok_or_else(|| {
            DeployError::DescriptorError(format!(
                "Hook location in {} has an unterminated quote: {}",
                phase, self.location
            ))
        })?;
        let mut parts = words.into_iter();
        let script = parts.next().unwrap_or_default();
        let script = match bundle_root {
            Some(root) if Path::new(&script).is_relative() => {
                root.join(&script).to_string_lossy().into_owned()
            }
            _ => script,
        };
        let command = std::iter::once(script).chain(parts);
        let timeout = self.timeout.unwrap_or(DEFAULT_HOOK_TIMEOUT_SECS);

        let mut hook = HookSpec::new(phase, command, timeout)?;
        if let Some(user) = &self.runas {
            hook = hook.run_as(user.as_str());
            hook.validate()?;
        }
        Ok(hook)
    }

    fn from_hook(hook: &HookSpec) -> Self {
        Self {
            location: hook.display_command(),
            timeout: Some(hook.timeout_secs),
            runas: hook.run_as.clone(),
        }
    }
}

/// Build descriptor (`buildspec.yml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default, skip_serializing_if = "serde_yaml::Value::is_null")]
    pub version: serde_yaml::Value,

    #[serde(default)]
    pub env: BuildEnv,

    #[serde(default)]
    pub phases: BuildPhases,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<BuildArtifacts>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEnv {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    /// Logical name -> secret store path
    #[serde(rename = "parameter-store", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameter_store: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPhases {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<BuildPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_build: Option<BuildPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_build: Option<BuildPhase>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPhase {
    #[serde(rename = "runtime-versions", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_versions: BTreeMap<String, serde_yaml::Value>,

    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifacts {
    #[serde(default)]
    pub files: Vec<String>,
}

impl BuildSpec {
    pub fn from_yaml(contents: &str) -> Result<Self, DeployError> {
        let spec: BuildSpec = serde_yaml::from_str(contents)?;
        let names = spec.env.variables.keys().chain(spec.env.parameter_store.keys());
        for name in names {
            if !is_env_name(name) {
                return Err(DeployError::DescriptorError(format!(
                    "env name {:?} is not a valid environment variable name",
                    name
                )));
            }
        }
        for (name, path) in &spec.env.parameter_store {
            if path.trim().is_empty() {
                return Err(DeployError::DescriptorError(format!(
                    "parameter-store entry {} has an empty path",
                    name
                )));
            }
        }
        Ok(spec)
    }

    pub fn to_yaml(&self) -> Result<String, DeployError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DeployError> {
        let contents = File::new(path.as_ref()).read_string().await?;
        Self::from_yaml(&contents)
    }

    /// The mapping consumed by the secret resolver
    pub fn parameter_store(&self) -> &BTreeMap<String, String> {
        &self.env.parameter_store
    }

    /// Phase command lists in execution order
    pub fn phase_commands(&self) -> Vec<(&'static str, &[String])> {
        [
            ("install", &self.phases.install),
            ("pre_build", &self.phases.pre_build),
            ("build", &self.phases.build),
            ("post_build", &self.phases.post_build),
        ]
        .into_iter()
        .filter_map(|(name, phase)| phase.as_ref().map(|p| (name, p.commands.as_slice())))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPSPEC: &str = r#"
version: 0.0
os: linux
files:
  - source: /
    destination: /opt/app
hooks:
  ApplicationStop:
    - location: scripts/stop_container.sh
      timeout: 300
      runas: root
  ApplicationStart:
    - location: scripts/start_container.sh --detach
      timeout: 300
      runas: root
    - location: scripts/warmup.sh
"#;

    #[test]
    fn test_appspec_hook_set() {
        let spec = AppSpec::from_yaml(APPSPEC).unwrap();
        let hooks = spec.hook_set(Some(Path::new("/bundle"))).unwrap();

        let stop = hooks.hooks_for(LifecyclePhase::ApplicationStop);
        assert_eq!(stop.len(), 1);
        assert_eq!(stop[0].program(), "/bundle/scripts/stop_container.sh");
        assert!(stop[0].is_privileged());
        assert_eq!(stop[0].timeout_secs, 300);

        let start = hooks.hooks_for(LifecyclePhase::ApplicationStart);
        assert_eq!(start[0].args(), ["--detach".to_string()]);
        assert_eq!(start[1].timeout_secs, DEFAULT_HOOK_TIMEOUT_SECS);
        assert_eq!(start[1].run_as, None);
    }

    #[test]
    fn test_appspec_rejects_unknown_phase() {
        let doc = "os: linux\nhooks:\n  Install:\n    - location: x.sh\n";
        assert!(AppSpec::from_yaml(doc).is_err());
    }

    #[test]
    fn test_appspec_rejects_zero_timeout() {
        let doc = "os: linux\nhooks:\n  AfterInstall:\n    - location: x.sh\n      timeout: 0\n";
        assert!(matches!(
            AppSpec::from_yaml(doc),
            Err(DeployError::DescriptorError(_))
        ));
    }

    #[test]
    fn test_appspec_keeps_quoted_arguments_and_user() {
        let doc = r#"
os: linux
hooks:
  AfterInstall:
    - location: /opt/app/run.sh --msg 'hello world'
      runas: ubuntu
"#;
        let hooks = AppSpec::from_yaml(doc).unwrap().hook_set(None).unwrap();
        let hook = &hooks.hooks_for(LifecyclePhase::AfterInstall)[0];

        assert_eq!(hook.args(), ["--msg".to_string(), "hello world".to_string()]);
        assert_eq!(hook.run_as.as_deref(), Some("ubuntu"));
        assert!(!hook.is_privileged());
    }

    #[test]
    fn test_appspec_rejects_unterminated_quote() {
        let doc = "os: linux\nhooks:\n  AfterInstall:\n    - location: run.sh 'oops\n";
        let spec = AppSpec::from_yaml(doc).unwrap();
        assert!(matches!(spec.hook_set(None), Err(DeployError::DescriptorError(_))));
    }

    #[test]
    fn test_buildspec_rejects_unexportable_names() {
        let doc = "env:\n  parameter-store:\n    db-password: /app/db/password\n";
        assert!(matches!(
            BuildSpec::from_yaml(doc),
            Err(DeployError::DescriptorError(_))
        ));
    }

    #[test]
    fn test_buildspec_parameter_store() {
        let doc = r#"
version: 0.2
env:
  parameter-store:
    DOCKER_REGISTRY_USERNAME: /myapp/docker-credentials/username
    DOCKER_REGISTRY_PASSWORD: /myapp/docker-credentials/password
    DOCKER_REGISTRY_URL: /myapp/docker-registry/url
phases:
  install:
    runtime-versions:
      python: 3.11
  pre_build:
    commands:
      - pip install -r requirements.txt
  build:
    commands:
      - docker build -t "$DOCKER_REGISTRY_URL/app:latest" .
  post_build:
    commands:
      - docker push "$DOCKER_REGISTRY_URL/app:latest"
artifacts:
  files:
    - '**/*'
"#;
        let spec = BuildSpec::from_yaml(doc).unwrap();
        assert_eq!(spec.parameter_store().len(), 3);
        assert_eq!(
            spec.parameter_store()["DOCKER_REGISTRY_URL"],
            "/myapp/docker-registry/url"
        );
        let phases: Vec<_> = spec.phase_commands().iter().map(|(n, _)| *n).collect();
        assert_eq!(phases, vec!["install", "pre_build", "build", "post_build"]);
    }
}
