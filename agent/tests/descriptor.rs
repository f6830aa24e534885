use std::path::Path;

use fleetdeploy::models::deployment::{HookSet, HookSpec, LifecyclePhase};
use fleetdeploy::models::descriptor::{AppSpec, BuildSpec};

const APPSPEC: &str = r#"version: 0.0
os: linux
hooks:
  BeforeInstall:
    - location: scripts/install_dependencies.sh
      timeout: 300
      runas: root
  ApplicationStop:
    - location: scripts/stop_container.sh
      timeout: 120
      runas: root
  ApplicationStart:
    - location: scripts/start_container.sh
      timeout: 300
  Rollback:
    - location: scripts/restore_previous.sh
"#;

#[tokio::test]
async fn test_appspec_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("appspec.yml");
    tokio::fs::write(&path, APPSPEC).await.unwrap();

    let spec = AppSpec::load(&path).await.unwrap();
    let copy = dir.path().join("copy").join("appspec.yml");
    spec.save(&copy).await.unwrap();

    assert_eq!(AppSpec::load(&copy).await.unwrap(), spec);
}

#[tokio::test]
async fn test_hooks_resolve_against_bundle_dir() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("appspec.yml");
    tokio::fs::write(&path, APPSPEC).await.unwrap();

    let spec = AppSpec::load(&path).await.unwrap();
    let hooks = spec.hook_set(path.parent()).unwrap();

    assert_eq!(hooks.len(), 4);
    assert!(hooks.has_rollback());
    let stop = &hooks.hooks_for(LifecyclePhase::ApplicationStop)[0];
    assert_eq!(
        Path::new(stop.program()),
        dir.path().join("scripts/stop_container.sh")
    );
    assert!(stop.is_privileged());
    assert!(hooks.hooks_for(LifecyclePhase::AfterInstall).is_empty());
}

#[test]
fn test_hook_set_survives_descriptor_round_trip() {
    let hooks = HookSet::new()
        .with(
            HookSpec::new(LifecyclePhase::ApplicationStop, ["/opt/app/stop.sh"], 60)
                .unwrap()
                .privileged(true),
        )
        .with(HookSpec::new(LifecyclePhase::ValidateService, ["/opt/app/check.sh", "--port", "80"], 30).unwrap());

    let yaml = AppSpec::from_hook_set("linux", &hooks).to_yaml().unwrap();
    let back = AppSpec::from_yaml(&yaml).unwrap().hook_set(None).unwrap();

    assert_eq!(back, hooks);
}

#[test]
fn test_descriptor_round_trip_is_lossless() {
    let hooks = HookSet::new()
        .with(
            HookSpec::new(
                LifecyclePhase::AfterInstall,
                ["/opt/app/run.sh", "--msg", "hello world", "it's", ""],
                120,
            )
            .unwrap()
            .run_as("ubuntu"),
        )
        .with(
            HookSpec::new(LifecyclePhase::ApplicationStart, ["/opt/app/start.sh", "--label", "tier=web app"], 300)
                .unwrap()
                .privileged(true),
        );

    let yaml = AppSpec::from_hook_set("linux", &hooks).to_yaml().unwrap();
    let back = AppSpec::from_yaml(&yaml).unwrap().hook_set(None).unwrap();

    assert_eq!(back, hooks);
    let run = &back.hooks_for(LifecyclePhase::AfterInstall)[0];
    assert_eq!(run.command[3], "it's");
    assert_eq!(run.run_as.as_deref(), Some("ubuntu"));
}

#[tokio::test]
async fn test_buildspec_mapping_feeds_resolver() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buildspec.yml");
    tokio::fs::write(
        &path,
        "version: 0.2\nenv:\n  parameter-store:\n    DOCKER_REGISTRY_URL: /myapp/docker-registry/url\nphases:\n  build:\n    commands:\n      - docker build -t app .\n",
    )
    .await
    .unwrap();

    let spec = BuildSpec::load(&path).await.unwrap();
    assert_eq!(
        spec.parameter_store().get("DOCKER_REGISTRY_URL").map(String::as_str),
        Some("/myapp/docker-registry/url")
    );
    assert_eq!(spec.phase_commands().len(), 1);
}
