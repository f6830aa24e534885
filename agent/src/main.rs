//! fleetdeploy - Entry Point
//!
//! Runs lifecycle hooks for a built artifact across a host group.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleetdeploy::deploy::coordinator::Coordinator;
use fleetdeploy::deploy::executor::EngineContext;
use fleetdeploy::deploy::history::JsonLinesHistory;
use fleetdeploy::deploy::registry::{ArtifactRegistry, DockerRegistryClient};
use fleetdeploy::deploy::runner::{HookRunner, ProcessHookRunner};
use fleetdeploy::deploy::workload::DockerWorkloadInspector;
use fleetdeploy::logs::{init_logging, LogOptions};
use fleetdeploy::models::deployment::{
    DeploymentConfig, DeploymentRequest, HostId, RolloutPolicy, WorkloadSelector,
};
use fleetdeploy::models::descriptor::{AppSpec, BuildSpec};
use fleetdeploy::models::result::{DeploymentResult, OverallStatus};
use fleetdeploy::secrets::{AuthContext, SecretResolver};
use fleetdeploy::storage::layout::StorageLayout;
use fleetdeploy::storage::settings::Settings;
use fleetdeploy::utils::version_info;

#[derive(Parser)]
#[command(name = "fleetdeploy")]
#[command(about = "Roll an artifact out across a host group through lifecycle hooks")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the one in the storage directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy an artifact to a host group
    Deploy {
        /// Lifecycle descriptor (appspec.yml)
        #[arg(long)]
        appspec: PathBuf,

        /// Artifact reference, e.g. registry/app:tag
        #[arg(long)]
        artifact: String,

        /// Target hosts, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        hosts: Vec<String>,

        /// all-at-once, one-at-a-time or canary:<percentage>
        #[arg(long, default_value = "all-at-once")]
        policy: RolloutPolicy,

        /// Build descriptor whose parameter-store mapping names the secrets
        #[arg(long)]
        buildspec: Option<PathBuf>,

        /// Filter selecting the running workload to stop, e.g. label=app=shop
        #[arg(long)]
        selector: Option<String>,

        /// Roll back succeeded hosts too when the deployment does not succeed
        #[arg(long)]
        rollback_on_failure: bool,
    },

    /// Validate a lifecycle descriptor
    Validate {
        #[arg(long)]
        appspec: PathBuf,
    },

    /// Push an artifact using registry credentials from the secret store
    Publish {
        #[arg(long)]
        buildspec: PathBuf,

        #[arg(long)]
        artifact: String,

        #[arg(long)]
        username_key: String,

        #[arg(long)]
        password_key: String,

        #[arg(long)]
        url_key: String,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        return match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let layout = StorageLayout::default();
    let settings = match load_settings(cli.settings.as_deref(), &layout).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // Hold the guard so file logs are flushed on exit
    let _log_guard = match init_logging(LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings.log_dir.clone(),
        ..Default::default()
    }) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let result = match cli.command {
        Commands::Deploy {
            appspec,
            artifact,
            hosts,
            policy,
            buildspec,
            selector,
            rollback_on_failure,
        } => {
            let args = DeployArgs {
                appspec,
                artifact,
                hosts,
                policy,
                buildspec,
                selector,
                rollback_on_failure,
            };
            deploy(&settings, &layout, args).await
        }
        Commands::Validate { appspec } => validate(&appspec).await,
        Commands::Publish {
            buildspec,
            artifact,
            username_key,
            password_key,
            url_key,
        } => {
            publish(
                &settings,
                &buildspec,
                &artifact,
                [username_key.as_str(), password_key.as_str(), url_key.as_str()],
            )
            .await
        }
        Commands::Version => Ok(ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

struct DeployArgs {
    appspec: PathBuf,
    artifact: String,
    hosts: Vec<String>,
    policy: RolloutPolicy,
    buildspec: Option<PathBuf>,
    selector: Option<String>,
    rollback_on_failure: bool,
}

async fn load_settings(path: Option<&Path>, layout: &StorageLayout) -> anyhow::Result<Settings> {
    if let Some(path) = path {
        return Settings::load(path)
            .await
            .with_context(|| format!("Unable to read settings file {}", path.display()));
    }
    let default_file = layout.settings_file();
    if default_file.exists().await {
        return Settings::load(default_file.path())
            .await
            .context("Unable to read settings file");
    }
    Ok(Settings::default())
}

fn resolver(settings: &Settings) -> Arc<SecretResolver> {
    Arc::new(
        SecretResolver::new(settings.secret_store.build())
            .with_retry(settings.secret_retry.policy()),
    )
}

fn auth_context(settings: &Settings) -> AuthContext {
    settings
        .auth_context
        .clone()
        .map(AuthContext::new)
        .unwrap_or_default()
}

async fn deploy(settings: &Settings, layout: &StorageLayout, args: DeployArgs) -> anyhow::Result<ExitCode> {
    let appspec = AppSpec::load(&args.appspec)
        .await
        .with_context(|| format!("Unable to load {}", args.appspec.display()))?;
    let bundle_root = args.appspec.parent().filter(|p| !p.as_os_str().is_empty());
    let hooks = appspec.hook_set(bundle_root)?;

    let secrets = match &args.buildspec {
        Some(path) => BuildSpec::load(path)
            .await
            .with_context(|| format!("Unable to load {}", path.display()))?
            .parameter_store()
            .clone(),
        None => BTreeMap::new(),
    };

    let hosts = args
        .hosts
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .map(HostId::from);
    let config = DeploymentConfig::new(args.policy).with_rollback_on_failure(args.rollback_on_failure);
    let mut request = DeploymentRequest::new(args.artifact, hosts, hooks, config)?.with_secrets(secrets)?;
    if let Some(selector) = args.selector {
        request = request.with_workload_selector(WorkloadSelector::new(selector));
    }

    let runner: Arc<dyn HookRunner> = Arc::new(
        ProcessHookRunner::new(settings.transport.clone())
            .with_output_limit(settings.output_limit_bytes),
    );
    let mut ctx = EngineContext::new(runner.clone(), resolver(settings)).with_auth(auth_context(settings));
    if request.workload_selector().is_some() {
        ctx = ctx.with_inspector(Arc::new(
            DockerWorkloadInspector::new(runner.clone()).with_timeout(settings.workload_probe_timeout_secs),
        ));
    }
    if settings.registry.enabled {
        ctx = ctx.with_registry(Arc::new(
            DockerRegistryClient::new(runner.clone()).with_pull_timeout(settings.registry.pull_timeout_secs),
        ));
    }

    let history_path = settings
        .history_file
        .clone()
        .unwrap_or_else(|| layout.history_file());
    let coordinator = Coordinator::new(ctx).with_history(Arc::new(JsonLinesHistory::new(history_path)));

    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn(cancel_on_signal(cancel.clone()));

    info!("Deploying {} to {} hosts", request.artifact_reference(), request.target_group().len());
    let result = coordinator.deploy_with_cancel(request, cancel).await;
    signal_task.abort();

    println!("{}", serde_json::to_string_pretty(&result)?);
    print_summary(&result);

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    let appspec = AppSpec::load(path)
        .await
        .with_context(|| format!("Unable to load {}", path.display()))?;
    let hooks = appspec.hook_set(None)?;

    print!("{}", appspec.to_yaml()?);
    eprintln!(
        "{} {} ({} hooks)",
        "Valid:".green().bold(),
        path.display(),
        hooks.len()
    );
    Ok(ExitCode::SUCCESS)
}

async fn publish(
    settings: &Settings,
    buildspec: &Path,
    artifact: &str,
    keys: [&str; 3],
) -> anyhow::Result<ExitCode> {
    let buildspec = BuildSpec::load(buildspec)
        .await
        .with_context(|| format!("Unable to load {}", buildspec.display()))?;

    let resolved = resolver(settings)
        .resolve(buildspec.parameter_store(), keys, &auth_context(settings))
        .await?;
    let [username_key, password_key, url_key] = keys;
    let credential = resolved.credential(username_key, password_key, url_key)?;

    let runner: Arc<dyn HookRunner> = Arc::new(ProcessHookRunner::local());
    DockerRegistryClient::new(runner)
        .push(artifact, &credential)
        .await?;

    eprintln!("{} {}", "Published:".green().bold(), artifact);
    Ok(ExitCode::SUCCESS)
}

fn print_summary(result: &DeploymentResult) {
    let status = result.overall_status.to_string();
    let status = match result.overall_status {
        OverallStatus::Succeeded => status.green().bold(),
        OverallStatus::PartiallyFailed | OverallStatus::RolledBack => status.yellow().bold(),
        OverallStatus::Failed => status.red().bold(),
    };
    eprintln!(
        "{} {}: {} succeeded, {} failed, {} skipped",
        "Deployment".bold(),
        status,
        result.succeeded_hosts.len(),
        result.failed_hosts.len(),
        result.skipped_hosts.len()
    );
    for failure in &result.failed_hosts {
        eprintln!("  {} {}", "x".red(), failure);
    }
    for rollback in &result.rollbacks {
        let mark = if rollback.succeeded { "rolled back".yellow() } else { "rollback failed".red() };
        eprintln!("  {} {}", rollback.host, mark);
    }
}

/// Cancel the deployment on Ctrl+C or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                warn!("SIGTERM received, cancelling deployment...");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl+C received, cancelling deployment...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl+C: {}", e);
            return;
        }
        warn!("Ctrl+C received, cancelling deployment...");
    }

    cancel.cancel();
}
