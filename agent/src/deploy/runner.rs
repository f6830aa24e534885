//! Hook runner
//!
//! Executes one lifecycle hook as a child process under its time budget.
//! Injected variables (secrets included) travel through the process
//! environment or the remote shell's stdin, never through argv.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::errors::DeployError;
use crate::models::deployment::{HookSpec, HostId};
use crate::secrets::{AuthContext, ResolvedSecrets};
use crate::utils::{is_env_name, shell_quote};

/// Default cap on captured hook output
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// How long to wait for output pipes to drain after the process exited
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How long a timed out ssh session gets to report the remote kill
const REMOTE_KILL_GRACE: Duration = Duration::from_secs(10);

/// Environment handed to a hook
#[derive(Default)]
pub struct HookEnv {
    vars: BTreeMap<String, String>,
    secrets: ResolvedSecrets,
}

impl HookEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable; `key` must be a valid shell variable name
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self, DeployError> {
        let key = key.into();
        check_env_name(&key)?;
        self.vars.insert(key, value.into());
        Ok(self)
    }

    /// Add resolved secrets under their logical names
    pub fn with_secrets(mut self, secrets: ResolvedSecrets) -> Result<Self, DeployError> {
        for name in secrets.names() {
            check_env_name(name)?;
        }
        self.secrets = secrets;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// All entries with secret values exposed, for process injection only
    fn exposed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(self.secrets.iter().map(|(k, v)| (k, v.expose())))
    }
}

fn check_env_name(name: &str) -> Result<(), DeployError> {
    if is_env_name(name) {
        Ok(())
    } else {
        Err(DeployError::ValidationError(format!(
            "{:?} is not a valid environment variable name",
            name
        )))
    }
}

impl fmt::Debug for HookEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEnv")
            .field("vars", &self.vars)
            .field("secrets", &self.secrets)
            .finish()
    }
}

/// Result of one hook invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutcome {
    /// Exit code; absent when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,

    /// Tail of combined stdout and stderr
    pub truncated_output: String,
}

/// Classified hook outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    Succeeded,
    Failed(Option<i32>),
    TimedOut,
}

impl HookOutcome {
    pub fn status(&self) -> HookStatus {
        if self.timed_out {
            HookStatus::TimedOut
        } else if self.exit_code == Some(0) {
            HookStatus::Succeeded
        } else {
            HookStatus::Failed(self.exit_code)
        }
    }

    pub fn success(&self) -> bool {
        self.status() == HookStatus::Succeeded
    }
}

/// Executes hooks on a host
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Run `hook` on `host`. `Err(HookUnstartable)` when no process could be
    /// spawned; every started process yields an outcome.
    async fn run(
        &self,
        host: &HostId,
        hook: &HookSpec,
        env: &HookEnv,
        auth: &AuthContext,
    ) -> Result<HookOutcome, DeployError>;

    /// Whether distinct host ids reach distinct machines. When false, the
    /// coordinator never runs two host lifecycles at the same time.
    fn isolates_hosts(&self) -> bool {
        true
    }
}

/// Where hook processes are started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HookTransport {
    /// Run on the engine's own machine
    #[default]
    Local,

    /// Run through `ssh <host> sh -s`
    Ssh {
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        identity_file: Option<String>,
    },
}

/// Hook runner backed by child processes
#[derive(Debug, Clone)]
pub struct ProcessHookRunner {
    transport: HookTransport,
    output_limit: usize,
    current_user: Option<String>,
}

impl ProcessHookRunner {
    pub fn new(transport: HookTransport) -> Self {
        Self {
            transport,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            current_user: nix::unistd::User::from_uid(nix::unistd::geteuid())
                .ok()
                .flatten()
                .map(|user| user.name),
        }
    }

    pub fn local() -> Self {
        Self::new(HookTransport::Local)
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit.max(1);
        self
    }

    /// Build the command and the optional stdin script
    fn command(&self, host: &HostId, hook: &HookSpec, env: &HookEnv) -> (Command, Option<String>) {
        match &self.transport {
            HookTransport::Local => {
                let switch_user = hook
                    .run_as
                    .as_deref()
                    .filter(|u| Some(*u) != self.current_user.as_deref());
                let mut cmd = if let Some(target) = switch_user {
                    let mut sudo = Command::new("sudo");
                    sudo.args(["-n", "-E", "-u", target, "--"]).arg(hook.program());
                    sudo
                } else {
                    Command::new(hook.program())
                };
                cmd.args(hook.args());
                for (key, value) in env.exposed() {
                    cmd.env(key, value);
                }
                (cmd, None)
            }
            HookTransport::Ssh {
                user,
                port,
                identity_file,
            } => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes", "-T"]);
                if let Some(port) = port {
                    cmd.arg("-p").arg(port.to_string());
                }
                if let Some(identity) = identity_file {
                    cmd.arg("-i").arg(identity);
                }
                if let Some(user) = user {
                    cmd.arg("-l").arg(user);
                }
                cmd.arg(host.as_str()).args(["sh", "-s"]);

                let switch_user = hook.run_as.as_deref().filter(|u| Some(*u) != user.as_deref());
                (cmd, Some(remote_script(hook, env, switch_user)))
            }
        }
    }

    fn is_remote(&self) -> bool {
        !matches!(self.transport, HookTransport::Local)
    }

    fn collect_output(
        &self,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) -> (tokio::task::JoinHandle<()>, Arc<Mutex<TailBuffer>>) {
        let buffer = Arc::new(Mutex::new(TailBuffer::new(self.output_limit)));
        let out = buffer.clone();
        let err = buffer.clone();
        let handle = tokio::spawn(async move {
            tokio::join!(drain(stdout, out), drain(stderr, err));
        });
        (handle, buffer)
    }
}

#[async_trait]
impl HookRunner for ProcessHookRunner {
    async fn run(
        &self,
        host: &HostId,
        hook: &HookSpec,
        env: &HookEnv,
        auth: &AuthContext,
    ) -> Result<HookOutcome, DeployError> {
        let (mut cmd, script) = self.command(host, hook, env);
        cmd.stdin(if script.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            host = %host,
            phase = %hook.phase,
            hook = %hook.display_command(),
            auth = auth.label(),
            "Starting hook"
        );
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            DeployError::HookUnstartable(format!("{}: {}", hook.display_command(), e))
        })?;

        if let Some(script) = script {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(script.as_bytes()).await {
                    warn!(host = %host, "Failed to write hook script to remote shell: {}", e);
                }
            }
        }

        let (drain_handle, buffer) = self.collect_output(child.stdout.take(), child.stderr.take());

        let (exit_code, timed_out) = match tokio::time::timeout(hook.timeout(), child.wait()).await {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                warn!(
                    host = %host,
                    phase = %hook.phase,
                    hook = %hook.display_command(),
                    "Hook exceeded {}s, terminating process tree",
                    hook.timeout_secs
                );
                if self.is_remote()
                    && tokio::time::timeout(REMOTE_KILL_GRACE, child.wait()).await.is_err()
                {
                    warn!(host = %host, "Remote session did not end after the remote kill, dropping it");
                }
                terminate_tree(&mut child).await;
                (None, true)
            }
        };

        if tokio::time::timeout(PIPE_DRAIN_GRACE, drain_handle).await.is_err() {
            debug!(host = %host, "Hook output pipes still open after exit, using partial output");
        }
        let duration_ms = started.elapsed().as_millis() as u64;
        let truncated_output = buffer
            .lock()
            .map(|b| b.render())
            .unwrap_or_default();

        Ok(HookOutcome {
            exit_code,
            timed_out,
            duration_ms,
            truncated_output,
        })
    }

    fn isolates_hosts(&self) -> bool {
        self.is_remote()
    }
}

/// Kill the child's whole process group, then reap it
async fn terminate_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Script fed to `sh -s` on the remote host.
///
/// Killing the local ssh client leaves the remote command running, so the
/// hook runs under the host's own `timeout`, which kills its process group
/// when the budget runs out.
fn remote_script(hook: &HookSpec, env: &HookEnv, switch_user: Option<&str>) -> String {
    let mut script = String::from("set -e\n");
    for (key, value) in env.exposed() {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    script.push_str("exec ");
    if let Some(user) = switch_user {
        script.push_str(&format!("sudo -n -E -u {} -- ", shell_quote(user)));
    }
    script.push_str(&format!("timeout -s KILL {} ", hook.timeout_secs));
    let command: Vec<String> = hook.command.iter().map(|part| shell_quote(part)).collect();
    script.push_str(&command.join(" "));
    script.push('\n');
    script
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, buffer: Arc<Mutex<TailBuffer>>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.push(&chunk[..n]);
                }
            }
        }
    }
}

/// Keeps the last `limit` bytes written to it
#[derive(Debug)]
struct TailBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.limit {
            let excess = self.data.len() - self.limit;
            self.data.drain(..excess);
            self.truncated = true;
        }
    }

    fn render(&self) -> String {
        let text = String::from_utf8_lossy(&self.data);
        if self.truncated {
            format!("[output truncated]\n{}", text)
        } else {
            text.into_owned()
        }
    }
}
