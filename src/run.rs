//! Top-level operations behind the command line: launch the CLI through a
//! proxy stack (new or reused) and manage profiles, instances, the proxy
//! toggle and patches.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use crate::build_info;
use crate::config::{default_config_dir, Config, ConfigStore, Instance, Profile};
use crate::error::SupervisorError;
use crate::health::HealthClient;
use crate::patch::history::PatchHistoryStore;
use crate::patch::spec::SpecSet;
use crate::patch::{PatchEngine, PatchOutcome};
use crate::process::{is_pid_alive, terminate_pid};
use crate::registry::{find_reusable_instance, new_instance_id, InstanceRegistry};
use crate::stack::{Stack, StackOptions, DEFAULT_SOCKS_READY_TIMEOUT};
use crate::ssh::DEFAULT_SSH_PROGRAM;
use crate::store;
use crate::supervisor::{Cancellation, Launch, OwnedStack, ProxyLink, Supervisor, SupervisorConfig};

pub const CLAUDE_PATH_ENV: &str = "CLAUDE_PROXY_CLAUDE_PATH";
const CLAUDE_BINARY: &str = "claude";

/// A patched CLI that fails this soon after launch is re-probed for the
/// bad-bytecode marker.
const LAUNCH_FAILURE_WINDOW: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Options shared by `run` and `resume`.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Profile id or name.
    pub profile: Option<String>,
    pub claude: Option<PathBuf>,
    pub no_patch: bool,
    pub batch: bool,
    pub args: Vec<String>,
}

/// Arguments for `resume`: `--resume <id>` or `--continue`, then `extra`.
pub fn resume_args(session: Option<&str>, extra: Vec<String>) -> Vec<String> {
    let mut args = match session.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => vec!["--resume".to_string(), id.to_string()],
        None => vec!["--continue".to_string()],
    };
    args.extend(extra);
    args
}

/// `--profile` when given; otherwise the only profile there is.
pub fn select_profile(cfg: &Config, key: Option<&str>) -> Result<Profile> {
    let names = || {
        cfg.profiles
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    match key {
        Some(key) => cfg
            .find_profile(key)
            .cloned()
            .ok_or_else(|| anyhow!("no profile named '{key}' (available: {})", names())),
        None => match cfg.profiles.as_slice() {
            [only] => Ok(only.clone()),
            [] => bail!("no profiles configured; add one with `claude-proxy profile add`"),
            _ => bail!("several profiles configured, pick one with --profile: {}", names()),
        },
    }
}

/// `--claude`, else `$CLAUDE_PROXY_CLAUDE_PATH`, else `claude` on `PATH`.
pub fn resolve_claude(flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CLAUDE_PATH_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let path_env = std::env::var_os("PATH").unwrap_or_default();
    find_in_path(CLAUDE_BINARY, &path_env).with_context(|| {
        format!("`{CLAUDE_BINARY}` not found on PATH; pass --claude or set {CLAUDE_PATH_ENV}")
    })
}

/// First executable file named `name` in a `PATH`-style list.
pub fn find_in_path(name: &str, path_env: &OsStr) -> Option<PathBuf> {
    let mut names = vec![OsString::from(name)];
    if cfg!(windows) {
        names.push(OsString::from(format!("{name}.exe")));
    }
    std::env::split_paths(path_env)
        .filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| names.iter().map(move |n| dir.join(n)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Liveness of a registry record as shown by `instances list`.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub instance: Instance,
    pub pid_alive: bool,
    pub healthy: bool,
}

impl InstanceStatus {
    pub fn alive(&self) -> bool {
        self.pid_alive && self.healthy
    }
}

/// Everything a command needs: the stores plus runtime tunables.
#[derive(Debug, Clone)]
pub struct Runtime {
    store: ConfigStore,
    history: PatchHistoryStore,
    health: HealthClient,
    supervisor: SupervisorConfig,
    ssh_program: PathBuf,
    socks_ready_timeout: Duration,
}

impl Runtime {
    /// State under `dir` (`config.json` and `patch_history.json`).
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            store: ConfigStore::in_dir(dir),
            history: PatchHistoryStore::in_dir(dir),
            health: HealthClient::default(),
            supervisor: SupervisorConfig::default(),
            ssh_program: PathBuf::from(DEFAULT_SSH_PROGRAM),
            socks_ready_timeout: DEFAULT_SOCKS_READY_TIMEOUT,
        }
    }

    /// State in the default config directory.
    pub fn from_env() -> Result<Self> {
        let dir = default_config_dir().context("cannot determine the user config directory")?;
        Ok(Self::in_dir(&dir))
    }

    pub fn with_supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor = config;
        self
    }

    pub fn with_ssh_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.ssh_program = program.into();
        self
    }

    pub fn with_socks_ready_timeout(mut self, timeout: Duration) -> Self {
        self.socks_ready_timeout = timeout;
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn registry(&self) -> InstanceRegistry {
        InstanceRegistry::new(self.store.clone())
    }

    pub fn patch_engine(&self) -> PatchEngine {
        PatchEngine::new(
            build_info::VERSION,
            self.store.clone(),
            self.history.clone(),
            SpecSet::builtin(),
        )
    }

    /// Launch the CLI with `request.args` behind the proxy and supervise it
    /// to completion. Returns the CLI's own exit status when it exits
    /// first.
    pub async fn run(&self, request: RunRequest, cancel: &Cancellation) -> Result<ExitStatus> {
        let cfg = self.store.load().context("failed to load config")?;
        let profile = match cfg.proxy_enabled {
            Some(false) => None,
            _ => Some(select_profile(&cfg, request.profile.as_deref())?),
        };
        let program = resolve_claude(request.claude.as_deref())?;
        let engine = self.patch_engine();
        let patched = !request.no_patch && self.patch_before_launch(&engine, &program).await;
        let launch = Launch {
            program,
            args: request.args,
        };

        let Some(profile) = profile else {
            tracing::info!(target = "claude_proxy::run", "proxy disabled, launching directly");
            return self.launch(ProxyLink::Direct, &launch, patched.then_some(&engine), cancel).await;
        };

        if let Some(instance) = find_reusable_instance(&cfg.instances, &profile.id, &self.health).await {
            return self
                .launch(ProxyLink::Reused(&instance), &launch, patched.then_some(&engine), cancel)
                .await;
        }

        let mut opts = StackOptions::new(profile.clone(), new_instance_id());
        opts.batch_mode = request.batch;
        opts.ssh_program = self.ssh_program.clone();
        opts.socks_ready_timeout = self.socks_ready_timeout;
        let stack = tokio::select! {
            started = Stack::start(opts) => started
                .with_context(|| format!("failed to start proxy stack for profile '{}'", profile.name))?,
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled.into()),
        };
        tracing::info!(
            target = "claude_proxy::run",
            instance_id = %stack.instance_id(),
            http_port = stack.http_port(),
            socks_port = stack.socks_port(),
            "proxy stack started"
        );

        let owned = OwnedStack::register(stack, &profile.id, self.registry(), self.supervisor.heartbeat_interval)
            .await
            .context("failed to record instance")?;
        let result = self
            .launch(ProxyLink::Owned(owned.stack()), &launch, patched.then_some(&engine), cancel)
            .await;
        owned.shutdown().await;
        result
    }

    /// A failed patch never blocks the launch. Returns whether the target
    /// now carries our patch.
    async fn patch_before_launch(&self, engine: &PatchEngine, program: &Path) -> bool {
        match engine.maybe_patch_executable(program).await {
            Ok(outcome) => {
                tracing::info!(target = "claude_proxy::run", outcome = outcome.label(), "patch check done");
                matches!(outcome, PatchOutcome::Patched { .. } | PatchOutcome::AlreadyPatched)
            }
            Err(err) => {
                tracing::warn!(target = "claude_proxy::run", error = %err, "patching failed, launching unpatched");
                false
            }
        }
    }

    /// Supervise one launch; a patched CLI that dies right away with the
    /// bad-bytecode marker is restored and launched once more.
    async fn launch(
        &self,
        link: ProxyLink<'_>,
        launch: &Launch,
        patched: Option<&PatchEngine>,
        cancel: &Cancellation,
    ) -> Result<ExitStatus> {
        let supervisor = Supervisor::new(self.health.clone(), self.supervisor.clone());
        let started = Instant::now();
        let status = supervisor.run(link, launch, cancel).await?;

        let Some(engine) = patched else {
            return Ok(status);
        };
        if status.success() || started.elapsed() >= LAUNCH_FAILURE_WINDOW || cancel.is_cancelled() {
            return Ok(status);
        }
        match engine.recover_from_launch_failure(&launch.program).await {
            Ok(true) => {
                tracing::warn!(target = "claude_proxy::run", "relaunching with the original binary");
                Ok(supervisor.run(link, launch, cancel).await?)
            }
            Ok(false) => Ok(status),
            Err(err) => {
                tracing::warn!(target = "claude_proxy::run", error = %err, "launch failure check failed");
                Ok(status)
            }
        }
    }

    /// Validate and store a new profile. `ssh_args` is one shell-quoted
    /// string.
    pub fn add_profile(
        &self,
        name: &str,
        host: &str,
        port: u16,
        user: &str,
        ssh_args: Option<&str>,
    ) -> Result<Profile> {
        let name = name.trim();
        let host = host.trim();
        let user = user.trim();
        if name.is_empty() {
            bail!("profile name must not be empty");
        }
        if host.is_empty() || host.contains(char::is_whitespace) {
            bail!("invalid host '{host}'");
        }
        if user.is_empty() || user.contains(char::is_whitespace) {
            bail!("invalid user '{user}'");
        }
        if port == 0 {
            bail!("port must be between 1 and 65535");
        }
        let ssh_args = match ssh_args.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => shlex::split(raw).with_context(|| format!("cannot parse ssh args: {raw}"))?,
            None => Vec::new(),
        };

        let profile = Profile::new(name, host, port, user, ssh_args);
        let stored = profile.clone();
        self.store
            .update(|cfg| {
                if cfg.profiles.iter().any(|p| p.name.eq_ignore_ascii_case(&stored.name)) {
                    return Err(anyhow!("a profile named '{}' already exists", stored.name));
                }
                cfg.upsert_profile(stored);
                Ok(())
            })
            .context("failed to save profile")??;
        Ok(profile)
    }

    pub fn profiles(&self) -> Result<Vec<Profile>> {
        Ok(self.store.load().context("failed to load config")?.profiles)
    }

    /// Every registry record with its PID and health state.
    pub async fn instance_statuses(&self) -> Result<Vec<InstanceStatus>> {
        let instances = self.registry().list().context("failed to load config")?;
        let mut statuses = Vec::with_capacity(instances.len());
        for instance in instances {
            let pid_alive = is_pid_alive(instance.daemon_pid);
            let healthy = pid_alive
                && self
                    .health
                    .check_http_proxy(instance.http_port, &instance.id)
                    .await
                    .is_ok();
            statuses.push(InstanceStatus {
                instance,
                pid_alive,
                healthy,
            });
        }
        Ok(statuses)
    }

    /// Terminate the process owning instance `id` and drop its record.
    pub async fn stop_instance(&self, id: &str) -> Result<Instance> {
        let registry = self.registry();
        let instance = registry
            .list()?
            .into_iter()
            .find(|inst| inst.id == id)
            .ok_or_else(|| anyhow!("no instance with id '{id}'"))?;
        if instance.daemon_pid == std::process::id() {
            bail!("instance {id} belongs to this process");
        }
        if is_pid_alive(instance.daemon_pid) && !terminate_pid(instance.daemon_pid, STOP_GRACE).await {
            tracing::warn!(target = "claude_proxy::run", pid = instance.daemon_pid, "owner still alive after kill");
        }
        let removing = id.to_string();
        store::blocking(move || registry.remove_instance(&removing)).await?;
        Ok(instance)
    }

    pub fn prune_instances(&self) -> Result<Vec<Instance>> {
        self.registry().prune_dead().context("failed to prune instances")
    }

    pub fn set_proxy_enabled(&self, enabled: bool) -> Result<()> {
        self.store
            .update(|cfg| cfg.proxy_enabled = Some(enabled))
            .context("failed to save config")
    }

    /// `proxyEnabled` with unset meaning enabled.
    pub fn proxy_enabled(&self) -> Result<bool> {
        Ok(self.store.load()?.proxy_enabled.unwrap_or(true))
    }

    pub async fn patch_apply(&self, target: Option<&Path>) -> Result<(PathBuf, PatchOutcome)> {
        let target = resolve_claude(target)?;
        let outcome = self
            .patch_engine()
            .maybe_patch_executable(&target)
            .await
            .with_context(|| format!("failed to patch {}", target.display()))?;
        Ok((target, outcome))
    }

    pub async fn patch_restore(&self, target: Option<&Path>) -> Result<(PathBuf, Option<PathBuf>)> {
        let target = resolve_claude(target)?;
        let backup = self
            .patch_engine()
            .restore(&target)
            .await
            .with_context(|| format!("failed to restore {}", target.display()))?;
        Ok((target, backup))
    }
}
