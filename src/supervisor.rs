//! Runs the target CLI behind the proxy and watches both.
//!
//! One `select!` loop multiplexes child exit, stack death, cancellation and
//! periodic health probes. Whichever fires first decides the outcome; the
//! child is interrupted (then killed after the grace period) on every path
//! that does not start with the child exiting on its own.

use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Instance;
use crate::env::proxy_env_from_os;
use crate::error::{ConfigError, SupervisorError};
use crate::health::HealthClient;
use crate::process::terminate_child;
use crate::registry::InstanceRegistry;
use crate::stack::Stack;
use crate::store;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub health_interval: Duration,
    /// Consecutive failed probes that end the run.
    pub max_health_failures: u32,
    /// How long the child gets between SIGINT and SIGKILL.
    pub grace: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(5),
            max_health_failures: 3,
            grace: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Degraded { failures: u32 },
    Unhealthy { failures: u32 },
}

/// Counts consecutive failed probes; any success resets the count.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    failures: u32,
    max_failures: u32,
}

impl HealthTracker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record(&mut self, healthy: bool) -> HealthVerdict {
        if healthy {
            self.failures = 0;
            return HealthVerdict::Healthy;
        }
        self.failures += 1;
        if self.failures >= self.max_failures {
            HealthVerdict::Unhealthy {
                failures: self.failures,
            }
        } else {
            HealthVerdict::Degraded {
                failures: self.failures,
            }
        }
    }
}

/// Cancellation flag for a run; cloned into whoever needs to observe it.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelTrigger {
    tx: watch::Sender<bool>,
}

pub fn cancellation() -> (CancelTrigger, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger { tx }, Cancellation { rx })
}

impl CancelTrigger {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Cancellation {
    /// A cancellation that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Pends forever if the trigger was dropped
    /// without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The program to run and its arguments.
#[derive(Debug, Clone)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// How the child reaches the network.
#[derive(Debug, Clone, Copy)]
pub enum ProxyLink<'a> {
    /// No proxy; the child inherits the environment untouched.
    Direct,
    /// Share a healthy instance owned by another process.
    Reused(&'a Instance),
    /// A stack this process started.
    Owned(&'a Stack),
}

impl ProxyLink<'_> {
    /// `(http port, instance id)` to probe, if any.
    fn probe_target(&self) -> Option<(u16, String)> {
        match self {
            Self::Direct => None,
            Self::Reused(inst) => Some((inst.http_port, inst.id.clone())),
            Self::Owned(stack) => Some((stack.http_port(), stack.instance_id().to_string())),
        }
    }
}

/// Spawn the target with inherited stdio plus `env` overrides.
pub fn spawn_target(launch: &Launch, env: &[(String, String)]) -> Result<Child, SupervisorError> {
    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let child = cmd.spawn().map_err(|source| SupervisorError::ChildSpawn {
        program: launch.program.display().to_string(),
        source,
    })?;
    tracing::info!(
        target = "claude_proxy::supervisor",
        program = %launch.program.display(),
        pid = ?child.id(),
        "target launched"
    );
    Ok(child)
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    health: HealthClient,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(health: HealthClient, config: SupervisorConfig) -> Self {
        Self { health, config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch the target wired to `link` and supervise it to completion.
    pub async fn run(
        &self,
        link: ProxyLink<'_>,
        launch: &Launch,
        cancel: &Cancellation,
    ) -> Result<ExitStatus, SupervisorError> {
        let env = match link.probe_target() {
            Some((port, _)) => proxy_env_from_os(port),
            None => Vec::new(),
        };
        let mut child = spawn_target(launch, &env)?;
        let stack = match link {
            ProxyLink::Owned(stack) => Some(stack),
            _ => None,
        };
        supervise(
            &mut child,
            link.probe_target(),
            stack,
            &self.health,
            &self.config,
            cancel.cancelled(),
        )
        .await
    }
}

/// Wait for `child` while probing `probe` (port, instance id) every
/// `health_interval`. Returns the child's own status when it exits first.
pub async fn supervise(
    child: &mut Child,
    probe: Option<(u16, String)>,
    stack: Option<&Stack>,
    health: &HealthClient,
    config: &SupervisorConfig,
    cancel: impl Future<Output = ()>,
) -> Result<ExitStatus, SupervisorError> {
    tokio::pin!(cancel);
    let fatal = async {
        match stack {
            Some(stack) => stack.fatal().await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(fatal);

    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.health_interval,
        config.health_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let (result_tx, mut result_rx) = mpsc::channel::<bool>(4);
    let mut tracker = HealthTracker::new(config.max_health_failures);
    let mut probe_in_flight = false;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(SupervisorError::ChildWait)?;
                tracing::info!(target = "claude_proxy::supervisor", status = %status, "target exited");
                return Ok(status);
            }
            err = &mut fatal => {
                tracing::error!(target = "claude_proxy::supervisor", error = %err, "stack failed, stopping target");
                terminate_child(child, config.grace).await;
                return Err(SupervisorError::StackFailed(err));
            }
            _ = &mut cancel => {
                tracing::info!(target = "claude_proxy::supervisor", "run cancelled, stopping target");
                terminate_child(child, config.grace).await;
                return Err(SupervisorError::Cancelled);
            }
            _ = ticker.tick(), if probe.is_some() && !probe_in_flight => {
                if let Some((port, instance_id)) = probe.clone() {
                    probe_in_flight = true;
                    let health = health.clone();
                    let tx = result_tx.clone();
                    tokio::spawn(async move {
                        let outcome = health.check_http_proxy(port, &instance_id).await;
                        if let Err(err) = &outcome {
                            tracing::warn!(
                                target = "claude_proxy::supervisor",
                                port,
                                error = %err,
                                "proxy health check failed"
                            );
                        }
                        let _ = tx.send(outcome.is_ok()).await;
                    });
                }
            }
            Some(healthy) = result_rx.recv() => {
                probe_in_flight = false;
                if let HealthVerdict::Unhealthy { failures } = tracker.record(healthy) {
                    tracing::error!(
                        target = "claude_proxy::supervisor",
                        failures,
                        "proxy unhealthy, stopping target"
                    );
                    terminate_child(child, config.grace).await;
                    return Err(SupervisorError::ProxyUnhealthy { failures });
                }
            }
        }
    }
}

/// Registry bookkeeping for a stack this process started: the instance
/// record and its heartbeat live exactly as long as this value.
pub struct OwnedStack {
    stack: Stack,
    registry: InstanceRegistry,
    heartbeat: JoinHandle<()>,
}

impl OwnedStack {
    /// Record the stack as an instance owned by the current process and
    /// start the heartbeat. The stack is closed if the record cannot be
    /// written.
    pub async fn register(
        stack: Stack,
        profile_id: &str,
        registry: InstanceRegistry,
        heartbeat_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let now = Utc::now();
        let instance = Instance {
            id: stack.instance_id().to_string(),
            profile_id: profile_id.to_string(),
            http_port: stack.http_port(),
            socks_port: stack.socks_port(),
            daemon_pid: std::process::id(),
            started_at: now,
            last_seen_at: now,
        };
        let recorder = registry.clone();
        let recorded = store::blocking(move || recorder.record_instance(instance)).await;
        if let Err(err) = recorded {
            stack.close().await;
            return Err(err);
        }

        let heartbeat = {
            let registry = registry.clone();
            let id = stack.instance_id().to_string();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(
                    Instant::now() + heartbeat_interval,
                    heartbeat_interval,
                );
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let registry = registry.clone();
                    let id = id.clone();
                    if let Err(err) = store::blocking(move || registry.heartbeat(&id, Utc::now())).await {
                        tracing::warn!(target = "claude_proxy::supervisor", error = %err, "heartbeat failed");
                    }
                }
            })
        };

        Ok(Self {
            stack,
            registry,
            heartbeat,
        })
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Stop the heartbeat, drop the instance record and close the stack.
    pub async fn shutdown(self) {
        self.heartbeat.abort();
        let id = self.stack.instance_id().to_string();
        let registry = self.registry.clone();
        let removing = id.clone();
        if let Err(err) = store::blocking(move || registry.remove_instance(&removing)).await {
            tracing::warn!(target = "claude_proxy::supervisor", instance_id = %id, error = %err, "failed to remove instance record");
        }
        self.stack.close().await;
    }
}
