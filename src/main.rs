use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, ExitStatus};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use claude_proxy::build_info;
use claude_proxy::patch::PatchOutcome;
use claude_proxy::run::{resume_args, RunRequest, Runtime};
use claude_proxy::supervisor::{cancellation, CancelTrigger};

const LOG_ENV: &str = "CLAUDE_PROXY_LOG";

#[derive(Debug, Parser)]
#[command(name = "claude-proxy", version)]
#[command(about = "Run the Claude CLI through an SSH-tunneled local proxy")]
struct Cli {
    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Launch claude behind the proxy.
    Run(LaunchArgs),
    /// Resume a session (`--resume SESSION`, or `--continue` without one).
    Resume {
        session: Option<String>,
        #[command(flatten)]
        launch: LaunchArgs,
    },
    #[command(subcommand)]
    Profile(ProfileCommand),
    #[command(subcommand)]
    Instances(InstancesCommand),
    /// Turn the proxy on or off, or show its state.
    Proxy {
        #[arg(value_enum)]
        action: ProxyAction,
    },
    #[command(subcommand)]
    Patch(PatchCommand),
}

#[derive(Debug, clap::Args)]
struct LaunchArgs {
    /// Profile id or name.
    #[arg(long)]
    profile: Option<String>,
    /// Path to the claude binary.
    #[arg(long)]
    claude: Option<PathBuf>,
    #[arg(long)]
    no_patch: bool,
    /// Never prompt for ssh passwords or host keys.
    #[arg(long)]
    batch: bool,
    /// Arguments passed through to claude.
    #[arg(last = true)]
    args: Vec<String>,
}

impl LaunchArgs {
    fn into_request(self, args: Vec<String>) -> RunRequest {
        RunRequest {
            profile: self.profile,
            claude: self.claude,
            no_patch: self.no_patch,
            batch: self.batch,
            args,
        }
    }
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    /// Add an SSH profile.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 22)]
        port: u16,
        #[arg(long)]
        user: String,
        /// Extra ssh arguments as one shell-quoted string.
        #[arg(long, allow_hyphen_values = true)]
        ssh_args: Option<String>,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum InstancesCommand {
    List,
    /// Stop the process owning an instance.
    Stop { id: String },
    /// Drop records whose owning process is gone.
    Prune,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProxyAction {
    On,
    Off,
    Status,
}

#[derive(Debug, Subcommand)]
enum PatchCommand {
    /// Patch the claude binary now.
    Apply {
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// Put the original claude binary back.
    Restore {
        #[arg(long)]
        target: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log_file.as_deref()) {
        eprintln!("claude-proxy: {err:#}");
        return ExitCode::FAILURE;
    }
    tracing::debug!(version = %build_info::long_version(), "starting");

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!("claude-proxy: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Commands) -> Result<ExitCode> {
    let runtime = Runtime::from_env()?;
    match command {
        Commands::Run(launch) => {
            let args = launch.args.clone();
            launch_claude(&runtime, launch.into_request(args)).await
        }
        Commands::Resume { session, launch } => {
            let args = resume_args(session.as_deref(), launch.args.clone());
            launch_claude(&runtime, launch.into_request(args)).await
        }
        Commands::Profile(cmd) => {
            run_profile(&runtime, cmd)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Instances(cmd) => {
            run_instances(&runtime, cmd).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Proxy { action } => {
            run_proxy(&runtime, action)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Patch(cmd) => {
            run_patch(&runtime, cmd).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn launch_claude(runtime: &Runtime, request: RunRequest) -> Result<ExitCode> {
    let (trigger, cancel) = cancellation();
    watch_signals(trigger)?;
    let status = runtime.run(request, &cancel).await?;
    Ok(exit_code(status))
}

/// The child's own code; `128 + signal` when it was killed by one.
fn exit_code(status: ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        return ExitCode::from(code.clamp(0, 255) as u8);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitCode::from((128 + signal).clamp(0, 255) as u8);
        }
    }
    ExitCode::FAILURE
}

/// SIGINT belongs to the foreground CLI and is ignored here; SIGTERM and
/// SIGHUP cancel the run.
fn watch_signals(trigger: CancelTrigger) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interrupt.recv() => {
                        tracing::debug!("ignoring SIGINT, the CLI handles it");
                    }
                    _ = terminate.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                        trigger.cancel();
                    }
                    _ = hangup.recv() => {
                        tracing::info!("received SIGHUP, shutting down");
                        trigger.cancel();
                    }
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _trigger = trigger;
            while tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("ignoring Ctrl-C, the CLI handles it");
            }
        });
    }
    Ok(())
}

fn run_profile(runtime: &Runtime, cmd: ProfileCommand) -> Result<()> {
    match cmd {
        ProfileCommand::Add {
            name,
            host,
            port,
            user,
            ssh_args,
        } => {
            let profile = runtime.add_profile(&name, &host, port, &user, ssh_args.as_deref())?;
            println!("added profile {} ({})", profile.name, profile.id);
        }
        ProfileCommand::List => {
            let profiles = runtime.profiles()?;
            if profiles.is_empty() {
                println!("no profiles");
            }
            for p in profiles {
                let extra = if p.ssh_args.is_empty() {
                    String::new()
                } else {
                    format!("  [{}]", p.ssh_args.join(" "))
                };
                println!("{:<16} {}@{}:{}  {}{extra}", p.name, p.user, p.host, p.port, p.id);
            }
        }
    }
    Ok(())
}

async fn run_instances(runtime: &Runtime, cmd: InstancesCommand) -> Result<()> {
    match cmd {
        InstancesCommand::List => {
            let statuses = runtime.instance_statuses().await?;
            if statuses.is_empty() {
                println!("no instances");
                return Ok(());
            }
            println!(
                "{:<34} {:<34} {:>6} {:>6} {:>8} {:<25} ALIVE",
                "ID", "PROFILE", "HTTP", "SOCKS", "PID", "LAST SEEN"
            );
            for s in statuses {
                let inst = &s.instance;
                println!(
                    "{:<34} {:<34} {:>6} {:>6} {:>8} {:<25} {}",
                    inst.id,
                    inst.profile_id,
                    inst.http_port,
                    inst.socks_port,
                    inst.daemon_pid,
                    inst.last_seen_at.to_rfc3339(),
                    if s.alive() { "yes" } else { "no" }
                );
            }
        }
        InstancesCommand::Stop { id } => {
            let inst = runtime.stop_instance(&id).await?;
            println!("stopped instance {} (pid {})", inst.id, inst.daemon_pid);
        }
        InstancesCommand::Prune => {
            let removed = runtime.prune_instances()?;
            println!("removed {} dead instance(s)", removed.len());
        }
    }
    Ok(())
}

fn run_proxy(runtime: &Runtime, action: ProxyAction) -> Result<()> {
    match action {
        ProxyAction::On => runtime.set_proxy_enabled(true)?,
        ProxyAction::Off => runtime.set_proxy_enabled(false)?,
        ProxyAction::Status => {}
    }
    let state = if runtime.proxy_enabled()? { "on" } else { "off" };
    println!("proxy: {state}");
    Ok(())
}

async fn run_patch(runtime: &Runtime, cmd: PatchCommand) -> Result<()> {
    match cmd {
        PatchCommand::Apply { target } => {
            let (path, outcome) = runtime.patch_apply(target.as_deref()).await?;
            print_outcome(&path, &outcome);
        }
        PatchCommand::Restore { target } => match runtime.patch_restore(target.as_deref()).await? {
            (path, Some(backup)) => println!("{}: restored from {}", path.display(), backup.display()),
            (path, None) => println!("{}: no backup to restore", path.display()),
        },
    }
    Ok(())
}

fn print_outcome(path: &Path, outcome: &PatchOutcome) {
    match outcome {
        PatchOutcome::Patched { backup, stats } => println!(
            "{}: patched ({} replacement(s), backup at {})",
            path.display(),
            stats.replacements,
            backup.display()
        ),
        PatchOutcome::Skipped { reason } | PatchOutcome::RolledBack { reason } => {
            println!("{}: {} ({reason})", path.display(), outcome.label())
        }
        PatchOutcome::AlreadyPatched | PatchOutcome::Unchanged => {
            println!("{}: {}", path.display(), outcome.label())
        }
    }
}

/// `CLAUDE_PROXY_LOG`, else `RUST_LOG`, else `warn`.
fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let subscriber = builder.with_ansi(false).with_writer(Mutex::new(file)).finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
    Ok(())
}
