//! The ssh child that provides the SOCKS5 dynamic forward.
//!
//! [`Tunnel::start`] returns as soon as ssh is spawned; it does not wait for
//! the forward to listen. A waiter task owns the child and publishes its
//! exit on a watch channel, so any number of tasks can wait for it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::config::Profile;
use crate::error::SshError;
use crate::process;

pub const STDERR_TAIL_BYTES: usize = 8 * 1024;
pub const DEFAULT_SSH_PROGRAM: &str = "ssh";

/// Bounded buffer that keeps the last `capacity` bytes written to it.
#[derive(Debug)]
pub struct TailBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let chunk = if chunk.len() > self.capacity {
            &chunk[chunk.len() - self.capacity..]
        } else {
            chunk
        };
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(chunk);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Buffered bytes as lossy UTF-8, trimmed.
    pub fn text(&self) -> String {
        let (a, b) = self.bytes.as_slices();
        let mut joined = Vec::with_capacity(a.len() + b.len());
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        String::from_utf8_lossy(&joined).trim().to_string()
    }
}

/// Everything needed to launch one tunnel.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub extra_args: Vec<String>,
    pub socks_port: u16,
    /// Adds `-o BatchMode=yes` so ssh never prompts.
    pub batch_mode: bool,
    pub program: PathBuf,
}

impl TunnelOptions {
    pub fn for_profile(profile: &Profile, socks_port: u16, batch_mode: bool) -> Self {
        Self {
            host: profile.host.clone(),
            port: profile.port,
            user: profile.user.clone(),
            extra_args: profile.ssh_args.clone(),
            socks_port,
            batch_mode,
            program: PathBuf::from(DEFAULT_SSH_PROGRAM),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Validate and render the ssh argument vector.
    pub fn to_args(&self) -> Result<Vec<String>, SshError> {
        let host = self.host.trim();
        let user = self.user.trim();
        if host.is_empty() {
            return Err(SshError::InvalidConfig("missing host".into()));
        }
        if user.is_empty() {
            return Err(SshError::InvalidConfig("missing user".into()));
        }
        if self.port == 0 {
            return Err(SshError::InvalidConfig("ssh port must be 1..65535".into()));
        }
        if self.socks_port == 0 {
            return Err(SshError::InvalidConfig("missing SOCKS port".into()));
        }

        let mut args: Vec<String> = [
            "-N",
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "ConnectTimeout=15",
            "-o",
            "ServerAliveInterval=15",
            "-o",
            "ServerAliveCountMax=3",
            "-o",
            "TCPKeepAlive=yes",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push("-p".into());
        args.push(self.port.to_string());
        args.push("-D".into());
        args.push(format!("127.0.0.1:{}", self.socks_port));
        if self.batch_mode {
            args.push("-o".into());
            args.push("BatchMode=yes".into());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(format!("{user}@{host}"));
        Ok(args)
    }
}

/// A running ssh dynamic-forward child.
#[derive(Debug)]
pub struct Tunnel {
    pid: Option<u32>,
    socks_port: u16,
    exit_rx: watch::Receiver<Option<Result<(), SshError>>>,
    kill_tx: mpsc::Sender<()>,
    stderr: Arc<Mutex<TailBuffer>>,
}

impl Tunnel {
    /// Spawn ssh. Does not wait for the SOCKS listener.
    pub fn start(opts: &TunnelOptions) -> Result<Self, SshError> {
        let args = opts.to_args()?;
        let program = opts.program.display().to_string();

        let mut cmd = Command::new(&opts.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Keep ssh out of our foreground process group so a terminal Ctrl-C
        // aimed at the CLI does not tear the tunnel down.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|err| SshError::Spawn {
            program: program.clone(),
            message: err.to_string(),
        })?;
        let pid = child.id();

        tracing::info!(
            target = "claude_proxy::ssh",
            pid = ?pid,
            destination = %format!("{}@{}:{}", opts.user, opts.host, opts.port),
            socks_port = opts.socks_port,
            "ssh tunnel spawned"
        );

        let stderr = Arc::new(Mutex::new(TailBuffer::new(STDERR_TAIL_BYTES)));
        if let Some(mut pipe) = child.stderr.take() {
            let sink = Arc::clone(&stderr);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match pipe.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            tracing::debug!(
                                target = "claude_proxy::ssh",
                                stderr = %String::from_utf8_lossy(&buf[..n]).trim_end(),
                                "ssh stderr"
                            );
                            sink.lock().push(&buf[..n]);
                        }
                    }
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let tail = Arc::clone(&stderr);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.recv() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            // let the stderr reader drain the last bytes
            tokio::time::sleep(Duration::from_millis(50)).await;
            let outcome = match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(SshError::ExitNonZero {
                    code: status.code(),
                    stderr_tail: tail.lock().text(),
                }),
                Err(err) => Err(SshError::ExitNonZero {
                    code: None,
                    stderr_tail: format!("wait failed: {err}"),
                }),
            };
            tracing::info!(target = "claude_proxy::ssh", outcome = ?outcome, "ssh tunnel exited");
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(Self {
            pid,
            socks_port: opts.socks_port,
            exit_rx,
            kill_tx,
            stderr,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    /// Whether ssh has exited.
    pub fn is_done(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Resolves once ssh has exited.
    pub async fn done(&self) {
        let mut rx = self.exit_rx.clone();
        let _ = rx.wait_for(|exit| exit.is_some()).await;
    }

    /// Wait for exit and return ssh's outcome. Idempotent.
    pub async fn wait(&self) -> Result<(), SshError> {
        let mut rx = self.exit_rx.clone();
        let exit = rx
            .wait_for(|exit| exit.is_some())
            .await
            .map(|exit| exit.clone());
        exit.ok().flatten().unwrap_or(Ok(()))
    }

    /// Last bytes ssh wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        self.stderr.lock().text()
    }

    /// Interrupt ssh, then kill it if still running after `grace`.
    pub async fn stop(&self, grace: Duration) {
        if self.is_done() {
            return;
        }
        match self.pid {
            Some(pid) => process::interrupt_pid(pid),
            None => {
                let _ = self.kill_tx.try_send(());
            }
        }
        if tokio::time::timeout(grace, self.done()).await.is_err() {
            tracing::warn!(target = "claude_proxy::ssh", pid = ?self.pid, "ssh ignored interrupt, killing");
            let _ = self.kill_tx.try_send(());
            self.done().await;
        }
    }
}
