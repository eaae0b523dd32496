//! A proxy stack: ssh tunnel, SOCKS5 dialer and local HTTP proxy, started
//! and stopped as a unit.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::Profile;
use crate::env::proxy_url;
use crate::error::{SshError, StackError};
use crate::ports::{pick_free_port, pick_free_ports};
use crate::proxy::HttpProxy;
use crate::socks::Socks5Dialer;
use crate::ssh::{Tunnel, TunnelOptions, DEFAULT_SSH_PROGRAM};

pub const DEFAULT_SOCKS_READY_TIMEOUT: Duration = Duration::from_secs(15);
const SOCKS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const BIND_ATTEMPTS: usize = 3;
const PROXY_CLOSE_GRACE: Duration = Duration::from_secs(2);
const TUNNEL_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct StackOptions {
    pub profile: Profile,
    pub instance_id: String,
    /// Run ssh with `BatchMode=yes` (no prompts).
    pub batch_mode: bool,
    pub socks_ready_timeout: Duration,
    pub ssh_program: PathBuf,
}

impl StackOptions {
    pub fn new(profile: Profile, instance_id: impl Into<String>) -> Self {
        Self {
            profile,
            instance_id: instance_id.into(),
            batch_mode: false,
            socks_ready_timeout: DEFAULT_SOCKS_READY_TIMEOUT,
            ssh_program: PathBuf::from(DEFAULT_SSH_PROGRAM),
        }
    }
}

pub struct Stack {
    instance_id: String,
    http_port: u16,
    socks_port: u16,
    tunnel: Arc<Tunnel>,
    proxy: HttpProxy,
    fatal_rx: watch::Receiver<Option<SshError>>,
    closing: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("instance_id", &self.instance_id)
            .field("http_port", &self.http_port)
            .field("socks_port", &self.socks_port)
            .field("tunnel_pid", &self.tunnel.pid())
            .finish()
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

impl Stack {
    /// Pick ports, launch ssh, wait for its SOCKS listener, then start the
    /// HTTP proxy in front of it.
    pub async fn start(opts: StackOptions) -> Result<Self, StackError> {
        let ports = pick_free_ports(2).map_err(StackError::PortUnavailable)?;
        let (mut http_port, socks_port) = (ports[0], ports[1]);

        let tunnel_opts = TunnelOptions::for_profile(&opts.profile, socks_port, opts.batch_mode)
            .with_program(opts.ssh_program.clone());
        let tunnel = Arc::new(Tunnel::start(&tunnel_opts)?);

        if let Err(err) = wait_socks_ready(&tunnel, socks_port, opts.socks_ready_timeout).await {
            tunnel.stop(TUNNEL_STOP_GRACE).await;
            return Err(err);
        }

        let dialer = Arc::new(Socks5Dialer::new(loopback(socks_port)));
        let mut attempt = 1;
        let proxy = loop {
            match HttpProxy::start(loopback(http_port), dialer.clone(), opts.instance_id.clone()).await {
                Ok(proxy) => break proxy,
                Err(err) if err.is_addr_in_use() && attempt < BIND_ATTEMPTS => {
                    tracing::debug!(
                        target = "claude_proxy::stack",
                        port = http_port,
                        attempt,
                        "http port taken, picking another"
                    );
                    attempt += 1;
                    http_port = match pick_free_port() {
                        Ok(port) => port,
                        Err(err) => {
                            tunnel.stop(TUNNEL_STOP_GRACE).await;
                            return Err(StackError::PortUnavailable(err));
                        }
                    };
                }
                Err(err) => {
                    tunnel.stop(TUNNEL_STOP_GRACE).await;
                    return Err(err.into());
                }
            }
        };

        let closing = Arc::new(AtomicBool::new(false));
        let (fatal_tx, fatal_rx) = watch::channel(None);
        {
            let tunnel = Arc::clone(&tunnel);
            let closing = Arc::clone(&closing);
            tokio::spawn(async move {
                let outcome = tunnel.wait().await;
                if closing.load(Ordering::SeqCst) {
                    return;
                }
                let err = outcome.err().unwrap_or_else(|| SshError::ExitNonZero {
                    code: Some(0),
                    stderr_tail: tunnel.stderr_tail(),
                });
                tracing::error!(target = "claude_proxy::stack", error = %err, "ssh tunnel died");
                let _ = fatal_tx.send(Some(err));
            });
        }

        tracing::info!(
            target = "claude_proxy::stack",
            instance_id = %opts.instance_id,
            http_port,
            socks_port,
            "proxy stack ready"
        );

        Ok(Self {
            instance_id: opts.instance_id,
            http_port,
            socks_port,
            tunnel,
            proxy,
            fatal_rx,
            closing,
            closed: AtomicBool::new(false),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    pub fn http_proxy_url(&self) -> String {
        proxy_url(self.http_port)
    }

    pub fn tunnel_pid(&self) -> Option<u32> {
        self.tunnel.pid()
    }

    /// Resolves with the tunnel's error if ssh dies while the stack is up.
    /// Never resolves once [`Stack::close`] has begun.
    pub async fn fatal(&self) -> SshError {
        let mut rx = self.fatal_rx.clone();
        let fatal = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match fatal {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    /// Close the HTTP proxy, then stop the tunnel. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.store(true, Ordering::SeqCst);
        self.proxy.close(PROXY_CLOSE_GRACE).await;
        self.tunnel.stop(TUNNEL_STOP_GRACE).await;
        tracing::info!(target = "claude_proxy::stack", instance_id = %self.instance_id, "proxy stack closed");
    }
}

async fn wait_socks_ready(tunnel: &Tunnel, port: u16, timeout: Duration) -> Result<(), StackError> {
    let deadline = Instant::now() + timeout;
    loop {
        if tunnel.is_done() {
            let err = tunnel.wait().await.err().unwrap_or_else(|| SshError::ExitNonZero {
                code: Some(0),
                stderr_tail: tunnel.stderr_tail(),
            });
            return Err(err.into());
        }
        if TcpStream::connect(loopback(port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(StackError::TunnelNotReady { port, timeout });
        }
        tokio::select! {
            _ = tokio::time::sleep(SOCKS_POLL_INTERVAL) => {}
            _ = tunnel.done() => {}
        }
    }
}
