//! Process liveness and signal helpers.

use std::time::{Duration, Instant};

use tokio::process::Child;

#[cfg(unix)]
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

pub const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // kill(pid, 0) checks existence without sending a signal
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // EPERM means the process exists but we can't signal it (different user)
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_pid_alive(pid: u32) -> bool {
    pid == std::process::id()
}

/// Send the platform interrupt signal (SIGINT).
#[cfg(unix)]
pub fn interrupt_pid(pid: u32) {
    if pid == 0 || pid > i32::MAX as u32 {
        return;
    }
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
}

#[cfg(not(unix))]
pub fn interrupt_pid(_pid: u32) {}

#[cfg(unix)]
pub fn kill_pid(pid: u32) {
    if pid == 0 || pid > i32::MAX as u32 {
        return;
    }
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) {}

/// Interrupt a process we do not own, poll for exit every 100 ms, SIGKILL
/// after `grace`. Returns whether the process is gone.
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if !is_pid_alive(pid) {
        return true;
    }
    interrupt_pid(pid);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
    }
    kill_pid(pid);
    tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
    !is_pid_alive(pid)
}

/// Interrupt our own child, poll every 100 ms for up to `grace`, then kill
/// and reap it. Safe on a child that already exited.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    if !matches!(child.try_wait(), Ok(None)) {
        return;
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            interrupt_pid(pid);
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(None) => tokio::time::sleep(TERMINATE_POLL_INTERVAL).await,
            _ => return,
        }
    }

    tracing::debug!(
        target = "claude_proxy::process",
        pid = ?child.id(),
        "child ignored interrupt, killing"
    );
    let _ = child.start_kill();
    let _ = child.wait().await;
}
