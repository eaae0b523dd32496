//! Error types for every layer of the proxy stack and the patch engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from the persisted JSON stores (config and patch history).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Filesystem failure reading, writing or locking a store file.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not valid JSON for the expected schema.
    #[error("malformed {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The document declares a schema version this build does not know.
    #[error("{path} has unsupported version {found} (max {supported})")]
    VersionUnsupported {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    /// The advisory lock could not be acquired in time.
    #[error("timed out after {waited:?} waiting for lock {path}")]
    LockBusy { path: PathBuf, waited: Duration },

    /// A store operation moved to the blocking pool panicked or was cancelled.
    #[error("store task failed: {0}")]
    Background(String),
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Malformed documents and unknown versions cannot be recovered by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::VersionUnsupported { .. })
    }
}

/// Errors from the ssh tunnel child process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SshError {
    /// The ssh executable could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    /// The profile is missing a host, user or valid port.
    #[error("invalid ssh configuration: {0}")]
    InvalidConfig(String),

    /// ssh exited. `code` is `None` when it was killed by a signal.
    #[error("ssh exited with {}: {stderr_tail}", exit_code_label(.code))]
    ExitNonZero {
        code: Option<i32>,
        stderr_tail: String,
    },
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "signal".to_string(),
    }
}

/// Errors starting or running a proxy stack.
#[derive(Error, Debug)]
pub enum StackError {
    /// No loopback port could be reserved.
    #[error("no free loopback port: {0}")]
    PortUnavailable(#[source] std::io::Error),

    /// The SOCKS listener never came up.
    #[error("ssh SOCKS listener on port {port} not ready after {timeout:?}")]
    TunnelNotReady { port: u16, timeout: Duration },

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Errors from the local HTTP proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to dial upstream {addr}: {source}")]
    DialUpstream {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Self::Bind { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse)
    }
}

/// Health-check failures. Every variant counts as "unhealthy".
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("health endpoint returned HTTP {0}")]
    HttpStatus(u16),

    #[error("health body mismatch: {0}")]
    BodyMismatch(String),

    #[error("health transport error: {0}")]
    Transport(String),
}

/// Errors from the patch engine.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("failed to read {path}: {source}")]
    ReadTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stat {path}: {source}")]
    StatTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pattern in patch '{label}': {source}")]
    InvalidPattern {
        label: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown patch applier '{0}'")]
    UnknownApplier(String),

    /// A stage-3 pattern matched the empty string.
    #[error("patch '{label}' produced an empty match at offset {offset}")]
    EmptyMatch { label: String, offset: usize },

    /// A fixed-length patch changed the size of a block.
    #[error("patch '{label}' changed block length from {before} to {after}")]
    LengthMismatch {
        label: String,
        before: usize,
        after: usize,
    },

    /// Two planned replacements cover the same bytes.
    #[error("patch '{label}' has overlapping replacements at {first} and {second}")]
    Overlap {
        label: String,
        first: usize,
        second: usize,
    },

    #[error("patch history: {0}")]
    HistoryIo(#[source] ConfigError),

    #[error("backup of {path} failed: {source}")]
    BackupIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The patched binary failed its probe. `restored` tells whether the
    /// original bytes were put back.
    #[error("patched binary failed its probe (restored={restored}): {reason}")]
    ProbeFailed { restored: bool, reason: String },
}

/// Errors from the child supervision loop.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to launch {program}: {source}")]
    ChildSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for child: {0}")]
    ChildWait(#[source] std::io::Error),

    #[error("proxy stack failed: {0}")]
    StackFailed(#[source] SshError),

    #[error("proxy unhealthy after {failures} consecutive failed health checks")]
    ProxyUnhealthy { failures: u32 },

    #[error("run cancelled")]
    Cancelled,
}
