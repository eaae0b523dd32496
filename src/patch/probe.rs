//! `<target> --version` probing and platform re-signing.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
pub const REASON_LIMIT: usize = 240;
const SPAWN_ATTEMPTS: u32 = 3;

/// Outcome of one `--version` run. Spawn failures and timeouts are
/// reported as unsuccessful probes with the error as output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout followed by stderr, lossily decoded.
    pub output: String,
}

impl ProbeOutput {
    pub fn version(&self) -> Option<String> {
        extract_version(&self.output)
    }

    /// Combined output (or the exit code when silent), at most 240 chars.
    pub fn failure_reason(&self) -> String {
        let text = self.output.trim();
        if text.is_empty() {
            return match self.code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            };
        }
        truncate_reason(text)
    }
}

pub fn truncate_reason(text: &str) -> String {
    text.trim().chars().take(REASON_LIMIT).collect()
}

#[cfg(unix)]
fn is_text_busy(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_busy(_err: &std::io::Error) -> bool {
    false
}

/// Run `<target> --version`, retrying the spawn while the executable is
/// still busy from being rewritten.
pub async fn probe_version(target: &Path, timeout: Duration) -> ProbeOutput {
    let mut attempt = 1;
    let child = loop {
        let spawned = Command::new(target)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => break child,
            Err(err) if is_text_busy(&err) && attempt < SPAWN_ATTEMPTS => {
                tracing::debug!(target = "claude_proxy::patch", attempt, "executable busy, retrying probe");
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(err) => {
                return ProbeOutput {
                    success: false,
                    code: None,
                    output: format!("failed to run {} --version: {err}", target.display()),
                }
            }
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            ProbeOutput {
                success: out.status.success(),
                code: out.status.code(),
                output,
            }
        }
        Ok(Err(err)) => ProbeOutput {
            success: false,
            code: None,
            output: format!("waiting for {} --version: {err}", target.display()),
        },
        Err(_) => ProbeOutput {
            success: false,
            code: None,
            output: format!("{} --version timed out after {timeout:?}", target.display()),
        },
    }
}

fn version_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"\d+\.\d+\.\d+", r"\d+\.\d+"]
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// First `N.N.N`, else `N.N`, else the first whitespace-separated token.
pub fn extract_version(output: &str) -> Option<String> {
    for pattern in version_patterns() {
        if let Some(found) = pattern.find(output) {
            return Some(found.as_str().to_string());
        }
    }
    output.split_whitespace().next().map(str::to_string)
}

/// Ad-hoc re-sign a rewritten binary so the kernel accepts it again.
/// Only macOS needs this; elsewhere it does nothing.
pub async fn resign_adhoc(path: &Path) {
    if !cfg!(target_os = "macos") {
        return;
    }
    let status = Command::new("codesign")
        .args(["--force", "--sign", "-", "--timestamp=none"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {
            tracing::debug!(target = "claude_proxy::patch", path = %path.display(), "re-signed binary");
        }
        Ok(status) => {
            tracing::warn!(target = "claude_proxy::patch", path = %path.display(), %status, "codesign failed");
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(target = "claude_proxy::patch", "codesign not found, skipping re-sign");
        }
        Err(err) => {
            tracing::warn!(target = "claude_proxy::patch", error = %err, "codesign could not run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_extraction_prefers_semver() {
        assert_eq!(extract_version("2.1.3 (Claude Code)").as_deref(), Some("2.1.3"));
        assert_eq!(extract_version("claude v10.4 beta").as_deref(), Some("10.4"));
        assert_eq!(extract_version("  nightly-abc build").as_deref(), Some("nightly-abc"));
        assert_eq!(extract_version("   "), None);
    }

    #[test]
    fn reasons_are_truncated_on_char_boundaries() {
        let long = "é".repeat(300);
        let reason = truncate_reason(&long);
        assert_eq!(reason.chars().count(), REASON_LIMIT);

        let silent = ProbeOutput {
            success: false,
            code: Some(3),
            output: "  ".into(),
        };
        assert_eq!(silent.failure_reason(), "exit status 3");
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_captures_output_and_status() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = script(tmp.path(), r#"echo "2.1.0 (Claude Code)""#);
        let probe = probe_version(&ok, PROBE_TIMEOUT).await;
        assert!(probe.success);
        assert_eq!(probe.version().as_deref(), Some("2.1.0"));

        let bad = script(tmp.path(), "echo 'boom: broken' >&2; exit 3");
        let probe = probe_version(&bad, PROBE_TIMEOUT).await;
        assert!(!probe.success);
        assert_eq!(probe.code, Some(3));
        assert_eq!(probe.failure_reason(), "boom: broken");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let slow = script(tmp.path(), "exec sleep 10");
        let probe = probe_version(&slow, Duration::from_millis(200)).await;
        assert!(!probe.success);
        assert!(probe.output.contains("timed out"), "{}", probe.output);
    }

    #[tokio::test]
    async fn missing_binary_is_failed_probe() {
        let probe = probe_version(Path::new("/nonexistent/claude"), PROBE_TIMEOUT).await;
        assert!(!probe.success);
        assert!(probe.output.contains("failed to run"));
    }
}
