//! Build identifiers captured at compile time.
//!
//! These are write-once values; the patch engine receives the version
//! explicitly through its constructor rather than reading it from here.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: Option<&str> = option_env!("CLAUDE_PROXY_COMMIT");
pub const BUILD_DATE: Option<&str> = option_env!("CLAUDE_PROXY_BUILD_DATE");

/// Human-readable version line, e.g. `0.4.0 (abc1234, 2026-01-01)`.
pub fn long_version() -> String {
    match (COMMIT, BUILD_DATE) {
        (Some(commit), Some(date)) => format!("{VERSION} ({commit}, {date})"),
        (Some(commit), None) => format!("{VERSION} ({commit})"),
        _ => VERSION.to_string(),
    }
}
