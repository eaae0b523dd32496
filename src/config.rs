//! Persisted configuration: profiles, live instances and the patch-failure ledger.
//!
//! The document lives at `<config dir>/claude-proxy/config.json` and is shared
//! by every running `claude-proxy` process. Treat each [`ConfigStore::load`]
//! as a snapshot; modifications go through [`ConfigStore::update`] so they
//! happen under the cross-process lock.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::{JsonStore, Versioned};

pub const CONFIG_VERSION: u32 = 1;
pub const APP_DIR_NAME: &str = "claude-proxy";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CONFIG_DIR_ENV: &str = "CLAUDE_PROXY_CONFIG_DIR";

/// A named SSH destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub ssh_args: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Build a profile with a fresh random id.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        ssh_args: Vec<String>,
    ) -> Self {
        Self {
            id: new_profile_id(),
            name: name.into(),
            host: host.into(),
            port,
            user: user.into(),
            ssh_args,
            created_at: Utc::now(),
        }
    }
}

/// 16 random bytes rendered as lowercase hex.
pub fn new_profile_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

/// A running proxy stack owned by some `claude-proxy` process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub profile_id: String,
    pub http_port: u16,
    pub socks_port: u16,
    /// The supervising `claude-proxy` process, not the ssh child.
    pub daemon_pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Suppression key recorded when a patched CLI failed its probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchFailure {
    pub proxy_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_version: Option<String>,
    pub claude_path: String,
    #[serde(default, rename = "claudeSha256", skip_serializing_if = "Option::is_none")]
    pub claude_sha256: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

impl PatchFailure {
    fn matches(&self, proxy_version: &str, cli_version: Option<&str>, cli_sha: Option<&str>) -> bool {
        if self.proxy_version != proxy_version {
            return false;
        }
        let version_hit = matches!(
            (self.claude_version.as_deref(), cli_version),
            (Some(a), Some(b)) if a == b
        );
        let sha_hit = matches!(
            (self.claude_sha256.as_deref(), cli_sha),
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b)
        );
        version_hit || sha_hit
    }
}

/// The root persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub proxy_enabled: Option<bool>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub patch_failures: Vec<PatchFailure>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            proxy_enabled: None,
            profiles: Vec::new(),
            instances: Vec::new(),
            patch_failures: Vec::new(),
        }
    }
}

impl Versioned for Config {
    const CURRENT_VERSION: u32 = CONFIG_VERSION;

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }
}

impl Config {
    /// Look a profile up by exact id, then by case-insensitive name.
    pub fn find_profile(&self, key: &str) -> Option<&Profile> {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        self.profiles.iter().find(|p| p.id == key).or_else(|| {
            let folded = key.to_lowercase();
            self.profiles
                .iter()
                .find(|p| p.name.to_lowercase() == folded)
        })
    }

    /// Insert or replace the profile with the same id.
    pub fn upsert_profile(&mut self, profile: Profile) {
        match self.profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    pub fn instances_for_profile(&self, profile_id: &str) -> Vec<&Instance> {
        self.instances
            .iter()
            .filter(|inst| inst.profile_id == profile_id)
            .collect()
    }

    pub fn find_instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|inst| inst.id == id)
    }

    /// Insert or replace the instance with the same id.
    pub fn upsert_instance(&mut self, instance: Instance) {
        match self.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance,
            None => self.instances.push(instance),
        }
    }

    /// Remove every instance with `id`. Returns whether anything was removed.
    pub fn remove_instance(&mut self, id: &str) -> bool {
        let before = self.instances.len();
        self.instances.retain(|inst| inst.id != id);
        self.instances.len() != before
    }

    /// Whether a failure is recorded for this proxy version and either the
    /// CLI version or the CLI content hash.
    pub fn has_patch_failure(
        &self,
        proxy_version: &str,
        cli_version: Option<&str>,
        cli_sha: Option<&str>,
    ) -> bool {
        self.patch_failures
            .iter()
            .any(|f| f.matches(proxy_version, cli_version, cli_sha))
    }

    /// Insert a failure, replacing any entry with the same suppression key.
    pub fn upsert_patch_failure(&mut self, failure: PatchFailure) {
        let key_version = failure.claude_version.clone();
        let key_sha = failure.claude_sha256.clone();
        self.patch_failures.retain(|f| {
            !(f.proxy_version == failure.proxy_version
                && f.claude_version == key_version
                && f.claude_sha256 == key_sha)
        });
        self.patch_failures.push(failure);
    }
}

/// Default config directory: `$CLAUDE_PROXY_CONFIG_DIR`, else
/// `<user config dir>/claude-proxy`.
pub fn default_config_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_DIR_NAME))
}

/// Handle on the config file. Cheap to clone; holds only the path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: JsonStore<Config>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonStore::new(path),
        }
    }

    /// Store at `<dir>/config.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Directory holding the config file (and the patch history).
    pub fn dir(&self) -> PathBuf {
        self.path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        self.inner.load()
    }

    pub fn save(&self, cfg: &Config) -> Result<(), ConfigError> {
        self.inner.save(cfg)
    }

    pub fn update<R>(&self, mutate: impl FnOnce(&mut Config) -> R) -> Result<R, ConfigError> {
        self.inner.update(mutate)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn profile(id: &str, name: &str) -> Profile {
        Profile {
            id: id.to_string(),
            name: name.to_string(),
            host: "example.com".into(),
            port: 22,
            user: "dev".into(),
            ssh_args: vec!["-i".into(), "~/.ssh/id_ed25519".into()],
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    fn instance(id: &str, profile_id: &str) -> Instance {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        Instance {
            id: id.to_string(),
            profile_id: profile_id.to_string(),
            http_port: 40001,
            socks_port: 40002,
            daemon_pid: 4242,
            started_at: at,
            last_seen_at: at,
        }
    }

    #[test]
    fn find_profile_by_id_and_case_insensitive_name() {
        let mut cfg = Config::default();
        cfg.upsert_profile(profile("aa11", "Work"));
        cfg.upsert_profile(profile("bb22", "Home"));

        for p in cfg.profiles.clone() {
            assert_eq!(cfg.find_profile(&p.id), Some(&p));
            assert_eq!(cfg.find_profile(&p.name), Some(&p));
            assert_eq!(cfg.find_profile(&p.name.to_uppercase()), Some(&p));
        }
        assert_eq!(cfg.find_profile("nope"), None);
        assert_eq!(cfg.find_profile("  "), None);
    }

    #[test]
    fn upsert_profile_replaces_by_id() {
        let mut cfg = Config::default();
        cfg.upsert_profile(profile("aa11", "Work"));
        let mut renamed = profile("aa11", "Office");
        renamed.port = 2222;
        cfg.upsert_profile(renamed);

        assert_eq!(cfg.profiles.len(), 1);
        assert_eq!(cfg.profiles[0].name, "Office");
        assert_eq!(cfg.profiles[0].port, 2222);
    }

    #[test]
    fn instance_upsert_and_remove() {
        let mut cfg = Config::default();
        cfg.upsert_instance(instance("i1", "p1"));
        cfg.upsert_instance(instance("i2", "p2"));
        cfg.upsert_instance(instance("i1", "p1"));

        let for_p1 = cfg.instances_for_profile("p1");
        assert_eq!(for_p1.len(), 1);
        assert_eq!(for_p1[0].id, "i1");

        assert!(cfg.remove_instance("i1"));
        assert!(!cfg.remove_instance("i1"));
        assert!(cfg.find_instance("i1").is_none());
        assert!(cfg.find_instance("i2").is_some());
    }

    #[test]
    fn patch_failure_matches_version_or_sha() {
        let mut cfg = Config::default();
        cfg.upsert_patch_failure(PatchFailure {
            proxy_version: "0.4.0".into(),
            claude_version: Some("2.1.3".into()),
            claude_path: "/usr/local/bin/claude".into(),
            claude_sha256: None,
            failed_at: Utc::now(),
            reason: "exit status 1".into(),
        });
        cfg.upsert_patch_failure(PatchFailure {
            proxy_version: "0.4.0".into(),
            claude_version: None,
            claude_path: "/opt/claude".into(),
            claude_sha256: Some("ABCDEF".into()),
            failed_at: Utc::now(),
            reason: "exit status 2".into(),
        });

        assert!(cfg.has_patch_failure("0.4.0", Some("2.1.3"), None));
        assert!(cfg.has_patch_failure("0.4.0", None, Some("abcdef")));
        assert!(!cfg.has_patch_failure("0.5.0", Some("2.1.3"), None));
        assert!(!cfg.has_patch_failure("0.4.0", Some("2.1.4"), Some("000")));
    }

    #[test]
    fn upsert_patch_failure_overwrites_same_key() {
        let mut cfg = Config::default();
        for reason in ["first", "second"] {
            cfg.upsert_patch_failure(PatchFailure {
                proxy_version: "0.4.0".into(),
                claude_version: Some("2.1.3".into()),
                claude_path: "/usr/local/bin/claude".into(),
                claude_sha256: None,
                failed_at: Utc::now(),
                reason: reason.into(),
            });
        }
        assert_eq!(cfg.patch_failures.len(), 1);
        assert_eq!(cfg.patch_failures[0].reason, "second");
    }

    #[test]
    fn save_load_roundtrip_preserves_document() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::in_dir(tmp.path());

        let mut cfg = Config {
            proxy_enabled: Some(true),
            ..Config::default()
        };
        cfg.upsert_profile(profile("aa11", "Work"));
        cfg.upsert_instance(instance("i1", "aa11"));
        store.save(&cfg).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, cfg);
        store.save(&loaded).unwrap();
        assert_eq!(store.load().unwrap(), cfg);
    }

    #[test]
    fn on_disk_field_names_are_camel_case() {
        let mut cfg = Config::default();
        cfg.upsert_profile(profile("aa11", "Work"));
        cfg.upsert_instance(instance("i1", "aa11"));
        let json = serde_json::to_value(&cfg).unwrap();

        assert_eq!(json["version"], 1);
        assert!(json["proxyEnabled"].is_null());
        assert_eq!(json["profiles"][0]["sshArgs"][0], "-i");
        assert!(json["profiles"][0]["createdAt"].is_string());
        assert_eq!(json["instances"][0]["profileId"], "aa11");
        assert_eq!(json["instances"][0]["httpPort"], 40001);
        assert_eq!(json["instances"][0]["socksPort"], 40002);
        assert_eq!(json["instances"][0]["daemonPid"], 4242);
        assert!(json["instances"][0]["lastSeenAt"].is_string());
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let cfg: Config = serde_json::from_str(r#"{"version":1}"#).unwrap();
        assert!(cfg.profiles.is_empty());
        assert!(cfg.instances.is_empty());
        assert!(cfg.patch_failures.is_empty());
        assert_eq!(cfg.proxy_enabled, None);
    }

    #[test]
    fn profile_ids_are_32_hex_chars_and_distinct() {
        let a = new_profile_id();
        let b = new_profile_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
