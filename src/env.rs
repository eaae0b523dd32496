//! Proxy environment for the child CLI.

use std::collections::HashSet;

/// Hosts that must never go through the tunnel.
pub const LOOPBACK_NO_PROXY: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

const PROXY_KEYS: [&str; 4] = ["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy"];
const NO_PROXY_KEYS: [&str; 2] = ["NO_PROXY", "no_proxy"];

/// `http://127.0.0.1:<port>`
pub fn proxy_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

/// Merge existing `NO_PROXY` values with the loopback hosts.
///
/// Prior entries keep their order and spelling; duplicates are dropped
/// case-insensitively; loopback hosts are appended when missing.
pub fn merge_no_proxy<'a>(existing: impl IntoIterator<Item = &'a str>) -> String {
    let mut seen = HashSet::new();
    let mut merged: Vec<&str> = Vec::new();

    let prior = existing.into_iter().flat_map(|value| value.split(','));
    for entry in prior.chain(LOOPBACK_NO_PROXY) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if seen.insert(entry.to_lowercase()) {
            merged.push(entry);
        }
    }
    merged.join(",")
}

/// Variables to set on the child, given a lookup into the current
/// environment. The child otherwise inherits the OS environment unchanged.
pub fn proxy_env_overrides(
    port: u16,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(String, String)> {
    let url = proxy_url(port);
    let prior: Vec<String> = NO_PROXY_KEYS.iter().filter_map(|k| lookup(k)).collect();
    let no_proxy = merge_no_proxy(prior.iter().map(String::as_str));

    PROXY_KEYS
        .iter()
        .map(|key| (key.to_string(), url.clone()))
        .chain(
            NO_PROXY_KEYS
                .iter()
                .map(|key| (key.to_string(), no_proxy.clone())),
        )
        .collect()
}

/// [`proxy_env_overrides`] against the real process environment.
pub fn proxy_env_from_os(port: u16) -> Vec<(String, String)> {
    proxy_env_overrides(port, |key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn entries(value: &str) -> Vec<String> {
        value.split(',').map(str::to_string).collect()
    }

    #[test]
    fn empty_input_yields_loopback_hosts() {
        assert_eq!(merge_no_proxy(std::iter::empty()), "localhost,127.0.0.1,::1");
    }

    #[test]
    fn prior_entries_preserved_and_deduplicated() {
        let merged = merge_no_proxy(["corp.internal, LOCALHOST,.example.com", "corp.INTERNAL"]);
        assert_eq!(
            entries(&merged),
            vec!["corp.internal", "LOCALHOST", ".example.com", "127.0.0.1", "::1"]
        );
    }

    #[test]
    fn output_has_no_case_insensitive_duplicates() {
        let merged = merge_no_proxy(["A,a,b,B,127.0.0.1,::1,,  "]);
        let lowered: Vec<String> = entries(&merged).iter().map(|e| e.to_lowercase()).collect();
        let unique: std::collections::HashSet<_> = lowered.iter().collect();
        assert_eq!(unique.len(), lowered.len());
        for host in LOOPBACK_NO_PROXY {
            assert!(lowered.contains(&host.to_string()));
        }
        assert!(lowered.contains(&"a".to_string()));
        assert!(lowered.contains(&"b".to_string()));
    }

    #[test]
    fn overrides_set_all_proxy_variables() {
        let env: HashMap<&str, &str> = HashMap::from([("no_proxy", "internal.dev")]);
        let overrides: HashMap<String, String> =
            proxy_env_overrides(8123, |k| env.get(k).map(|v| v.to_string()))
                .into_iter()
                .collect();

        for key in ["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy"] {
            assert_eq!(overrides[key], "http://127.0.0.1:8123");
        }
        assert_eq!(overrides["NO_PROXY"], "internal.dev,localhost,127.0.0.1,::1");
        assert_eq!(overrides["no_proxy"], overrides["NO_PROXY"]);
    }
}
