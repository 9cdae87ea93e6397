//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use postwire_core::PeerConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/postwire/config.toml or /etc/postwire/config.toml.
/// Env overrides: POSTWIRE_LISTEN_PORT, POSTWIRE_PEERS (comma separated),
/// POSTWIRE_LOG, POSTWIRE_ACK_TIMEOUT_MS, POSTWIRE_RESPONSE_TIMEOUT_MS.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP listen port (default 47800).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Peers to ping periodically.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    /// Default log filter when RUST_LOG is unset.
    #[serde(default = "default_log")]
    pub log: String,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Remote addresses tracked at once (default 1024).
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Protocol settings.
    #[serde(default)]
    pub peer: PeerConfig,
}

fn default_listen_port() -> u16 {
    47800
}
fn default_log() -> String {
    "info".to_string()
}
fn default_ping_interval_secs() -> u64 {
    10
}
fn default_max_peers() -> usize {
    crate::transport::DEFAULT_PEER_LIMIT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            peers: Vec::new(),
            log: default_log(),
            ping_interval_secs: default_ping_interval_secs(),
            max_peers: default_max_peers(),
            peer: PeerConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Unparsable values leave the setting unchanged.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("POSTWIRE_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = p;
    }
    if let Some(s) = var("POSTWIRE_PEERS") {
        let peers: Result<Vec<SocketAddr>, _> = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect();
        if let Ok(peers) = peers {
            c.peers = peers;
        }
    }
    if let Some(s) = var("POSTWIRE_LOG") {
        c.log = s;
    }
    if let Some(ms) = var("POSTWIRE_ACK_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
        c.peer.ack_timeout_ms = Some(ms);
    }
    if let Some(ms) = var("POSTWIRE_RESPONSE_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
        c.peer.response_timeout_ms = Some(ms);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/postwire/config.toml"));
    }
    out.push(PathBuf::from("/etc/postwire/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let s = std::fs::read_to_string(&path).ok()?;
    toml::from_str::<Config>(&s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_overrides_defaults() {
        let c: Config = toml::from_str(
            r#"
            listen_port = 5000
            peers = ["127.0.0.1:5001"]

            [peer]
            ack_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.peers, vec!["127.0.0.1:5001".parse::<SocketAddr>().unwrap()]);
        assert_eq!(c.log, "info");
        assert_eq!(c.max_peers, 1024);
        assert_eq!(c.peer.ack_timeout_ms, Some(500));
        assert_eq!(c.peer.response_timeout_ms, None);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("POSTWIRE_LISTEN_PORT", "6000"),
                ("POSTWIRE_PEERS", "127.0.0.1:6001, 127.0.0.1:6002"),
                ("POSTWIRE_LOG", "debug"),
                ("POSTWIRE_RESPONSE_TIMEOUT_MS", "2000"),
            ]),
        );
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.peers.len(), 2);
        assert_eq!(c.log, "debug");
        assert_eq!(c.peer.response_timeout_ms, Some(2000));
        assert_eq!(c.peer.ack_timeout_ms, None);
    }

    #[test]
    fn bad_env_values_ignored() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("POSTWIRE_LISTEN_PORT", "not a port"),
                ("POSTWIRE_PEERS", "127.0.0.1:1,nonsense"),
                ("POSTWIRE_ACK_TIMEOUT_MS", "-5"),
            ]),
        );
        assert_eq!(c, Config::default());
    }
}
