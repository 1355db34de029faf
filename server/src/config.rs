use std::env;
use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;

/// Environment variable naming the signing key file.
pub const ENV_SECRET_KEY_FILE: &str = "NIX_SECRET_KEY_FILE";

/// Environment variable overriding the upstream cache list.
pub const ENV_UPSTREAM_CACHES: &str = "NIX_UPSTREAM_CACHES";

/// Loads the configuration, applying environment overrides.
///
/// A missing config file is not an error; defaults are used instead.
pub async fn load(config_path: Option<&Path>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) if path.is_file() => toml::from_str(&read_to_string(path)?)?,
        _ => Config::default(),
    };

    config.apply_env();

    Ok(config)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// The local Nix store directory.
    #[serde(rename = "store-dir", default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Priority advertised in `/nix-cache-info`.
    ///
    /// A lower number denotes a higher priority; <https://cache.nixos.org>
    /// advertises 40.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Upstream caches to pull missing paths from, in probe order.
    ///
    /// An empty list disables pull-through entirely.
    #[serde(rename = "upstream-caches", default = "default_upstream_caches")]
    pub upstream_caches: Vec<String>,

    /// File whose trimmed contents are the signing keypair.
    ///
    /// When unset, upstream signatures are forwarded verbatim instead.
    #[serde(rename = "secret-key-file", default)]
    pub secret_key_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen_address(),
            store_dir: default_store_dir(),
            priority: default_priority(),
            upstream_caches: default_upstream_caches(),
            secret_key_file: None,
        }
    }
}

impl Config {
    /// Applies `NIX_SECRET_KEY_FILE` and `NIX_UPSTREAM_CACHES`.
    ///
    /// The environment wins over the config file. An upstream list that
    /// is set but empty yields no upstreams at all.
    fn apply_env(&mut self) {
        if let Ok(path) = env::var(ENV_SECRET_KEY_FILE) {
            if !path.is_empty() {
                self.secret_key_file = Some(PathBuf::from(path));
            }
        }

        if let Ok(caches) = env::var(ENV_UPSTREAM_CACHES) {
            self.upstream_caches = caches
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}

fn default_listen_address() -> SocketAddr {
    "0.0.0.0:5000".parse().unwrap()
}

fn default_store_dir() -> PathBuf {
    "/nix/store".into()
}

fn default_priority() -> i32 {
    30
}

fn default_upstream_caches() -> Vec<String> {
    vec!["https://cache.nixos.org".to_string()]
}
