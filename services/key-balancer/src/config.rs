//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Upstream API keys are resolved from the UPSTREAM_API_KEYS env var, then
//! api_keys_file, then the inline api_keys list, and are held as secrets from
//! that point on.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Env var holding a comma-separated list of upstream keys.
const KEYS_ENV: &str = "UPSTREAM_API_KEYS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream API and key pool settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Requests per minute allowed for each key.
    pub rate_limit: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Inline keys. Only used when neither the env var nor the keys file
    /// supplies any.
    #[serde(default, rename = "api_keys")]
    inline_keys: Vec<String>,
    /// File with one key per line; blank lines and `#` comments are skipped.
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Key selection retry and 429 failover policy
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub auto_failover: bool,
    /// Use the retrying selection for model listing as well.
    #[serde(default)]
    pub retry_model_listing: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            auto_failover: true,
            retry_model_listing: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub enable_request_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            enable_request_log: false,
        }
    }
}

fn default_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Key resolution order:
    /// 1. UPSTREAM_API_KEYS env var (comma-separated)
    /// 2. api_keys_file path from config
    /// 3. api_keys inline list
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.upstream.base_url.starts_with("http://")
            && !config.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.upstream.base_url
            )));
        }

        if config.upstream.rate_limit == 0 {
            return Err(common::Error::Config(
                "rate_limit must be greater than 0".into(),
            ));
        }

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.upstream.retry.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let keys = if let Ok(raw) = std::env::var(KEYS_ENV) {
            parse_keys(raw.split(','))
        } else if let Some(ref key_file) = config.upstream.api_keys_file {
            let raw = std::fs::read_to_string(key_file).map_err(|source| {
                common::Error::KeysFile {
                    path: key_file.clone(),
                    source,
                }
            })?;
            parse_keys(raw.lines().filter(|l| !l.trim_start().starts_with('#')))
        } else {
            parse_keys(config.upstream.inline_keys.iter().map(String::as_str))
        };
        config.upstream.inline_keys.clear();

        if keys.is_empty() {
            return Err(common::Error::Config(
                "at least one upstream API key is required".into(),
            ));
        }
        config.upstream.api_keys = keys;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("key-balancer.toml")
    }
}

fn parse_keys<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<Secret<String>> {
    raw.map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_owned()))
        .collect()
}
