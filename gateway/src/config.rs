//! Gateway configuration loaded from an optional YAML file and the environment.
//!
//! Every field has a default, so the gateway starts with no file at all. Environment variables
//! take precedence over the file.

use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use serde::Deserialize;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_cache_expire() -> u64 {
    3600
}

fn default_metadata_path() -> Option<PathBuf> {
    Some(PathBuf::from("metadata.json"))
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_max_resample_buckets() -> usize {
    crate::transform::DEFAULT_MAX_BUCKETS
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Log output format.
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown log format: {other}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
/// Top-level gateway configuration.
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    /// Interface the HTTP server binds to.
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cache_expire")]
    /// Response cache time-to-live, in seconds.
    pub cache_expire: u64,

    #[serde(default = "default_metadata_path")]
    /// Where the metric metadata artifact is written. `None` disables the export.
    pub metadata_path: Option<PathBuf>,

    #[serde(default = "default_max_body_bytes")]
    /// Maximum accepted request body size (top-level and batch sub-requests alike).
    pub max_body_bytes: usize,

    #[serde(default = "default_max_resample_buckets")]
    /// Most rows a `resample` query may produce before it is rejected with 400.
    pub max_resample_buckets: usize,

    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cache_expire: default_cache_expire(),
            metadata_path: default_metadata_path(),
            max_body_bytes: default_max_body_bytes(),
            max_resample_buckets: default_max_resample_buckets(),
            log_format: LogFormat::default(),
        }
    }
}

impl GatewayConfig {
    /// Parse a YAML gateway config from bytes.
    pub fn from_yaml_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    /// Load the config: YAML file (if given), then environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let cfg = match path {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                Self::from_yaml_bytes(&bytes)
                    .with_context(|| format!("parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        cfg.with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `AUGUR_*` overrides obtained from `lookup`.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        if let Some(host) = lookup("AUGUR_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("AUGUR_PORT") {
            self.port = parse_env("AUGUR_PORT", &port)?;
        }
        if let Some(expire) = lookup("AUGUR_CACHE_EXPIRE") {
            self.cache_expire = parse_env("AUGUR_CACHE_EXPIRE", &expire)?;
        }
        if let Some(path) = lookup("AUGUR_METADATA_PATH") {
            self.metadata_path = if path.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Some(max) = lookup("AUGUR_MAX_BODY_BYTES") {
            self.max_body_bytes = parse_env("AUGUR_MAX_BODY_BYTES", &max)?;
        }
        if let Some(max) = lookup("AUGUR_MAX_RESAMPLE_BUCKETS") {
            self.max_resample_buckets = parse_env("AUGUR_MAX_RESAMPLE_BUCKETS", &max)?;
        }
        if let Some(format) = lookup("AUGUR_LOG_FORMAT") {
            self.log_format = parse_env("AUGUR_LOG_FORMAT", &format)?;
        }
        Ok(self)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_expire)
    }
}

fn parse_env<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| anyhow::anyhow!("invalid {name} ({value}): {err}"))
}
