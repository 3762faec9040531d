use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Per-source discovery window
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Name the target application advertises and runs under
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_true")]
    pub network: bool,
    #[serde(default = "default_true")]
    pub process: bool,
    #[serde(default = "default_host")]
    pub probe_host: String,
    /// Ports to probe; probing is off while empty
    #[serde(default)]
    pub probe_ports: Vec<u16>,
    #[serde(default = "default_probe_connect_timeout_ms")]
    pub probe_connect_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_app_name() -> String {
    "opencode".to_string()
}

fn default_service_type() -> String {
    "_http._tcp.local.".to_string()
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_probe_connect_timeout_ms() -> u64 {
    250
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_connect_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            app_name: default_app_name(),
            service_type: default_service_type(),
            network: true,
            process: true,
            probe_host: default_host(),
            probe_ports: Vec::new(),
            probe_connect_timeout_ms: default_probe_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_status_path")]
    pub path: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Status queries kept in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_status_path() -> String {
    "/session/status".to_string()
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_concurrency() -> usize {
    4
}

impl StatusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            path: default_status_path(),
            request_timeout_ms: default_request_timeout_ms(),
            concurrency: default_concurrency(),
        }
    }
}

pub fn config_dir() -> Result<PathBuf> {
    let dir = directories::ProjectDirs::from("", "", "hostscope")
        .context("Could not determine config directory")?
        .config_dir()
        .to_path_buf();
    Ok(dir)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Load configuration.
///
/// An explicit path must exist. Without one, the default location is used
/// when present and built-in defaults otherwise.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => {
            if !p.exists() {
                anyhow::bail!("Config file not found at {}", p.display());
            }
            p.to_path_buf()
        }
        None => match default_config_path() {
            Ok(p) if p.exists() => p,
            Ok(_) => return Ok(Config::default()),
            Err(e) => {
                tracing::debug!("No config directory available: {}", e);
                return Ok(Config::default());
            }
        },
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    parse(&content).with_context(|| format!("Failed to parse config from {}", path.display()))
}

pub fn parse(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    Ok(config)
}
