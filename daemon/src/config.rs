//! Daemon settings loading and parsing

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Directory holding `config.yml` (rules) and `daemon.toml` (settings).
pub const DEFAULT_CONFIG_DIR: &str = "/etc/docker-firewall";
pub const SETTINGS_FILE: &str = "daemon.toml";

/// Root settings structure
#[derive(Debug, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub firewall: FirewallSection,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            poll_interval_secs: default_poll_interval(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl DaemonSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct FirewallSection {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    #[serde(default = "default_iptables_binary")]
    pub iptables_binary: String,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            table: default_table(),
            chain: default_chain(),
            iptables_binary: default_iptables_binary(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_pid_file() -> PathBuf { PathBuf::from("/tmp/docker-firewall") }
fn default_poll_interval() -> u64 { 10 }
fn default_stop_timeout() -> u64 { 10 }
fn default_table() -> String { dockwall_policy::FILTER_TABLE.into() }
fn default_chain() -> String { dockwall_policy::DOCKER_USER_CHAIN.into() }
fn default_iptables_binary() -> String { "iptables".into() }
fn default_log_level() -> String { "info".into() }
fn default_log_format() -> LogFormat { LogFormat::Compact }

/// Config directory: `CONFIG_PATH` if set, otherwise `/etc/docker-firewall`.
pub fn default_config_dir() -> PathBuf {
    std::env::var_os("CONFIG_PATH")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

/// Where the loaded settings came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsOrigin {
    File(PathBuf),
    /// The file was missing; carries the path that was tried.
    Defaults(PathBuf),
}

impl SettingsOrigin {
    /// Settings are read before the subscriber exists, so `run` reports the
    /// origin once logging is up.
    pub fn log(&self) {
        match self {
            Self::File(path) => info!("Settings loaded from {}", path.display()),
            Self::Defaults(path) => {
                warn!("Settings file not found at {}, using defaults", path.display())
            }
        }
    }
}

/// Load settings from `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<(DaemonConfig, SettingsOrigin)> {
    if !path.exists() {
        return Ok((
            DaemonConfig::default(),
            SettingsOrigin::Defaults(path.to_path_buf()),
        ));
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    let config: DaemonConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse settings from {}", path.display()))?;
    Ok((config, SettingsOrigin::File(path.to_path_buf())))
}
