//! Rule model and rule-file loading
//!
//! Rules are read from `config.yml` in the original docker-firewall layout:
//!
//! ```yaml
//! config:
//!   rules:
//!   - interface:
//!     - eth0
//!     protocol: tcp
//!     port: 3000
//!     allow:
//!     - 10.1.1.1
//!   - port: 8080
//! ```
//!
//! The same shape is accepted from a `.toml` file (`[[config.rules]]`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{PolicyError, Result};

/// One declarative allow entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(
        default,
        rename = "interface",
        alias = "interfaces",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
}

impl Rule {
    /// Protocol name, lowercased; `None` when absent or blank.
    pub fn protocol(&self) -> Option<String> {
        self.protocol
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_lowercase)
    }

    /// Destination port; port 0 means no restriction.
    pub fn port(&self) -> Option<u16> {
        self.port.filter(|p| *p > 0)
    }

    pub fn with_interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces = interfaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = Some(protocol.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_allow<I, S>(mut self, allow: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow = allow.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    config: RuleList,
}

#[derive(Debug, Default, Deserialize)]
struct RuleList {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Read and decode a rule file. Format is picked from the extension:
/// `.toml` is TOML, anything else is YAML.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    let contents =
        std::fs::read_to_string(path).map_err(|source| PolicyError::ConfigUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

    let file: RuleFile = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::from_str(&contents).map_err(|e| PolicyError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&contents).map_err(|e| PolicyError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    };

    info!(path = %path.display(), rules = file.config.rules.len(), "Loaded rule file");
    Ok(file.config.rules)
}

/// Supplies the ordered rule list for one reconciliation cycle.
pub trait RuleSource: Send + Sync {
    fn load(&self) -> Result<Vec<Rule>>;

    /// Human readable origin, used in log lines.
    fn describe(&self) -> String;
}

/// Rule file name inside the config directory.
pub const RULES_FILE: &str = "config.yml";

/// Rule source backed by a file on disk, re-read on every `load`.
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `config.yml` inside `config_dir`.
    pub fn in_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join(RULES_FILE))
    }
}

impl RuleSource for FileRuleSource {
    fn load(&self) -> Result<Vec<Rule>> {
        debug!(path = %self.path.display(), "Reading rules");
        load_rules(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
