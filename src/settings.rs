//! Process-wide settings
//!
//! Settings are read from a YAML file. When no file is given explicitly the
//! usual locations are probed in order and the first one found wins; with
//! nothing found the built-in defaults apply.

use crate::error::{DominatorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Port remote ships expose their Docker engine on
pub const DEFAULT_SHIP_DOCKER_PORT: u16 = 4243;

/// Socket the local Docker engine listens on
pub const DOCKER_SOCKET: &str = "/run/docker.sock";

/// Settings file names probed when none is given
pub fn default_locations() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("settings.yaml")];
    if let Some(config) = dirs::home_dir() {
        paths.push(config.join(".config/dominator/settings.yaml"));
    }
    paths.push(PathBuf::from("/etc/dominator/settings.yaml"));
    paths
}

/// Log output style
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

/// `logging` section of the settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingSettings {
    /// Base level, overridden by `--loglevel`
    pub level: Option<String>,
    /// Per-target levels, e.g. `dominator::docker::pull: debug`
    pub targets: BTreeMap<String, String>,
    pub format: LogFormat,
    pub ansi: Option<bool>,
}

/// Dominator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Engine used for local image bookkeeping and by the local ship
    pub docker_url: String,
    /// Namespace prefixed to bare repository names
    pub docker_namespace: Option<String>,
    /// Registry applied to repositories that carry none
    pub docker_registry: Option<String>,
    pub localship_fqdn: String,
    pub ship_docker_port: u16,
    #[serde(rename = "configvolumedir")]
    pub config_volume_dir: String,
    #[serde(rename = "datavolumedir")]
    pub data_volume_dir: String,
    /// Image the ambassador container runs
    pub deploy_image: String,
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docker_url: format!("unix://{}", DOCKER_SOCKET),
            docker_namespace: None,
            docker_registry: None,
            localship_fqdn: "localhost".to_string(),
            ship_docker_port: DEFAULT_SHIP_DOCKER_PORT,
            config_volume_dir: "/var/lib/dominator/config".to_string(),
            data_volume_dir: "/var/lib/dominator/data".to_string(),
            deploy_image: "yandex/dominator".to_string(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the first default location found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::probe(&default_locations()),
        }
    }

    /// Load from the first existing file among `candidates`
    pub fn probe(candidates: &[PathBuf]) -> Result<Self> {
        for candidate in candidates {
            tracing::debug!(path = %candidate.display(), "checking existence of settings file");
            if candidate.exists() {
                return Self::from_file(candidate);
            }
        }
        tracing::warn!("could not find any settings file, using defaults");
        Ok(Self::default())
    }

    /// Load settings from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "loading settings");
        let content = std::fs::read_to_string(path).map_err(|e| {
            DominatorError::Settings(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse_str(&content)
    }

    /// Parse settings YAML; an empty document yields the defaults
    pub fn parse_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| DominatorError::Settings(format!("failed to parse YAML: {}", e)))
    }

    pub fn config_volume_root(&self) -> PathBuf {
        expand_home(&self.config_volume_dir)
    }

    pub fn data_volume_root(&self) -> PathBuf {
        expand_home(&self.data_volume_dir)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}
