//! Configuration file handling.
//!
//! ```toml
//! [agent]
//! path = "/org/bluedeck/agent"
//! capability = "DisplayYesNo"
//!
//! [discovery]
//! auto_start = true
//! window_secs = 30
//!
//! [history]
//! path = "/home/me/.local/state/bluedeck/history.toml"
//! ```

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{agent::Capability, Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub discovery: DiscoveryConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Object path the pairing agent is exported at.
    pub path: String,
    pub capability: Capability,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            path: "/org/bluedeck/agent".to_string(),
            capability: Capability::DisplayYesNo,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Start discovery whenever the adapter gets powered on.
    pub auto_start: bool,
    /// Stop discovery this many seconds after starting it. `0` keeps it running.
    pub window_secs: u64,
}

impl DiscoveryConfig {
    pub fn window(&self) -> Option<Duration> {
        (self.window_secs != 0).then(|| Duration::from_secs(self.window_secs))
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            window_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Where connection counts are persisted. Kept in memory only if unset.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Loads the configuration at `path`, falling back to defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => content.parse(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Loads `$XDG_CONFIG_HOME/bluedeck/config.toml` (or `~/.config/bluedeck/config.toml`).
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        let base = match env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(env::var_os("HOME")?).join(".config"),
        };
        Some(base.join("bluedeck").join("config.toml"))
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(Error::from)
    }
}
