use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestration::DispatcherConfig;
use crate::{osplog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent CLI command line (first token is the binary).
    pub command: Option<String>,
    /// Seconds without observed agent output before it is treated as stalled.
    pub inactivity_timeout_secs: Option<u64>,
    /// Number of agents allowed to run concurrently per project.
    pub max_concurrent_agents: Option<usize>,
}

impl Config {
    pub fn opensprint_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".opensprint"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::opensprint_dir()?.join("opensprint.toml"))
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    /// Derive the dispatcher tuning from this config, falling back to defaults.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let mut dc = DispatcherConfig::default();
        if let Some(secs) = self.inactivity_timeout_secs {
            dc.inactivity_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_concurrent_agents {
            dc.max_concurrent_agents = max;
        }
        dc
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        osplog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            osplog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        osplog_debug!(
            "Config loaded: command={:?}, inactivity_timeout_secs={:?}, max_concurrent_agents={:?}",
            config.command,
            config.inactivity_timeout_secs,
            config.max_concurrent_agents
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::opensprint_dir()?;
        if !dir.exists() {
            osplog_debug!("Creating opensprint directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        osplog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::opensprint_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
