//! Agent identity and command configuration.
//!
//! An agent is an external coding-agent CLI spawned as a subprocess. The
//! dispatcher assigns each spawned process a fresh [`AgentId`], which is the
//! identity written into the task's `assignee` field and tracked by the
//! process registry.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;

/// Unique identity of a spawned agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Create a new unique agent identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The agent CLI command used to execute tasks.
pub struct Agent {
    base_command: Vec<String>,
}

impl Agent {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_command: config
                .effective_command()
                .split_whitespace()
                .map(String::from)
                .collect(),
        }
    }

    /// Build an agent from an explicit command line (first token is the binary).
    pub fn from_command(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
        }
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    /// Full command line with the task prompt appended as the final argument.
    pub fn command(&self, prompt: Option<&str>) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        if let Some(p) = prompt {
            cmd.push(p.to_string());
        }
        cmd
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
