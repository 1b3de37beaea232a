//! Agent catalogue and server settings.
//!
//! The catalogue is a JSON file listing the agents the server may launch:
//!
//! ```json
//! {
//!   "agents": {
//!     "builder": {
//!       "name": "Builder",
//!       "command": "sh",
//!       "args": ["-c", "make"],
//!       "envRequired": ["TOKEN"]
//!     }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default listen address for `agentcast serve`.
pub const DEFAULT_BIND: &str = "127.0.0.1:7433";

/// Default server URL for client commands.
pub const DEFAULT_URL: &str = "http://127.0.0.1:7433";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid agent catalogue: {0}")]
    Invalid(String),
}

const fn default_true() -> bool {
    true
}

/// One launchable agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    /// Display name.
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Program to execute.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Environment variables that must be set before the agent may start.
    #[serde(default)]
    pub env_required: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

impl AgentDefinition {
    /// A minimal enabled definition, mostly for tests.
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            command: command.into(),
            args: args.iter().map(std::string::ToString::to_string).collect(),
            description: String::new(),
            env_required: Vec::new(),
            working_directory: None,
        }
    }
}

/// The agent catalogue, keyed by agent id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentDefinition>,
}

impl AgentsConfig {
    /// Parse and validate a catalogue from JSON text.
    pub fn from_json(json: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a catalogue file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json, path)
    }

    /// Load an explicit path, or the default path if it exists.
    ///
    /// A missing default file yields an empty catalogue; a missing explicit
    /// file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default = Self::default_path();
        if default.exists() {
            Self::load(&default)
        } else {
            Ok(Self::default())
        }
    }

    /// `$XDG_CONFIG_HOME/agentcast/agents.json`, or `./agents.json`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir().map_or_else(
            || PathBuf::from("agents.json"),
            |dir| dir.join("agentcast").join("agents.json"),
        )
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with_agent(mut self, id: impl Into<String>, definition: AgentDefinition) -> Self {
        self.agents.insert(id.into(), definition);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (id, agent) in &self.agents {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("agent id cannot be empty".into()));
            }
            if agent.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("agent {id} has an empty command")));
            }
        }
        Ok(())
    }
}

/// Settings for [`crate::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Messages kept per agent.
    pub buffer_capacity: usize,
    /// Messages replayed to a newly connected stream client.
    pub history_replay: usize,
    /// Interval between keep-alive comments on idle streams.
    pub keep_alive: Duration,
    pub agents: AgentsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7433)),
            buffer_capacity: 1000,
            history_replay: 100,
            keep_alive: Duration::from_secs(30),
            agents: AgentsConfig::default(),
        }
    }
}
