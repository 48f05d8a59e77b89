//! Configuration loading and agent identity.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid agent id in {}: {reason}", path.display())]
    Identity { path: PathBuf, reason: String },
}

/// Agent configuration.
///
/// ```toml
/// listen_addr = "127.0.0.1:4080"
/// peer_addrs = ["127.0.0.1:4081", "127.0.0.1:4082"]
/// identity_path = "agent.id"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address to listen on, `host:port`. Also the address advertised to
    /// peers (after resolving an ephemeral port).
    pub listen_addr: String,
    /// Peer agents to subscribe to at startup.
    #[serde(default)]
    pub peer_addrs: Vec<String>,
    /// Where to persist this agent's id. Without it the id is ephemeral:
    /// a fresh random id on every start.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
    /// Seed for the agent's RNG (pid allocation, id generation). Omit in
    /// production; set for deterministic tests and demos.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Resolves this agent's id: read from `identity_path` if the file exists,
/// otherwise draw a random 32-bit id and (if a path is configured) write
/// it back for the next start.
pub fn resolve_agent_id(config: &Config, rng: &mut impl Rng) -> Result<u32, ConfigError> {
    let Some(path) = &config.identity_path else {
        return Ok(rng.gen());
    };
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .trim()
            .parse::<u32>()
            .map_err(|e| ConfigError::Identity {
                path: path.clone(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let agent_id: u32 = rng.gen();
            std::fs::write(path, format!("{}\n", agent_id))?;
            Ok(agent_id)
        }
        Err(e) => Err(ConfigError::Io(e)),
    }
}
