//! Configuration system for Cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::chunker::DEFAULT_CHUNK_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub store: StoreConfig,
    pub chunker: ChunkerConfig,
    pub distribution: DistributionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Node id, hex. Empty = generate a fresh one at startup.
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on.
    pub listen_addr: String,
    /// TCP port. 0 = OS-assigned.
    pub port: u16,
    /// Peers with a different network id are disconnected after STATUS.
    pub network_id: u64,
    /// `ip:port` peers to dial at startup.
    pub bootstrap: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// In-memory chunk cache budget, in subtree bytes.
    pub memory_budget_bytes: u64,
    /// Directory of the persistent chunk database.
    pub storage_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Leaf payload size. Must hold at least two keys.
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Copies forwarded per originating request id when a chunk is found.
    pub requester_count: usize,
    /// Peers a fresh chunk is pushed to.
    pub max_store_peers: usize,
    /// Peers asked when a chunk is missing locally.
    pub max_search_peers: usize,
    /// Retrieve deadline.
    pub search_timeout_ms: u64,
    /// How long a store broadcast keeps picking up newly connected peers.
    pub broadcast_window_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 30399,
            network_id: 0,
            bootstrap: Vec::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 10 * 1024 * 1024, // 10 MiB
            storage_path: data_dir().join("chunks"),
        }
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            requester_count: 3,
            max_store_peers: 3,
            max_search_peers: 6,
            search_timeout_ms: 2_000,
            broadcast_window_ms: 10_000,
        }
    }
}

impl DistributionConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn broadcast_window(&self) -> Duration {
        Duration::from_millis(self.broadcast_window_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("cairn")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("identity.node_id is not valid hex: {0}")]
    BadNodeId(hex::FromHexError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The configured node id, or a fresh random one when unset.
    pub fn node_id(&self) -> Result<Vec<u8>, ConfigError> {
        if self.identity.node_id.is_empty() {
            return Ok(crate::crypto::generate_node_id().to_vec());
        }
        hex::decode(&self.identity.node_id).map_err(ConfigError::BadNodeId)
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CAIRN_IDENTITY__NODE_ID") {
            self.identity.node_id = v;
        }
        if let Some(v) = var("CAIRN_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(p) = var("CAIRN_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(id) = var("CAIRN_NETWORK__NETWORK_ID").and_then(|v| v.parse().ok()) {
            self.network.network_id = id;
        }
        if let Some(v) = var("CAIRN_NETWORK__BOOTSTRAP") {
            self.network.bootstrap = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("CAIRN_STORE__STORAGE_PATH") {
            self.store.storage_path = PathBuf::from(v);
        }
        if let Some(b) = var("CAIRN_STORE__MEMORY_BUDGET_BYTES").and_then(|v| v.parse().ok()) {
            self.store.memory_budget_bytes = b;
        }
        if let Some(ms) = var("CAIRN_DISTRIBUTION__SEARCH_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.distribution.search_timeout_ms = ms;
        }
    }
}
