//! Service configuration.
//!
//! Loaded from a TOML file. Every field has a default, so an empty file (or
//! no file at all) yields a runnable development configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{CollabError, Result};

/// Environment variable consulted when no config path is passed on the command line.
pub const CONFIG_ENV: &str = "COLLAB_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub persister: PersisterConfig,
    pub client: ClientConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Upper bound on the whole shutdown sequence.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            shutdown_grace_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis_url: String,
    /// Key prefix for binary documents.
    pub key_prefix: String,
    /// Key prefix for text notes. Must differ from `key_prefix`.
    pub note_key_prefix: String,
    /// Entries untouched for this long expire, flushed or not.
    pub ttl_secs: u64,
    /// Bound on the per-document update log.
    pub max_updates: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Redis,
            redis_url: "redis://127.0.0.1/".to_string(),
            key_prefix: "doc".to_string(),
            note_key_prefix: "note".to_string(),
            ttl_secs: 24 * 60 * 60,
            max_updates: 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/collab.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersisterConfig {
    pub interval_secs: u64,
    pub io_timeout_secs: u64,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            io_timeout_secs: 10,
        }
    }
}

impl PersisterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Capacity of each client's outbound queue. Overflow disconnects the client.
    pub outbound_queue: usize,
    pub ping_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            ping_interval_secs: 54,
        }
    }
}

impl ClientConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Reject upgrades that arrive without an `X-User-Id` header.
    pub require_user: bool,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    /// Resolve the config source: explicit path, then `COLLAB_CONFIG`, then defaults.
    pub fn discover(cli_path: Option<String>) -> Result<Self> {
        match cli_path.or_else(|| std::env::var(CONFIG_ENV).ok()) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.max_updates == 0 {
            return Err(CollabError::Config("cache.max_updates must be > 0".into()));
        }
        if self.cache.key_prefix == self.cache.note_key_prefix {
            return Err(CollabError::Config(
                "cache.key_prefix and cache.note_key_prefix must differ".into(),
            ));
        }
        if self.client.outbound_queue == 0 {
            return Err(CollabError::Config(
                "client.outbound_queue must be > 0".into(),
            ));
        }
        if self.persister.interval_secs == 0 {
            return Err(CollabError::Config(
                "persister.interval_secs must be > 0".into(),
            ));
        }
        if self.client.ping_interval_secs == 0 {
            return Err(CollabError::Config(
                "client.ping_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}
