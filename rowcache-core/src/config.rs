//! Runtime configuration.
//!
//! Configuration comes from a TOML document, from environment variables, or
//! from both (a file named by `ROWCACHE_CONFIG`, then individual overrides).
//! Errors here are fatal for startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default time-to-live for distributed cache entries, in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowcacheConfig {
    /// Named relational stores.
    pub stores: BTreeMap<String, StoreSettings>,
    pub cache: CacheSettings,
}

/// Settings for one relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite database path; `:memory:` opens a private in-memory database.
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl StoreSettings {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Distributed cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub transport: TransportSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            transport: TransportSettings::Memory,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Which cache transport backs the distributed tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSettings {
    /// In-process map; shared only by managers holding the same transport.
    Memory,
    /// LMDB environment, shareable between processes on one host.
    Lmdb {
        path: PathBuf,
        #[serde(default = "default_map_size_mb")]
        map_size_mb: usize,
    },
    /// No distributed tier; transactional reads always go to the store.
    Disabled,
}

fn default_map_size_mb() -> usize {
    64
}

impl RowcacheConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&text)
    }

    /// Build from the process environment.
    ///
    /// - `ROWCACHE_CONFIG`: TOML file to start from
    /// - `ROWCACHE_CACHE_TTL_SECS`: cache TTL override
    /// - `ROWCACHE_STORE_<NAME>`: store path, registered as lowercase `<name>`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    fn from_vars<I: IntoIterator<Item = (String, String)>>(vars: I) -> Result<Self, ConfigError> {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        let lookup = |name: &str| {
            vars.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };

        let mut config = match lookup("ROWCACHE_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(ttl) = lookup("ROWCACHE_CACHE_TTL_SECS") {
            config.cache.ttl_secs = ttl.parse().map_err(|_| ConfigError::InvalidValue {
                field: "ROWCACHE_CACHE_TTL_SECS".to_string(),
                value: ttl.clone(),
                reason: "expected a whole number of seconds".to_string(),
            })?;
        }

        for (name, value) in &vars {
            if let Some(store) = name.strip_prefix("ROWCACHE_STORE_") {
                if store.is_empty() {
                    continue;
                }
                config
                    .stores
                    .insert(store.to_lowercase(), StoreSettings::new(value.clone()));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Settings for the store called `name`.
    pub fn store(&self, name: &str) -> Result<&StoreSettings, ConfigError> {
        self.stores.get(name).ok_or_else(|| ConfigError::UnknownStore {
            name: name.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.ttl_secs".to_string(),
                value: "0".to_string(),
                reason: "TTL must be positive".to_string(),
            });
        }
        for (name, store) in &self.stores {
            if store.path.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: format!("stores.{}.path", name),
                });
            }
        }
        if let TransportSettings::Lmdb { path, map_size_mb } = &self.cache.transport {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "cache.transport.path".to_string(),
                });
            }
            if *map_size_mb == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "cache.transport.map_size_mb".to_string(),
                    value: "0".to_string(),
                    reason: "map size must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}
