//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration shared by nodes and the broker server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Broker location and topology names.
    pub network: NetworkConfig,
    /// Grid geometry used when this node becomes host.
    pub world: WorldConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Broker connection and topology configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Broker server address.
    pub broker_address: String,
    /// Broker server port.
    pub broker_port: u16,
    /// Well-known name of the queue the host consumes proposals from.
    pub host_queue: String,
    /// Fan-out exchange committed actions are published to.
    pub exchange: String,
    /// How long a leaving node waits for its own disconnect to be committed.
    pub leave_timeout_ms: u64,
    /// Maximum concurrent connections (broker server only).
    pub max_connections: usize,
}

/// World geometry. Only the host's values matter; followers adopt the
/// geometry carried in the snapshot they receive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// Number of rows and columns in one zone.
    pub zone_size: u32,
    /// Number of zones per row of the zone grid.
    pub zone_line: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            broker_address: "127.0.0.1".to_string(),
            broker_port: 5673,
            host_queue: "nodeio/host".to_string(),
            exchange: "amq.fanout".to_string(),
            leave_timeout_ms: 2_000,
            max_connections: 256,
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            zone_size: 8,
            zone_line: 4,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Platform config directory for nodeio, if the platform has one.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nodeio"))
}

// --- Load / Save / Reload / Validate ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Returns `Some(new_config)` if the file on disk differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject settings no node could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world.zone_size == 0 {
            return Err(ConfigError::Invalid {
                field: "world.zone_size",
                reason: "must be at least 1",
            });
        }
        if self.world.zone_line == 0 {
            return Err(ConfigError::Invalid {
                field: "world.zone_line",
                reason: "must be at least 1",
            });
        }
        if self.network.host_queue.is_empty() {
            return Err(ConfigError::Invalid {
                field: "network.host_queue",
                reason: "must not be empty",
            });
        }
        if self.network.exchange.is_empty() {
            return Err(ConfigError::Invalid {
                field: "network.exchange",
                reason: "must not be empty",
            });
        }
        Ok(())
    }

    /// `address:port` of the broker server.
    pub fn broker_endpoint(&self) -> String {
        format!(
            "{}:{}",
            self.network.broker_address, self.network.broker_port
        )
    }
}
