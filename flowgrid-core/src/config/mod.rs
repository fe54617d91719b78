//! Controller configuration
//!
//! Configuration is assembled from defaults, an optional TOML file and
//! `FLOWGRID_*` environment overrides, then validated once at startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowgridError, FlowgridResult};

pub mod datastore;
pub mod defaults;
pub mod pusher;
pub mod topology;

pub use datastore::DatastoreConfig;
pub use defaults::*;
pub use pusher::{DamperConfig, PusherConfig};
pub use topology::{SyncConfig, TopologyConfig};

/// Root configuration for one controller instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Identifier this instance registers with the cluster
    pub instance_id: String,

    pub datastore: DatastoreConfig,

    pub topology: TopologyConfig,

    pub pusher: PusherConfig,

    pub damper: DamperConfig,

    pub registry: RegistryConfig,

    pub sync: SyncConfig,

    pub events: EventBusConfig,

    pub intents: IntentConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance_id: DEFAULT_INSTANCE_ID.to_string(),
            datastore: DatastoreConfig::default(),
            topology: TopologyConfig::default(),
            pusher: PusherConfig::default(),
            damper: DamperConfig::default(),
            registry: RegistryConfig::default(),
            sync: SyncConfig::default(),
            events: EventBusConfig::default(),
            intents: IntentConfig::default(),
        }
    }
}

/// Cluster registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Size of every block handed out by `allocate_unique_id_block`
    pub id_block_size: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            id_block_size: DEFAULT_ID_BLOCK_SIZE,
        }
    }
}

/// Local event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Events buffered per listener before the oldest is dropped
    pub listener_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            listener_capacity: DEFAULT_LISTENER_QUEUE_CAPACITY,
        }
    }
}

/// Intent submission settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Deadline applied to batches submitted without one
    #[serde(with = "humantime_serde")]
    pub default_deadline: Option<Duration>,
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a TOML file; missing sections take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> FlowgridResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            FlowgridError::configuration(
                "config file",
                format!("cannot read {}: {}", path.display(), e),
            )
        })?;
        let config: ControllerConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Build from defaults and `FLOWGRID_*` environment variables
    pub fn from_env() -> FlowgridResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Layer `FLOWGRID_*` environment variables on top of this configuration
    pub fn apply_env_overrides(&mut self) -> FlowgridResult<()> {
        if let Ok(id) = std::env::var("FLOWGRID_INSTANCE_ID") {
            self.instance_id = id;
        }
        self.datastore.apply_env()?;
        self.topology.apply_env()?;
        self.pusher.apply_env()?;
        self.damper.apply_env()?;
        self.sync.apply_env()?;

        if let Ok(val) = std::env::var("FLOWGRID_ID_BLOCK_SIZE") {
            self.registry.id_block_size = val.parse().map_err(|_| {
                FlowgridError::configuration("registry.id_block_size", "invalid FLOWGRID_ID_BLOCK_SIZE")
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> FlowgridResult<()> {
        if self.instance_id.trim().is_empty() {
            return Err(FlowgridError::configuration(
                "instance_id",
                "instance id must not be empty",
            ));
        }
        if self.registry.id_block_size == 0 {
            return Err(FlowgridError::configuration(
                "registry.id_block_size",
                "block size must be positive",
            ));
        }
        if self.events.listener_capacity == 0 {
            return Err(FlowgridError::configuration(
                "events.listener_capacity",
                "capacity must be positive",
            ));
        }

        self.datastore.validate()?;
        self.topology.validate()?;
        self.pusher.validate()?;
        self.damper.validate()?;
        self.sync.validate()?;
        Ok(())
    }

    /// Small, fast settings for tests
    pub fn test(instance_id: &str) -> Self {
        let mut config = Self::default();
        config.instance_id = instance_id.to_string();
        config.topology.cleanup_interval = Duration::from_millis(200);
        config.sync.interval = Duration::from_millis(200);
        config.pusher.idle_poll = Duration::from_millis(10);
        config
    }
}

/// Builder for ControllerConfig
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
        }
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.config.instance_id = id.into();
        self
    }

    pub fn datastore(mut self, datastore: DatastoreConfig) -> Self {
        self.config.datastore = datastore;
        self
    }

    pub fn topology(mut self, topology: TopologyConfig) -> Self {
        self.config.topology = topology;
        self
    }

    pub fn pusher(mut self, pusher: PusherConfig) -> Self {
        self.config.pusher = pusher;
        self
    }

    pub fn damper(mut self, damper: DamperConfig) -> Self {
        self.config.damper = damper;
        self
    }

    pub fn id_block_size(mut self, size: u64) -> Self {
        self.config.registry.id_block_size = size;
        self
    }

    pub fn build(self) -> FlowgridResult<ControllerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ControllerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn parse_duration_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub(crate) fn parse_bool_from_env(key: &str) -> FlowgridResult<Option<bool>> {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(FlowgridError::configuration(key, format!("not a boolean: {}", val))),
        },
        Err(_) => Ok(None),
    }
}
