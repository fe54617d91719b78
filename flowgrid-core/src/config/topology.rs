//! Topology maintenance and synchroniser configuration

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use super::defaults::*;
use super::{parse_bool_from_env, parse_duration_secs_from_env};
use crate::error::{FlowgridError, FlowgridResult};

/// Discovery cleanup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Run the stale-switch cleanup task; accepts `false` or the string `"false"`
    #[serde(alias = "EnableCleanup", deserialize_with = "bool_or_string")]
    pub enable_cleanup: bool,

    /// Period of the cleanup task
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            enable_cleanup: DEFAULT_ENABLE_CLEANUP,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl TopologyConfig {
    pub(crate) fn apply_env(&mut self) -> FlowgridResult<()> {
        if let Some(enabled) = parse_bool_from_env("FLOWGRID_ENABLE_CLEANUP")? {
            self.enable_cleanup = enabled;
        }
        self.cleanup_interval =
            parse_duration_secs_from_env("FLOWGRID_CLEANUP_INTERVAL_SECS", self.cleanup_interval);
        Ok(())
    }

    pub fn validate(&self) -> FlowgridResult<()> {
        if self.cleanup_interval.is_zero() {
            return Err(FlowgridError::configuration(
                "topology.cleanup_interval",
                "interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Flow synchroniser settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the flow-entry reader task
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

impl SyncConfig {
    pub(crate) fn apply_env(&mut self) -> FlowgridResult<()> {
        self.interval = parse_duration_secs_from_env("FLOWGRID_SYNC_INTERVAL_SECS", self.interval);
        Ok(())
    }

    pub fn validate(&self) -> FlowgridResult<()> {
        if self.interval.is_zero() {
            return Err(FlowgridError::configuration(
                "sync.interval",
                "interval must be positive",
            ));
        }
        Ok(())
    }
}

fn bool_or_string<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        // Anything but an explicit "false" keeps cleanup on
        Flag::Text(s) => Ok(!s.trim().eq_ignore_ascii_case("false")),
    }
}
