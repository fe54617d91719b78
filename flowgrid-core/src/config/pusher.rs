//! Flow pusher and message damper configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use super::parse_duration_from_env;
use crate::error::{FlowgridError, FlowgridResult};

/// Per-switch push queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PusherConfig {
    /// Number of worker tasks draining switch queues
    pub threads: usize,

    /// Bytes per second each switch may receive
    pub bytes_per_sec: u64,

    /// Bytes a single switch queue may hold before `add` spills back
    pub max_queue_bytes: usize,

    /// How often an idle worker re-checks throttled queues
    #[serde(with = "humantime_serde")]
    pub idle_poll: Duration,

    /// How long a closing queue waits for its last barrier reply
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_PUSHER_THREADS,
            bytes_per_sec: DEFAULT_PUSHER_BYTES_PER_SEC,
            max_queue_bytes: DEFAULT_PUSHER_QUEUE_BYTES,
            idle_poll: DEFAULT_PUSHER_IDLE_POLL,
            drain_timeout: DEFAULT_PUSHER_DRAIN_TIMEOUT,
        }
    }
}

impl PusherConfig {
    pub(crate) fn apply_env(&mut self) -> FlowgridResult<()> {
        if let Ok(val) = std::env::var("FLOWGRID_PUSHER_THREADS") {
            self.threads = val.parse().map_err(|_| {
                FlowgridError::configuration("pusher.threads", "invalid FLOWGRID_PUSHER_THREADS")
            })?;
        }
        if let Ok(val) = std::env::var("FLOWGRID_PUSHER_BYTES_PER_SEC") {
            self.bytes_per_sec = val.parse().map_err(|_| {
                FlowgridError::configuration(
                    "pusher.bytes_per_sec",
                    "invalid FLOWGRID_PUSHER_BYTES_PER_SEC",
                )
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> FlowgridResult<()> {
        if self.threads == 0 {
            return Err(FlowgridError::configuration(
                "pusher.threads",
                "at least one worker is required",
            ));
        }
        if self.bytes_per_sec == 0 {
            return Err(FlowgridError::configuration(
                "pusher.bytes_per_sec",
                "rate must be positive",
            ));
        }
        if self.drain_timeout.is_zero() {
            return Err(FlowgridError::configuration(
                "pusher.drain_timeout",
                "drain timeout must be positive",
            ));
        }
        if self.max_queue_bytes == 0 {
            return Err(FlowgridError::configuration(
                "pusher.max_queue_bytes",
                "queue budget must be positive",
            ));
        }
        Ok(())
    }
}

/// Outbound flow-mod damping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DamperConfig {
    pub enabled: bool,

    /// Maximum number of remembered messages
    pub capacity: usize,

    /// How long an identical flow-mod is suppressed
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for DamperConfig {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_DAMPER_ENABLED,
            capacity: DEFAULT_DAMPER_CAPACITY,
            window: DEFAULT_DAMPER_WINDOW,
        }
    }
}

impl DamperConfig {
    pub(crate) fn apply_env(&mut self) -> FlowgridResult<()> {
        if let Ok(val) = std::env::var("FLOWGRID_DAMPER_CAPACITY") {
            self.capacity = val.parse().map_err(|_| {
                FlowgridError::configuration("damper.capacity", "invalid FLOWGRID_DAMPER_CAPACITY")
            })?;
        }
        self.window = parse_duration_from_env("FLOWGRID_DAMPER_WINDOW_MS", self.window);
        Ok(())
    }

    pub fn validate(&self) -> FlowgridResult<()> {
        if self.enabled && self.capacity == 0 {
            return Err(FlowgridError::configuration(
                "damper.capacity",
                "capacity must be positive when damping is enabled",
            ));
        }
        Ok(())
    }
}
