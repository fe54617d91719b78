//! Default configuration values for flowgrid
//!
//! Every tunable lives here so that the defaults can be found in one place.

use std::time::Duration;

// Instance defaults
pub const DEFAULT_INSTANCE_ID: &str = "flowgrid-1";

// Datastore defaults
pub const DEFAULT_DATASTORE_NAMESPACE: &str = "onos";

// Topology defaults
pub const DEFAULT_ENABLE_CLEANUP: bool = true;
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

// Flow pusher defaults
pub const DEFAULT_PUSHER_THREADS: usize = 1;
pub const DEFAULT_PUSHER_BYTES_PER_SEC: u64 = 1024 * 1024; // 1MB/s per switch
pub const DEFAULT_PUSHER_QUEUE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_PUSHER_IDLE_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_PUSHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// Message damper defaults
pub const DEFAULT_DAMPER_ENABLED: bool = true;
pub const DEFAULT_DAMPER_CAPACITY: usize = 50_000;
pub const DEFAULT_DAMPER_WINDOW: Duration = Duration::from_millis(250);

// Registry defaults
pub const DEFAULT_ID_BLOCK_SIZE: u64 = 0x1_0000_0000;

// Synchroniser defaults
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(3);

// Event bus defaults
pub const DEFAULT_LISTENER_QUEUE_CAPACITY: usize = 1024;

// Flow entry defaults written into every flow-mod
pub const DEFAULT_FLOW_PRIORITY: u16 = 100;
pub const DEFAULT_IDLE_TIMEOUT: u16 = 0;
pub const DEFAULT_HARD_TIMEOUT: u16 = 0;
