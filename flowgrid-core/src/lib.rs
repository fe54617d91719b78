pub mod error;
pub mod common;
pub mod config;
pub mod types;
pub mod openflow;
pub mod datastore;
pub mod registry;
pub mod topology;
pub mod discovery;
pub mod trie;
pub mod intent;
pub mod flows;
pub mod pusher;
pub mod sync;
pub mod events;
pub mod api;
pub mod controller;

pub use config::ControllerConfig;
pub use controller::{Controller, LifecycleState};
pub use error::{ErrorKind, FlowgridError, FlowgridResult};
pub use trie::{PatriciaTrie, Prefix};
pub use types::{Dpid, FlowBatchId, FlowEntryId, FlowId, IntentId, LinkTuple, MacAddress, OnosInstanceId, PortNumber, SwitchPort};
