//! Mastership and cluster registry
//!
//! Each switch has a leader latch at `/controllers/<dpid>`; the instance
//! holding the latch is the switch's master. The registry also tracks which
//! controller instances are alive and hands out cluster-unique id blocks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FlowgridError, FlowgridResult};
use crate::types::{Dpid, OnosInstanceId};

pub mod coordination;
pub mod id_block;

pub use coordination::{
    CoordinationService, CounterValue, InProcessCoordinator, MembershipChange, ServiceInstance,
};
pub use id_block::{IdBlock, IdBlockAllocator, IdGenerator};

/// Service name under which controllers register
pub const CONTROLLER_SERVICE: &str = "controllers";
/// Prefix of the per-switch leader latches
pub const SWITCH_LATCH_PREFIX: &str = "/controllers/";
/// Counter backing id-block allocation
pub const ID_COUNTER: &str = "/flowgrid/id-counter";

/// Invoked once per mastership transition; must return quickly
pub trait ControlChangeCallback: Send + Sync {
    fn control_changed(&self, dpid: Dpid, has_control: bool);
}

impl<F> ControlChangeCallback for F
where
    F: Fn(Dpid, bool) + Send + Sync,
{
    fn control_changed(&self, dpid: Dpid, has_control: bool) {
        self(dpid, has_control)
    }
}

/// One controller contending for a switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRegistryEntry {
    pub controller_id: String,
    pub is_master: bool,
}

/// Registry operations used by discovery, the pusher and the synchroniser
#[async_trait]
pub trait ControllerRegistry: Send + Sync {
    async fn register_controller(&self, id: OnosInstanceId) -> FlowgridResult<()>;

    fn get_onos_instance_id(&self) -> Option<OnosInstanceId>;

    async fn get_all_controllers(&self) -> FlowgridResult<BTreeSet<String>>;

    async fn request_control(
        &self,
        dpid: Dpid,
        callback: Arc<dyn ControlChangeCallback>,
    ) -> FlowgridResult<()>;

    async fn release_control(&self, dpid: Dpid) -> FlowgridResult<()>;

    /// Local cached answer
    fn has_control(&self, dpid: Dpid) -> bool;

    async fn get_controller_for_switch(&self, dpid: Dpid) -> FlowgridResult<Option<String>>;

    async fn get_switches_controlled_by_controller(&self, id: &str) -> FlowgridResult<BTreeSet<Dpid>>;

    async fn get_all_switches(&self) -> FlowgridResult<BTreeMap<Dpid, Vec<ControllerRegistryEntry>>>;

    async fn allocate_unique_id_block(&self) -> FlowgridResult<IdBlock>;
}

struct SwitchLatch {
    has_control: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

/// Registry backed by a [`CoordinationService`]
pub struct ClusterRegistry {
    coordinator: Arc<dyn CoordinationService>,
    instance_id: RwLock<Option<OnosInstanceId>>,
    latches: Mutex<HashMap<Dpid, SwitchLatch>>,
    id_block_size: u64,
}

pub fn switch_latch_path(dpid: Dpid) -> String {
    format!("{}{:016x}", SWITCH_LATCH_PREFIX, dpid.value())
}

fn dpid_from_latch_path(path: &str) -> Option<Dpid> {
    let hex = path.strip_prefix(SWITCH_LATCH_PREFIX)?;
    u64::from_str_radix(hex, 16).ok().map(Dpid)
}

impl ClusterRegistry {
    pub fn new(coordinator: Arc<dyn CoordinationService>, id_block_size: u64) -> Self {
        Self {
            coordinator,
            instance_id: RwLock::new(None),
            latches: Mutex::new(HashMap::new()),
            id_block_size,
        }
    }

    fn require_instance(&self, operation: &str) -> FlowgridResult<OnosInstanceId> {
        self.instance_id.read().clone().ok_or_else(|| FlowgridError::InvalidOperation {
            operation: operation.to_string(),
            reason: "controller is not registered".to_string(),
        })
    }

    /// Switches this instance is contending for
    pub fn requested_switches(&self) -> Vec<Dpid> {
        let mut dpids: Vec<Dpid> = self.latches.lock().keys().copied().collect();
        dpids.sort();
        dpids
    }

    /// Switches this instance currently masters, from the local cache
    pub fn controlled_switches(&self) -> Vec<Dpid> {
        let mut dpids: Vec<Dpid> = self
            .latches
            .lock()
            .iter()
            .filter(|(_, latch)| latch.has_control.load(Ordering::SeqCst))
            .map(|(dpid, _)| *dpid)
            .collect();
        dpids.sort();
        dpids
    }
}

#[async_trait]
impl ControllerRegistry for ClusterRegistry {
    async fn register_controller(&self, id: OnosInstanceId) -> FlowgridResult<()> {
        let payload = serde_json::json!({ "controllerId": id.as_str() });
        self.coordinator
            .register_service(
                CONTROLLER_SERVICE,
                ServiceInstance {
                    id: id.as_str().to_string(),
                    payload,
                },
            )
            .await?;
        info!("Registered controller {}", id);
        *self.instance_id.write() = Some(id);
        Ok(())
    }

    fn get_onos_instance_id(&self) -> Option<OnosInstanceId> {
        self.instance_id.read().clone()
    }

    async fn get_all_controllers(&self) -> FlowgridResult<BTreeSet<String>> {
        Ok(self
            .coordinator
            .service_instances(CONTROLLER_SERVICE)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect())
    }

    async fn request_control(
        &self,
        dpid: Dpid,
        callback: Arc<dyn ControlChangeCallback>,
    ) -> FlowgridResult<()> {
        let instance = self.require_instance("request_control")?;
        let has_control = Arc::new(AtomicBool::new(false));
        {
            let mut latches = self.latches.lock();
            if latches.contains_key(&dpid) {
                return Err(FlowgridError::already_exists(format!(
                    "leader election for switch {}",
                    dpid
                )));
            }
            latches.insert(
                dpid,
                SwitchLatch {
                    has_control: has_control.clone(),
                    watcher: None,
                },
            );
        }

        let path = switch_latch_path(dpid);
        let mut rx = match self.coordinator.join_election(&path, instance.as_str()).await {
            Ok(rx) => rx,
            Err(e) => {
                self.latches.lock().remove(&dpid);
                return Err(e);
            }
        };
        debug!("Joined election for switch {}", dpid);

        let flag = has_control.clone();
        let watcher = tokio::spawn(async move {
            while let Some(is_leader) = rx.recv().await {
                let previous = flag.swap(is_leader, Ordering::SeqCst);
                if previous != is_leader {
                    info!(
                        "Mastership of switch {} {}",
                        dpid,
                        if is_leader { "gained" } else { "lost" }
                    );
                    callback.control_changed(dpid, is_leader);
                }
            }
        });

        match self.latches.lock().get_mut(&dpid) {
            Some(latch) if Arc::ptr_eq(&latch.has_control, &has_control) => {
                latch.watcher = Some(watcher);
            }
            // Released while we were joining
            _ => watcher.abort(),
        }
        Ok(())
    }

    async fn release_control(&self, dpid: Dpid) -> FlowgridResult<()> {
        let Some(latch) = self.latches.lock().remove(&dpid) else {
            debug!("release_control for switch {} without a running election", dpid);
            return Ok(());
        };
        if let Some(watcher) = latch.watcher {
            watcher.abort();
        }
        latch.has_control.store(false, Ordering::SeqCst);

        let instance = self.require_instance("release_control")?;
        self.coordinator
            .leave_election(&switch_latch_path(dpid), instance.as_str())
            .await?;
        debug!("Released control of switch {}", dpid);
        Ok(())
    }

    fn has_control(&self, dpid: Dpid) -> bool {
        self.latches
            .lock()
            .get(&dpid)
            .map(|latch| latch.has_control.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn get_controller_for_switch(&self, dpid: Dpid) -> FlowgridResult<Option<String>> {
        self.coordinator.leader(&switch_latch_path(dpid)).await
    }

    async fn get_switches_controlled_by_controller(&self, id: &str) -> FlowgridResult<BTreeSet<Dpid>> {
        let mut switches = BTreeSet::new();
        for path in self.coordinator.election_paths(SWITCH_LATCH_PREFIX).await? {
            if self.coordinator.leader(&path).await?.as_deref() == Some(id) {
                match dpid_from_latch_path(&path) {
                    Some(dpid) => {
                        switches.insert(dpid);
                    }
                    None => warn!("Ignoring malformed latch path {}", path),
                }
            }
        }
        Ok(switches)
    }

    async fn get_all_switches(&self) -> FlowgridResult<BTreeMap<Dpid, Vec<ControllerRegistryEntry>>> {
        let mut all = BTreeMap::new();
        for path in self.coordinator.election_paths(SWITCH_LATCH_PREFIX).await? {
            let Some(dpid) = dpid_from_latch_path(&path) else {
                continue;
            };
            let entries = self
                .coordinator
                .participants(&path)
                .await?
                .into_iter()
                .enumerate()
                .map(|(i, controller_id)| ControllerRegistryEntry {
                    controller_id,
                    is_master: i == 0,
                })
                .collect();
            all.insert(dpid, entries);
        }
        Ok(all)
    }

    async fn allocate_unique_id_block(&self) -> FlowgridResult<IdBlock> {
        let counter = self.coordinator.add_and_get(ID_COUNTER, 1).await?;
        let start = counter
            .pre_value
            .checked_mul(self.id_block_size)
            .ok_or_else(|| FlowgridError::internal("id space exhausted"))?;
        let block = IdBlock::new(start, self.id_block_size);
        debug!("Allocated id block [{:#x}, {:#x})", block.start, block.end());
        Ok(block)
    }
}

#[async_trait]
impl IdBlockAllocator for ClusterRegistry {
    async fn allocate_unique_id_block(&self) -> FlowgridResult<IdBlock> {
        ControllerRegistry::allocate_unique_id_block(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(coord: &Arc<InProcessCoordinator>) -> ClusterRegistry {
        ClusterRegistry::new(coord.clone(), 0x1_0000_0000)
    }

    #[test]
    fn test_latch_path_round_trip() {
        let path = switch_latch_path(Dpid(0xabc));
        assert_eq!(path, "/controllers/0000000000000abc");
        assert_eq!(dpid_from_latch_path(&path), Some(Dpid(0xabc)));
        assert_eq!(dpid_from_latch_path("/other/1"), None);
    }

    #[tokio::test]
    async fn test_instance_id_before_and_after_registration() {
        let coord = Arc::new(InProcessCoordinator::new());
        let reg = registry(&coord);
        assert!(reg.get_onos_instance_id().is_none());

        let cb: Arc<dyn ControlChangeCallback> = Arc::new(|_: Dpid, _: bool| {});
        let err = reg.request_control(Dpid(1), cb).await.unwrap_err();
        assert_eq!(err.http_status(), 400);

        reg.register_controller(OnosInstanceId::new("a").unwrap()).await.unwrap();
        assert_eq!(reg.get_onos_instance_id().unwrap().as_str(), "a");
        assert!(reg.get_all_controllers().await.unwrap().contains("a"));
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected() {
        let coord = Arc::new(InProcessCoordinator::new());
        let reg = registry(&coord);
        reg.register_controller(OnosInstanceId::new("a").unwrap()).await.unwrap();

        let cb: Arc<dyn ControlChangeCallback> = Arc::new(|_: Dpid, _: bool| {});
        reg.request_control(Dpid(5), cb.clone()).await.unwrap();
        let err = reg.request_control(Dpid(5), cb).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
    }

    #[derive(Default)]
    struct Transitions(Mutex<Vec<bool>>);

    impl ControlChangeCallback for Transitions {
        fn control_changed(&self, _dpid: Dpid, has_control: bool) {
            self.0.lock().push(has_control);
        }
    }

    async fn until(check: impl Fn() -> bool) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_mastership_regained_after_session_restore() {
        let coord = Arc::new(InProcessCoordinator::new());
        let reg = registry(&coord);
        reg.register_controller(OnosInstanceId::new("a").unwrap()).await.unwrap();

        let transitions = Arc::new(Transitions::default());
        reg.request_control(Dpid(1), transitions.clone()).await.unwrap();
        until(|| reg.has_control(Dpid(1))).await;

        coord.expire_session("a");
        until(|| !reg.has_control(Dpid(1))).await;

        coord.restore_session("a");
        until(|| reg.has_control(Dpid(1))).await;
        assert_eq!(*transitions.0.lock(), vec![true, false, true]);
        assert_eq!(reg.get_controller_for_switch(Dpid(1)).await.unwrap().as_deref(), Some("a"));

        // Still contending, so a second request is refused
        let err = reg.request_control(Dpid(1), transitions.clone()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);

        reg.release_control(Dpid(1)).await.unwrap();
        assert_eq!(reg.get_controller_for_switch(Dpid(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_id_blocks_are_consecutive_multiples() {
        let coord = Arc::new(InProcessCoordinator::new());
        let reg = ClusterRegistry::new(coord, 100);
        let a = ControllerRegistry::allocate_unique_id_block(&reg).await.unwrap();
        let b = ControllerRegistry::allocate_unique_id_block(&reg).await.unwrap();
        assert_eq!(a, IdBlock::new(0, 100));
        assert_eq!(b, IdBlock::new(100, 100));
    }
}
