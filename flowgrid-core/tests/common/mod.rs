// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use flowgrid_core::config::ControllerConfig;
use flowgrid_core::datastore::{KvClient, RedbKvClient};
use flowgrid_core::openflow::{FlowMod, OfMessage, PortDesc, SwitchConnection, SwitchFeatures};
use flowgrid_core::registry::{ControllerRegistry, CoordinationService, InProcessCoordinator};
use flowgrid_core::{Controller, Dpid, FlowgridResult};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordination service and datastore shared by every instance of a test cluster
pub struct Cluster {
    pub coordinator: Arc<dyn CoordinationService>,
    pub client: Arc<dyn KvClient>,
}

/// Honour RUST_LOG in tests; repeated calls are ignored
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Cluster {
    pub fn new() -> Self {
        init_tracing();
        Self {
            coordinator: Arc::new(InProcessCoordinator::new()),
            client: Arc::new(RedbKvClient::in_memory().unwrap()),
        }
    }

    pub fn controller(&self, instance_id: &str) -> Arc<Controller> {
        self.controller_with(ControllerConfig::test(instance_id))
    }

    pub fn controller_with(&self, config: ControllerConfig) -> Arc<Controller> {
        Arc::new(Controller::new(config, self.coordinator.clone(), self.client.clone()).unwrap())
    }

    pub async fn started(&self, instance_id: &str) -> Arc<Controller> {
        let controller = self.controller(instance_id);
        controller.start().await.unwrap();
        controller
    }
}

/// Switch connection that records every message written to it
///
/// When bound to a controller, each barrier request is answered with a
/// barrier reply on a separate task.
pub struct RecordingSwitch {
    dpid: Dpid,
    written: Mutex<Vec<OfMessage>>,
    controller: Mutex<Option<Weak<Controller>>>,
}

impl RecordingSwitch {
    pub fn new(dpid: u64) -> Arc<Self> {
        Arc::new(Self {
            dpid: Dpid(dpid),
            written: Mutex::new(Vec::new()),
            controller: Mutex::new(None),
        })
    }

    pub fn acking(dpid: u64, controller: &Arc<Controller>) -> Arc<Self> {
        let switch = Self::new(dpid);
        *switch.controller.lock() = Some(Arc::downgrade(controller));
        switch
    }

    pub fn flow_mods(&self) -> Vec<FlowMod> {
        self.written
            .lock()
            .iter()
            .filter_map(|m| match m {
                OfMessage::FlowMod(fm) => Some(fm.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn barrier_xids(&self) -> Vec<u32> {
        self.written
            .lock()
            .iter()
            .filter_map(|m| match m {
                OfMessage::BarrierRequest { xid } => Some(*xid),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SwitchConnection for RecordingSwitch {
    fn dpid(&self) -> Dpid {
        self.dpid
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn write(&self, msg: OfMessage) -> FlowgridResult<()> {
        if let OfMessage::BarrierRequest { xid } = msg {
            let controller = self.controller.lock().as_ref().and_then(Weak::upgrade);
            if let Some(controller) = controller {
                let dpid = self.dpid;
                tokio::spawn(async move { controller.barrier_reply(dpid, xid) });
            }
        }
        self.written.lock().push(msg);
        Ok(())
    }
}

pub fn features(dpid: u64, ports: u32) -> SwitchFeatures {
    SwitchFeatures {
        dpid: Dpid(dpid),
        n_tables: 1,
        ports: (1..=ports).map(|p| PortDesc::new(p, format!("s{}-eth{}", dpid, p))).collect(),
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout: Duration) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(format!("Condition not met within {:?}", timeout))
}

/// Connect `switch` and wait until `controller` masters it and has published it
pub async fn connect_as_master(controller: &Arc<Controller>, switch: Arc<RecordingSwitch>, ports: u32) {
    let dpid = switch.dpid();
    controller
        .switch_connected(switch, features(dpid.value(), ports))
        .await
        .unwrap();
    wait_for_condition(
        || async move {
            controller.registry().has_control(dpid)
                && controller.topology().read().get_master(dpid).is_some()
        },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();
}
