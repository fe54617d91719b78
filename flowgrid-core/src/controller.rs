//! Controller instance: owns every component and wires switch events through
//! mastership, discovery, the pusher and the synchroniser

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::ApiHandlers;
use crate::common::ResultContext;
use crate::config::ControllerConfig;
use crate::datastore::{Datastore, KvClient, RedbKvClient};
use crate::discovery::{SwitchCleanup, TopologyPublisher};
use crate::error::{FlowgridError, FlowgridResult};
use crate::events::{ControllerEvent, EventBus, Subscription};
use crate::flows::FlowManager;
use crate::intent::{IntentBatchReport, IntentOperationList, IntentRuntime};
use crate::openflow::{PortReason, PortStatus, SwitchConnection, SwitchFeatures};
use crate::pusher::{FlowPusher, MessageDamper, PushNotice};
use crate::registry::{ClusterRegistry, CoordinationService, ControllerRegistry, InProcessCoordinator};
use crate::sync::FlowSynchronizer;
use crate::topology::{Topology, TopologyDatastore};
use crate::types::{Dpid, OnosInstanceId};

/// Lifecycle of a controller instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

/// A connected switch as seen by this instance
struct ConnectedSwitch {
    features: SwitchFeatures,
    connected_since: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct Controller {
    config: ControllerConfig,
    instance_id: OnosInstanceId,
    state: RwLock<LifecycleState>,
    registry: Arc<ClusterRegistry>,
    events: Arc<EventBus<ControllerEvent>>,
    topology: Arc<Topology>,
    topology_store: TopologyDatastore,
    flows: Arc<FlowManager>,
    publisher: Arc<TopologyPublisher>,
    pusher: Arc<FlowPusher>,
    notices: Mutex<Option<mpsc::UnboundedReceiver<PushNotice>>>,
    sync: Arc<FlowSynchronizer>,
    intents: IntentRuntime,
    cleanup: Option<Arc<SwitchCleanup>>,
    connected: DashMap<Dpid, ConnectedSwitch>,
}

impl Controller {
    /// Build an instance on a shared coordination service and key-value store
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: ControllerConfig,
        coordinator: Arc<dyn CoordinationService>,
        client: Arc<dyn KvClient>,
    ) -> FlowgridResult<Self> {
        config.validate()?;
        let instance_id = OnosInstanceId::new(config.instance_id.clone())?;

        let registry = Arc::new(ClusterRegistry::new(coordinator, config.registry.id_block_size));
        let events = Arc::new(EventBus::new(config.events.listener_capacity));
        let topology = Arc::new(Topology::new());
        let store = Arc::new(Datastore::new(client, config.datastore.namespace.clone()));
        let topology_store = TopologyDatastore::new(store.clone());

        let flows = Arc::new(
            FlowManager::new(store, registry.clone(), events.clone()).with_topology(topology.clone()),
        );
        let publisher = Arc::new(TopologyPublisher::new(
            topology.clone(),
            topology_store.clone(),
            registry.clone(),
            events.clone(),
        ));

        let damper = MessageDamper::from_config(&config.damper)?.map(Arc::new);
        let (pusher, notices) = FlowPusher::new(config.pusher.clone(), damper, events.clone());
        let pusher = Arc::new(pusher);
        let sync = Arc::new(FlowSynchronizer::new(
            registry.clone(),
            flows.clone(),
            pusher.clone(),
            config.sync.interval,
        ));
        let intents = IntentRuntime::new(
            topology.clone(),
            flows.clone(),
            sync.clone(),
            registry.clone(),
            registry.clone(),
            instance_id.as_str(),
        )
        .with_default_deadline(config.intents.default_deadline);

        let cleanup = config.topology.enable_cleanup.then(|| {
            Arc::new(SwitchCleanup::new(
                topology.clone(),
                topology_store.clone(),
                registry.clone(),
                events.clone(),
                config.topology.cleanup_interval,
            ))
        });

        Ok(Self {
            config,
            instance_id,
            state: RwLock::new(LifecycleState::Created),
            registry,
            events,
            topology,
            topology_store,
            flows,
            publisher,
            pusher,
            notices: Mutex::new(Some(notices)),
            sync,
            intents,
            cleanup,
            connected: DashMap::new(),
        })
    }

    /// Standalone instance: in-process coordination and the configured store
    pub fn from_config(config: ControllerConfig) -> FlowgridResult<Self> {
        let client: Arc<dyn KvClient> = match &config.datastore.dbconf {
            Some(path) => Arc::new(RedbKvClient::open(path)?),
            None => Arc::new(RedbKvClient::in_memory()?),
        };
        Self::new(config, Arc::new(InProcessCoordinator::new()), client)
    }

    pub fn state(&self) -> LifecycleState {
        self.state.read().clone()
    }

    fn set_state(&self, state: LifecycleState) {
        debug!("Controller {} is {:?}", self.instance_id, state);
        *self.state.write() = state;
    }

    pub async fn start(&self) -> FlowgridResult<()> {
        if *self.state.read() != LifecycleState::Created {
            return Err(FlowgridError::InvalidOperation {
                operation: "start".to_string(),
                reason: format!("controller is {:?}", self.state()),
            });
        }
        self.set_state(LifecycleState::Starting);
        match self.start_components().await {
            Ok(()) => {
                self.set_state(LifecycleState::Running);
                info!("Controller {} running", self.instance_id);
                Ok(())
            }
            Err(e) => {
                error!("Controller {} failed to start: {}", self.instance_id, e);
                self.set_state(LifecycleState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn start_components(&self) -> FlowgridResult<()> {
        self.registry.register_controller(self.instance_id.clone()).await?;
        let loaded = self.topology_store.load_into(&self.topology).await?;
        info!("Loaded {} switches from the datastore", loaded);

        self.events.start();
        self.pusher.start();
        let notices = self
            .notices
            .lock()
            .take()
            .ok_or_else(|| FlowgridError::internal("push notice receiver already taken"))?;
        self.sync.start(notices);
        if let Some(cleanup) = &self.cleanup {
            cleanup.start();
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        if matches!(self.state(), LifecycleState::Stopping | LifecycleState::Stopped) {
            return;
        }
        self.set_state(LifecycleState::Stopping);
        if let Some(cleanup) = &self.cleanup {
            cleanup.stop();
        }
        self.sync.shutdown();
        self.pusher.shutdown().await;

        let dpids: Vec<Dpid> = self.connected.iter().map(|e| *e.key()).collect();
        for dpid in dpids {
            let _ = self
                .registry
                .release_control(dpid)
                .await
                .log_if_error("release control on shutdown");
        }
        self.connected.clear();
        self.events.close();
        self.set_state(LifecycleState::Stopped);
        info!("Controller {} stopped", self.instance_id);
    }

    /// A switch completed its handshake with this instance
    ///
    /// The switch joins the mastership election. It is published to the
    /// topology and synchronised once this instance is granted control.
    pub async fn switch_connected(
        self: &Arc<Self>,
        conn: Arc<dyn SwitchConnection>,
        features: SwitchFeatures,
    ) -> FlowgridResult<()> {
        let dpid = features.dpid;
        if conn.dpid() != dpid {
            return Err(FlowgridError::invalid_input(
                "features",
                format!("connection for {} reported features of {}", conn.dpid(), dpid),
            ));
        }
        if self.connected.contains_key(&dpid) {
            return Err(FlowgridError::already_exists(format!("connection to switch {}", dpid)));
        }

        self.pusher.add_switch(conn);
        self.connected.insert(
            dpid,
            ConnectedSwitch {
                features,
                connected_since: now_millis(),
            },
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let callback = move |dpid: Dpid, has_control: bool| {
            if let Some(controller) = weak.upgrade() {
                tokio::spawn(async move { controller.control_changed(dpid, has_control).await });
            }
        };
        if let Err(e) = self.registry.request_control(dpid, Arc::new(callback)).await {
            self.pusher.delete_queue(dpid, true);
            self.connected.remove(&dpid);
            return Err(e);
        }
        info!("Switch {} connected", dpid);
        Ok(())
    }

    async fn control_changed(self: Arc<Self>, dpid: Dpid, has_control: bool) {
        if has_control {
            let Some((features, since)) = self
                .connected
                .get(&dpid)
                .map(|sw| (sw.features.clone(), sw.connected_since))
            else {
                debug!("Granted control of {} after it disconnected", dpid);
                return;
            };
            self.publisher.switch_activated(&features, since).await;
            self.sync.kick(dpid);
        } else {
            self.publisher.switch_disconnected(dpid).await;
        }
    }

    /// The connection to a switch was lost
    ///
    /// Queued messages are dropped and control is released. The switch stays
    /// in the topology until the cleanup task removes it.
    pub async fn switch_disconnected(&self, dpid: Dpid) {
        if self.connected.remove(&dpid).is_none() {
            debug!("Disconnect of unknown switch {}", dpid);
        }
        let dropped = self.pusher.delete_queue(dpid, true);
        if dropped > 0 {
            debug!("Dropped {} queued messages for {}", dropped, dpid);
        }
        let _ = self
            .registry
            .release_control(dpid)
            .await
            .log_if_error("release control on disconnect");
        self.publisher.switch_disconnected(dpid).await;
        info!("Switch {} disconnected", dpid);
    }

    pub async fn port_status(&self, dpid: Dpid, status: PortStatus) {
        match status.reason {
            PortReason::Add | PortReason::Modify => self.publisher.switch_port_added(dpid, &status.desc).await,
            PortReason::Delete => self.publisher.switch_port_removed(dpid, status.desc.number).await,
        }
    }

    pub fn barrier_reply(&self, dpid: Dpid, xid: u32) {
        self.pusher.barrier_reply(dpid, xid);
    }

    pub async fn submit_intents(
        &self,
        ops: IntentOperationList,
        deadline: Option<Duration>,
    ) -> FlowgridResult<IntentBatchReport> {
        if self.state() != LifecycleState::Running {
            warn!("Intent batch submitted while controller is {:?}", self.state());
        }
        self.intents.execute(ops, deadline).await
    }

    /// Subscribe before [`Controller::start`]
    pub fn subscribe(&self, name: &str) -> FlowgridResult<Subscription<ControllerEvent>> {
        self.events.subscribe(name)
    }

    pub fn api(&self) -> ApiHandlers {
        ApiHandlers::new(self.topology.clone(), self.flows.clone(), self.registry.clone())
    }

    pub fn instance_id(&self) -> &OnosInstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn topology_store(&self) -> &TopologyDatastore {
        &self.topology_store
    }

    pub fn flows(&self) -> &Arc<FlowManager> {
        &self.flows
    }

    pub fn publisher(&self) -> &Arc<TopologyPublisher> {
        &self.publisher
    }

    pub fn pusher(&self) -> &Arc<FlowPusher> {
        &self.pusher
    }

    pub fn synchronizer(&self) -> &Arc<FlowSynchronizer> {
        &self.sync
    }

    pub fn intents(&self) -> &IntentRuntime {
        &self.intents
    }

    pub fn cleanup(&self) -> Option<&Arc<SwitchCleanup>> {
        self.cleanup.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow::{OfMessage, PortDesc};
    use async_trait::async_trait;

    struct NullSwitch(Dpid);

    #[async_trait]
    impl SwitchConnection for NullSwitch {
        fn dpid(&self) -> Dpid {
            self.0
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn write(&self, _msg: OfMessage) -> FlowgridResult<()> {
            Ok(())
        }
    }

    fn features(dpid: u64) -> SwitchFeatures {
        SwitchFeatures {
            dpid: Dpid(dpid),
            n_tables: 1,
            ports: vec![PortDesc::new(1u32, "eth1"), PortDesc::new(2u32, "eth2")],
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let controller = Controller::from_config(ControllerConfig::test("c1")).unwrap();
        assert_eq!(controller.state(), LifecycleState::Created);
        controller.start().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Running);
        assert!(controller.start().await.is_err());
        controller.shutdown().await;
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_before_start_is_rejected() {
        let controller = Arc::new(Controller::from_config(ControllerConfig::test("c1")).unwrap());
        let result = controller
            .switch_connected(Arc::new(NullSwitch(Dpid(1))), features(1))
            .await;
        assert!(result.is_err());
        assert!(!controller.pusher().is_registered(Dpid(1)));
    }

    #[tokio::test]
    async fn test_connected_switch_is_published() {
        let controller = Arc::new(Controller::from_config(ControllerConfig::test("c1")).unwrap());
        controller.start().await.unwrap();
        controller
            .switch_connected(Arc::new(NullSwitch(Dpid(1))), features(1))
            .await
            .unwrap();

        let mut published = false;
        for _ in 0..100 {
            if controller.topology().read().get_master(Dpid(1)).is_some() {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(published);
        assert!(controller.topology().read().get_switch(Dpid(1)).is_some());
        assert_eq!(controller.topology().read().get_ports(Dpid(1)).count(), 2);
        assert_eq!(
            controller.topology().read().get_master(Dpid(1)).map(|id| id.as_str().to_string()),
            Some("c1".to_string())
        );

        controller.switch_disconnected(Dpid(1)).await;
        assert!(controller.topology().read().get_master(Dpid(1)).is_none());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_mismatched_features_rejected() {
        let controller = Arc::new(Controller::from_config(ControllerConfig::test("c1")).unwrap());
        controller.start().await.unwrap();
        let err = controller
            .switch_connected(Arc::new(NullSwitch(Dpid(1))), features(2))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
        controller.shutdown().await;
    }
}
