//! Removal of switches no controller owns any more

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use crate::common::ResultContext;
use crate::events::{ControllerEvent, EventBus};
use crate::registry::{ControlChangeCallback, ControllerRegistry};
use crate::topology::{Topology, TopologyDatastore};
use crate::types::Dpid;

/// Periodic task that takes control of orphaned switches to mark them
/// INACTIVE
///
/// A switch in the topology without any controller in the registry is
/// contended for. Once control is granted no other instance can be writing
/// that switch, so it is removed from the topology, deactivated in the
/// datastore, and control is released again.
pub struct SwitchCleanup {
    topology: Arc<Topology>,
    store: TopologyDatastore,
    registry: Arc<dyn ControllerRegistry>,
    events: Arc<EventBus<ControllerEvent>>,
    runtime: Handle,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SwitchCleanup {
    /// Must be called from within a tokio runtime
    pub fn new(
        topology: Arc<Topology>,
        store: TopologyDatastore,
        registry: Arc<dyn ControllerRegistry>,
        events: Arc<EventBus<ControllerEvent>>,
        interval: Duration,
    ) -> Self {
        Self {
            topology,
            store,
            registry,
            events,
            runtime: Handle::current(),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Request control of every switch without a controller
    ///
    /// Returns the number of requests made. Registry errors are logged.
    pub async fn run_once(self: &Arc<Self>) -> usize {
        trace!("Checking for inactive switches");
        let dpids: Vec<Dpid> = self.topology.read().get_switches().map(|s| s.dpid).collect();
        let mut requested = 0;
        for dpid in dpids {
            match self.registry.get_controller_for_switch(dpid).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("Requesting control to set switch {} INACTIVE", dpid);
                    let callback = self.callback();
                    match self.registry.request_control(dpid, callback).await {
                        Ok(()) => requested += 1,
                        Err(e) => debug!("Control request for {} not made: {}", dpid, e),
                    }
                }
                Err(e) => error!("Registry error in switch cleanup: {}", e),
            }
        }
        requested
    }

    fn callback(self: &Arc<Self>) -> Arc<dyn ControlChangeCallback> {
        let cleanup: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |dpid: Dpid, has_control: bool| {
            if !has_control {
                return;
            }
            if let Some(cleanup) = cleanup.upgrade() {
                let runtime = cleanup.runtime.clone();
                runtime.spawn(async move { cleanup.remove_switch(dpid).await });
            }
        })
    }

    async fn remove_switch(&self, dpid: Dpid) {
        debug!("Got control to set switch {} INACTIVE", dpid);
        let events = self.topology.remove_switch(dpid);
        let _ = self
            .store
            .deactivate_switch(dpid)
            .await
            .log_error("deactivate orphaned switch");
        self.events.publish_all(events);
        let _ = self
            .registry
            .release_control(dpid)
            .await
            .log_error("release control after cleanup");
        info!("Switch {} removed by cleanup", dpid);
    }

    /// Run now and then at a fixed rate; a skipped tick is not made up
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let cleanup = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cleanup.run_once().await;
            }
        }));
        debug!("Switch cleanup running every {:?}", self.interval);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
