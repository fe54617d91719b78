//! Discovery ingress
//!
//! [`TopologyPublisher`] turns switch, port, link and host discoveries into
//! topology mutations. A write only happens on the instance that masters the
//! switch owning the event: the destination switch for a link, the local
//! switch otherwise. Everything else is logged and dropped. Each applied
//! change is persisted through [`TopologyDatastore`] and published on the
//! event bus. Failures are logged, never returned to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::events::{ControllerEvent, EventBus};
use crate::openflow::{PortDesc, SwitchFeatures};
use crate::registry::ControllerRegistry;
use crate::topology::{
    Host, Link, Mastership, Port, Switch, Topology, TopologyDatastore, TopologyEvent, ATTR_CONNECTED_SINCE,
    ATTR_NAME,
};
use crate::types::{Dpid, LinkTuple, MacAddress, PortNumber, Role, SwitchPort};

pub mod cleanup;

pub use cleanup::SwitchCleanup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkOperation {
    Added,
    Updated,
    Removed,
}

/// LLDP side of link discovery
#[async_trait]
pub trait LinkDiscoveryService: Send + Sync {
    /// Allow LLDP probing on a port again
    async fn remove_from_suppress_lldps(&self, dpid: Dpid, port: PortNumber);
}

/// A host seen behind a switch port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEvent {
    pub mac: MacAddress,
    pub attachment: SwitchPort,
    /// Milliseconds since the epoch
    pub last_seen: u64,
}

pub struct TopologyPublisher {
    topology: Arc<Topology>,
    store: TopologyDatastore,
    registry: Arc<dyn ControllerRegistry>,
    events: Arc<EventBus<ControllerEvent>>,
    link_discovery: Option<Arc<dyn LinkDiscoveryService>>,
}

impl TopologyPublisher {
    pub fn new(
        topology: Arc<Topology>,
        store: TopologyDatastore,
        registry: Arc<dyn ControllerRegistry>,
        events: Arc<EventBus<ControllerEvent>>,
    ) -> Self {
        Self {
            topology,
            store,
            registry,
            events,
            link_discovery: None,
        }
    }

    pub fn with_link_discovery(mut self, link_discovery: Arc<dyn LinkDiscoveryService>) -> Self {
        self.link_discovery = Some(link_discovery);
        self
    }

    fn is_master(&self, dpid: Dpid, what: &str) -> bool {
        let master = self.registry.has_control(dpid);
        if !master {
            debug!("Not the master for switch {}. Suppressed {}", dpid, what);
        }
        master
    }

    async fn unsuppress(&self, dpid: Dpid, port: PortNumber) {
        if let Some(link_discovery) = &self.link_discovery {
            link_discovery.remove_from_suppress_lldps(dpid, port).await;
        }
    }

    /// Write `events` to the datastore and publish them
    async fn persist(&self, events: Vec<TopologyEvent>) {
        for event in &events {
            let result = match event {
                TopologyEvent::SwitchAdded(switch) => self.store.add_switch(switch, &[]).await.map(|_| ()),
                TopologyEvent::SwitchRemoved(switch) => self.store.deactivate_switch(switch.dpid).await.map(|_| ()),
                TopologyEvent::PortAdded(port) => self.store.add_port(port).await,
                TopologyEvent::PortRemoved(port) => self.store.deactivate_port(port.switch_port()).await,
                TopologyEvent::LinkAdded(link) => self.store.add_link(link).await,
                TopologyEvent::LinkRemoved(link) => self.store.remove_link(&link.tuple()).await,
                TopologyEvent::HostAdded(host) => self.store.add_host(host).await,
                TopologyEvent::HostRemoved(host) => self.store.remove_host(host.mac).await,
                TopologyEvent::MastershipChanged(mastership) => self.store.put_mastership(mastership).await,
                TopologyEvent::MastershipRemoved { dpid, instance_id } => {
                    self.store.remove_mastership(*dpid, instance_id).await
                }
            };
            if let Err(e) = result {
                warn!("Persisting {:?} failed: {}", event, e);
            }
        }
        self.events.publish_all(events);
    }

    pub async fn link_discovery_update(&self, operation: LinkOperation, tuple: LinkTuple) {
        match operation {
            LinkOperation::Added => self.link_added(Link::from_tuple(tuple)).await,
            LinkOperation::Updated => {}
            LinkOperation::Removed => {
                if !self.is_master(tuple.dst.dpid, "link remove") {
                    return;
                }
                let events = self.topology.remove_link(&tuple);
                self.persist(events).await;
            }
        }
    }

    /// Add a link with known attributes such as capacity
    pub async fn link_added(&self, link: Link) {
        if !self.is_master(link.dst.dpid, "link add") {
            return;
        }
        let events = self.topology.put_link(link);
        self.persist(events).await;
    }

    pub async fn switch_port_added(&self, dpid: Dpid, desc: &PortDesc) {
        if !self.is_master(dpid, "port add") {
            return;
        }
        let port = Port::new(dpid, desc.number).with_attribute(ATTR_NAME, desc.name.clone());
        let events = self.topology.put_port(port);
        self.persist(events).await;
        self.unsuppress(dpid, desc.number).await;
    }

    pub async fn switch_port_removed(&self, dpid: Dpid, number: PortNumber) {
        if !self.is_master(dpid, "port remove") {
            return;
        }
        let events = self.topology.remove_port(SwitchPort::new(dpid, number));
        self.persist(events).await;
    }

    /// A switch finished its handshake with this instance
    ///
    /// `connected_since` is in milliseconds since the epoch.
    pub async fn switch_activated(&self, features: &SwitchFeatures, connected_since: u64) {
        let dpid = features.dpid;
        if !self.is_master(dpid, "switch add") {
            return;
        }

        let switch = Switch::new(dpid).with_attribute(ATTR_CONNECTED_SINCE, connected_since.to_string());
        let ports: Vec<Port> = features
            .ports
            .iter()
            .map(|desc| Port::new(dpid, desc.number).with_attribute(ATTR_NAME, desc.name.clone()))
            .collect();

        match self.store.add_switch(&switch, &ports).await {
            Ok(true) => {}
            Ok(false) => warn!("Switch {} was only partly written", dpid),
            Err(e) => warn!("Writing switch {} failed: {}", dpid, e),
        }
        let events = self.topology.put_switch(switch, ports);
        self.events.publish_all(events);

        if let Some(instance_id) = self.registry.get_onos_instance_id() {
            let mastership = Mastership {
                dpid,
                instance_id,
                role: Role::Master,
            };
            let events = self.topology.put_mastership(mastership);
            self.persist(events).await;
        }

        for desc in &features.ports {
            self.unsuppress(dpid, desc.number).await;
        }
        info!("Switch {} activated with {} ports", dpid, features.ports.len());
    }

    /// Drop this instance's mastership record; the switch itself stays until
    /// the cleanup task removes it
    pub async fn switch_disconnected(&self, dpid: Dpid) {
        let Some(instance_id) = self.registry.get_onos_instance_id() else {
            return;
        };
        let events = self.topology.remove_mastership(dpid, &instance_id);
        self.persist(events).await;
        debug!("Switch {} disconnected from {}", dpid, instance_id);
    }

    pub async fn host_added(&self, event: HostEvent) {
        if !self.is_master(event.attachment.dpid, "host add") {
            return;
        }
        let host = Host::new(event.mac, event.attachment, event.last_seen);
        let events = self.topology.put_host(host);
        self.persist(events).await;
    }

    pub async fn host_removed(&self, mac: MacAddress) {
        let attachments: Vec<Dpid> = match self.topology.read().get_host_by_mac(mac) {
            Some(host) => host.attachment_points.iter().map(|ap| ap.dpid).collect(),
            None => {
                debug!("Host {} is not in the topology", mac);
                return;
            }
        };
        if !attachments.iter().any(|dpid| self.registry.has_control(*dpid)) {
            debug!("Not the master for any switch of host {}. Suppressed host remove", mac);
            return;
        }
        let events = self.topology.remove_host(mac);
        self.persist(events).await;
    }
}
