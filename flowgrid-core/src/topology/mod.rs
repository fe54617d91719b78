//! In-memory network graph
//!
//! [`Topology`] holds the current [`TopologySnapshot`] behind a read-write
//! lock. Mutations take the write lock and apply copy-on-write to the
//! snapshot, so every index is updated before any reader can see it, and a
//! reader that took [`Topology::snapshot`] keeps a consistent view for as long
//! as it likes without holding a lock.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::intent::PathIntent;
use crate::types::{Dpid, IntentId, LinkTuple, MacAddress, OnosInstanceId, PortNumber, Role, SwitchPort};

pub mod datastore;
pub mod elements;
pub mod intent_index;

pub use datastore::TopologyDatastore;
pub use elements::{Host, Link, Mastership, Port, Switch, ATTR_CONNECTED_SINCE, ATTR_NAME};
pub use intent_index::PathIntentMap;

/// Change applied to the topology
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    SwitchAdded(Switch),
    SwitchRemoved(Switch),
    PortAdded(Port),
    PortRemoved(Port),
    LinkAdded(Link),
    LinkRemoved(Link),
    HostAdded(Host),
    HostRemoved(Host),
    MastershipChanged(Mastership),
    MastershipRemoved { dpid: Dpid, instance_id: OnosInstanceId },
}

/// Immutable view of the network graph
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    switches: BTreeMap<Dpid, Switch>,
    ports: BTreeMap<SwitchPort, Port>,
    links: BTreeMap<LinkTuple, Link>,
    hosts: BTreeMap<MacAddress, Host>,
    hosts_by_port: BTreeMap<SwitchPort, BTreeSet<MacAddress>>,
    mastership: BTreeMap<Dpid, BTreeMap<OnosInstanceId, Role>>,
    intents: PathIntentMap,
    generation: u64,
}

fn port_range(dpid: Dpid) -> std::ops::RangeInclusive<SwitchPort> {
    SwitchPort::new(dpid, PortNumber(0))..=SwitchPort::new(dpid, PortNumber(u32::MAX))
}

impl TopologySnapshot {
    /// Incremented by every mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get_switch(&self, dpid: Dpid) -> Option<&Switch> {
        self.switches.get(&dpid)
    }

    pub fn get_switches(&self) -> impl Iterator<Item = &Switch> {
        self.switches.values()
    }

    pub fn get_port(&self, port: SwitchPort) -> Option<&Port> {
        self.ports.get(&port)
    }

    pub fn get_ports(&self, dpid: Dpid) -> impl Iterator<Item = &Port> {
        self.ports.range(port_range(dpid)).map(|(_, p)| p)
    }

    pub fn get_link(&self, tuple: &LinkTuple) -> Option<&Link> {
        self.links.get(tuple)
    }

    pub fn get_links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Links leaving `dpid`, ordered by source port then destination
    pub fn get_outgoing_links(&self, dpid: Dpid) -> impl Iterator<Item = &Link> {
        let lo = LinkTuple::new(
            SwitchPort::new(dpid, PortNumber(0)),
            SwitchPort::new(Dpid(0), PortNumber(0)),
        );
        let hi = LinkTuple::new(
            SwitchPort::new(dpid, PortNumber(u32::MAX)),
            SwitchPort::new(Dpid(u64::MAX), PortNumber(u32::MAX)),
        );
        self.links.range(lo..=hi).map(|(_, l)| l)
    }

    pub fn get_incoming_links(&self, dpid: Dpid) -> impl Iterator<Item = &Link> {
        self.links.values().filter(move |l| l.dst.dpid == dpid)
    }

    /// Links with either endpoint on `port`
    pub fn get_links_at(&self, port: SwitchPort) -> Vec<&Link> {
        self.links
            .values()
            .filter(|l| l.src == port || l.dst == port)
            .collect()
    }

    pub fn get_hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn get_host_by_mac(&self, mac: MacAddress) -> Option<&Host> {
        self.hosts.get(&mac)
    }

    /// Hosts attached to `port`
    pub fn get_hosts_at(&self, port: SwitchPort) -> Vec<&Host> {
        self.hosts_by_port
            .get(&port)
            .map(|macs| macs.iter().filter_map(|m| self.hosts.get(m)).collect())
            .unwrap_or_default()
    }

    pub fn get_master(&self, dpid: Dpid) -> Option<&OnosInstanceId> {
        self.mastership
            .get(&dpid)
            .and_then(|roles| roles.iter().find(|(_, r)| **r == Role::Master))
            .map(|(id, _)| id)
    }

    pub fn get_mastership(&self, dpid: Dpid) -> Vec<Mastership> {
        self.mastership
            .get(&dpid)
            .map(|roles| {
                roles
                    .iter()
                    .map(|(id, role)| Mastership {
                        dpid,
                        instance_id: id.clone(),
                        role: *role,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn path_intents(&self) -> &PathIntentMap {
        &self.intents
    }

    pub fn get_intents_by_link(&self, tuple: &LinkTuple) -> Vec<&PathIntent> {
        self.intents.get_intents_by_link(tuple)
    }

    pub fn get_intents_by_dpid(&self, dpid: Dpid) -> Vec<&PathIntent> {
        self.intents.get_intents_by_dpid(dpid)
    }

    pub fn get_intents_by_port(&self, dpid: Dpid, port: PortNumber) -> Vec<&PathIntent> {
        self.intents.get_intents_by_port(dpid, port)
    }

    /// `None` when the link is not in the topology
    pub fn get_available_bandwidth(&self, tuple: &LinkTuple) -> Option<f64> {
        self.links
            .get(tuple)
            .map(|link| self.intents.get_available_bandwidth(link))
    }

    fn detach_host_port(&mut self, mac: MacAddress, port: SwitchPort) {
        if let Some(macs) = self.hosts_by_port.get_mut(&port) {
            macs.remove(&mac);
            if macs.is_empty() {
                self.hosts_by_port.remove(&port);
            }
        }
    }

    fn remove_link_inner(&mut self, tuple: &LinkTuple, events: &mut Vec<TopologyEvent>) {
        if let Some(link) = self.links.remove(tuple) {
            events.push(TopologyEvent::LinkRemoved(link));
        }
    }

    fn remove_host_inner(&mut self, mac: MacAddress, events: &mut Vec<TopologyEvent>) {
        if let Some(host) = self.hosts.remove(&mac) {
            for port in &host.attachment_points {
                self.detach_host_port(mac, *port);
            }
            events.push(TopologyEvent::HostRemoved(host));
        }
    }

    /// Drop a port together with its links and host attachments
    fn remove_port_inner(&mut self, port: SwitchPort, events: &mut Vec<TopologyEvent>) {
        let Some(removed) = self.ports.remove(&port) else {
            return;
        };

        let doomed: Vec<LinkTuple> = self
            .links
            .keys()
            .filter(|t| t.src == port || t.dst == port)
            .copied()
            .collect();
        for tuple in doomed {
            self.remove_link_inner(&tuple, events);
        }

        let attached: Vec<MacAddress> = self
            .hosts_by_port
            .get(&port)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        for mac in attached {
            self.detach_host_port(mac, port);
            let orphaned = match self.hosts.get_mut(&mac) {
                Some(host) => {
                    host.attachment_points.remove(&port);
                    host.attachment_points.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.remove_host_inner(mac, events);
            } else if let Some(host) = self.hosts.get(&mac) {
                events.push(TopologyEvent::HostAdded(host.clone()));
            }
        }

        events.push(TopologyEvent::PortRemoved(removed));
    }
}

/// Read guard over the current snapshot; writers wait until it is dropped
pub struct TopologyReadGuard<'a> {
    guard: RwLockReadGuard<'a, Arc<TopologySnapshot>>,
}

impl Deref for TopologyReadGuard<'_> {
    type Target = TopologySnapshot;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

/// The mutable network graph; mutated only by discovery ingress and the
/// path runtime
#[derive(Debug, Default)]
pub struct Topology {
    current: RwLock<Arc<TopologySnapshot>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent view that does not hold the lock
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.read().clone()
    }

    /// Hold the read lock while iterating
    pub fn read(&self) -> TopologyReadGuard<'_> {
        TopologyReadGuard {
            guard: self.current.read(),
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut TopologySnapshot) -> R) -> R {
        let mut current = self.current.write();
        let snapshot = Arc::make_mut(&mut current);
        snapshot.generation += 1;
        f(snapshot)
    }

    /// Insert or replace a switch and the given ports
    pub fn put_switch(&self, switch: Switch, ports: Vec<Port>) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            let mut events = Vec::new();
            let dpid = switch.dpid;
            if t.switches.get(&dpid) != Some(&switch) {
                t.switches.insert(dpid, switch.clone());
                events.push(TopologyEvent::SwitchAdded(switch));
            } else {
                debug!("Switch {} already present", dpid);
            }
            for port in ports {
                if port.dpid != dpid {
                    warn!("Ignoring port {} listed under switch {}", port.switch_port(), dpid);
                    continue;
                }
                let key = port.switch_port();
                if t.ports.get(&key) != Some(&port) {
                    t.ports.insert(key, port.clone());
                    events.push(TopologyEvent::PortAdded(port));
                }
            }
            events
        })
    }

    /// Remove a switch, its ports, their links and host attachments, and its
    /// mastership records
    pub fn remove_switch(&self, dpid: Dpid) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            let mut events = Vec::new();
            let Some(switch) = t.switches.remove(&dpid) else {
                debug!("Switch {} not in topology", dpid);
                return events;
            };
            let ports: Vec<SwitchPort> = t.ports.range(port_range(dpid)).map(|(k, _)| *k).collect();
            for port in ports {
                t.remove_port_inner(port, &mut events);
            }
            if let Some(roles) = t.mastership.remove(&dpid) {
                for instance_id in roles.into_keys() {
                    events.push(TopologyEvent::MastershipRemoved { dpid, instance_id });
                }
            }
            events.push(TopologyEvent::SwitchRemoved(switch));
            events
        })
    }

    pub fn put_port(&self, port: Port) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            if !t.switches.contains_key(&port.dpid) {
                warn!("Port {} references unknown switch", port.switch_port());
                return Vec::new();
            }
            let key = port.switch_port();
            if t.ports.get(&key) == Some(&port) {
                return Vec::new();
            }
            t.ports.insert(key, port.clone());
            vec![TopologyEvent::PortAdded(port)]
        })
    }

    pub fn remove_port(&self, port: SwitchPort) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            let mut events = Vec::new();
            t.remove_port_inner(port, &mut events);
            events
        })
    }

    /// Insert or replace a link; both endpoint ports must exist
    pub fn put_link(&self, link: Link) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            if !t.ports.contains_key(&link.src) || !t.ports.contains_key(&link.dst) {
                warn!("Link {} references unknown ports", link.tuple());
                return Vec::new();
            }
            let tuple = link.tuple();
            if t.links.get(&tuple) == Some(&link) {
                return Vec::new();
            }
            t.links.insert(tuple, link.clone());
            vec![TopologyEvent::LinkAdded(link)]
        })
    }

    pub fn remove_link(&self, tuple: &LinkTuple) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            let mut events = Vec::new();
            t.remove_link_inner(tuple, &mut events);
            events
        })
    }

    /// Insert or replace a host; attachment points on unknown ports are dropped
    pub fn put_host(&self, mut host: Host) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            host.attachment_points.retain(|p| t.ports.contains_key(p));
            if host.attachment_points.is_empty() {
                warn!("Host {} has no known attachment point", host.mac);
                return Vec::new();
            }
            if let Some(old) = t.hosts.get(&host.mac).cloned() {
                for port in &old.attachment_points {
                    t.detach_host_port(host.mac, *port);
                }
            }
            for port in &host.attachment_points {
                t.hosts_by_port.entry(*port).or_default().insert(host.mac);
            }
            t.hosts.insert(host.mac, host.clone());
            vec![TopologyEvent::HostAdded(host)]
        })
    }

    pub fn remove_host(&self, mac: MacAddress) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            let mut events = Vec::new();
            t.remove_host_inner(mac, &mut events);
            events
        })
    }

    pub fn put_mastership(&self, mastership: Mastership) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            let roles = t.mastership.entry(mastership.dpid).or_default();
            if roles.get(&mastership.instance_id) == Some(&mastership.role) {
                return Vec::new();
            }
            roles.insert(mastership.instance_id.clone(), mastership.role);
            vec![TopologyEvent::MastershipChanged(mastership)]
        })
    }

    pub fn remove_mastership(&self, dpid: Dpid, instance_id: &OnosInstanceId) -> Vec<TopologyEvent> {
        self.mutate(|t| {
            let Some(roles) = t.mastership.get_mut(&dpid) else {
                return Vec::new();
            };
            if roles.remove(instance_id).is_none() {
                return Vec::new();
            }
            if roles.is_empty() {
                t.mastership.remove(&dpid);
            }
            vec![TopologyEvent::MastershipRemoved {
                dpid,
                instance_id: instance_id.clone(),
            }]
        })
    }

    /// Register resolved path intents in the impact index
    pub fn add_path_intents(&self, intents: Vec<PathIntent>) {
        if intents.is_empty() {
            return;
        }
        self.mutate(|t| {
            for intent in intents {
                t.intents.add_intent(intent);
            }
        })
    }

    pub fn remove_path_intents(&self, ids: &[IntentId]) -> Vec<PathIntent> {
        if ids.is_empty() {
            return Vec::new();
        }
        self.mutate(|t| ids.iter().filter_map(|id| t.intents.remove_intent(*id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;

    fn sp(d: u64, p: u32) -> SwitchPort {
        SwitchPort::new(d, p)
    }

    fn two_switches() -> Topology {
        let topo = Topology::new();
        topo.put_switch(Switch::new(1u64), vec![Port::new(1u64, 1u32), Port::new(1u64, 2u32)]);
        topo.put_switch(Switch::new(2u64), vec![Port::new(2u64, 1u32)]);
        topo
    }

    #[test]
    fn test_put_switch_is_idempotent() {
        let topo = Topology::new();
        let events = topo.put_switch(Switch::new(1u64), vec![Port::new(1u64, 1u32)]);
        assert_eq!(events.len(), 2);
        let events = topo.put_switch(Switch::new(1u64), vec![Port::new(1u64, 1u32)]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_link_requires_known_ports() {
        let topo = two_switches();
        assert!(topo.put_link(Link::new(sp(1, 2), sp(2, 9))).is_empty());
        assert_eq!(topo.put_link(Link::new(sp(1, 2), sp(2, 1))).len(), 1);
        assert_eq!(topo.snapshot().get_links().count(), 1);
        assert_eq!(topo.snapshot().get_outgoing_links(Dpid(1)).count(), 1);
        assert_eq!(topo.snapshot().get_incoming_links(Dpid(2)).count(), 1);
    }

    #[test]
    fn test_remove_switch_cascades() {
        let topo = two_switches();
        topo.put_link(Link::new(sp(1, 2), sp(2, 1)));
        topo.put_link(Link::new(sp(2, 1), sp(1, 2)));
        topo.put_host(Host::new(MacAddress([0xaa; 6]), sp(1, 1), 0));

        let events = topo.remove_switch(Dpid(1));
        let snapshot = topo.snapshot();
        assert!(snapshot.get_switch(Dpid(1)).is_none());
        assert_eq!(snapshot.get_ports(Dpid(1)).count(), 0);
        assert_eq!(snapshot.get_links().count(), 0);
        assert!(snapshot.get_host_by_mac(MacAddress([0xaa; 6])).is_none());
        assert!(matches!(events.last(), Some(TopologyEvent::SwitchRemoved(_))));

        // Every link still present references known ports
        for link in snapshot.get_links() {
            assert!(snapshot.get_port(link.src).is_some());
            assert!(snapshot.get_port(link.dst).is_some());
        }
    }

    #[test]
    fn test_host_keeps_remaining_attachment_points() {
        let topo = two_switches();
        let mac = MacAddress([0xbb; 6]);
        let mut host = Host::new(mac, sp(1, 1), 5);
        host.attachment_points.insert(sp(2, 1));
        topo.put_host(host);
        assert_eq!(topo.snapshot().get_hosts_at(sp(2, 1)).len(), 1);

        topo.remove_port(sp(1, 1));
        let snapshot = topo.snapshot();
        let host = snapshot.get_host_by_mac(mac).unwrap();
        assert_eq!(host.attachment_points.len(), 1);
        assert!(snapshot.get_hosts_at(sp(1, 1)).is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let topo = two_switches();
        let before = topo.snapshot();
        topo.remove_switch(Dpid(2));
        assert!(before.get_switch(Dpid(2)).is_some());
        assert!(topo.snapshot().get_switch(Dpid(2)).is_none());
        assert!(topo.snapshot().generation() > before.generation());
    }

    #[test]
    fn test_read_guard_sees_current_state() {
        let topo = two_switches();
        let guard = topo.read();
        let statuses: Vec<Status> = guard.get_switches().map(|s| s.status).collect();
        assert_eq!(statuses, vec![Status::Active, Status::Active]);
    }

    #[test]
    fn test_mastership_tracking() {
        let topo = two_switches();
        let a = OnosInstanceId::new("a").unwrap();
        let m = Mastership {
            dpid: Dpid(1),
            instance_id: a.clone(),
            role: Role::Master,
        };
        assert_eq!(topo.put_mastership(m.clone()).len(), 1);
        assert!(topo.put_mastership(m).is_empty());
        assert_eq!(topo.snapshot().get_master(Dpid(1)), Some(&a));
        assert_eq!(topo.remove_mastership(Dpid(1), &a).len(), 1);
        assert!(topo.snapshot().get_master(Dpid(1)).is_none());
    }
}
