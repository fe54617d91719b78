//! Impact index of installed path intents
//!
//! Each path intent is indexed under both endpoints of every link it
//! traverses, so the intents affected by a port or switch going away can be
//! found without scanning.

use std::collections::{BTreeMap, BTreeSet};

use crate::intent::PathIntent;
use crate::topology::elements::Link;
use crate::types::{Dpid, IntentId, LinkTuple, PortNumber, SwitchPort};

#[derive(Debug, Clone, Default)]
pub struct PathIntentMap {
    intents: BTreeMap<IntentId, PathIntent>,
    by_port: BTreeMap<SwitchPort, BTreeSet<IntentId>>,
}

impl PathIntentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Insert or replace a path intent
    pub fn add_intent(&mut self, intent: PathIntent) {
        self.remove_intent(intent.id);
        for link in &intent.path {
            for port in [link.src, link.dst] {
                self.by_port.entry(port).or_default().insert(intent.id);
            }
        }
        self.intents.insert(intent.id, intent);
    }

    pub fn remove_intent(&mut self, id: IntentId) -> Option<PathIntent> {
        let intent = self.intents.remove(&id)?;
        for link in &intent.path {
            for port in [link.src, link.dst] {
                if let Some(ids) = self.by_port.get_mut(&port) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.by_port.remove(&port);
                    }
                }
            }
        }
        Some(intent)
    }

    pub fn get_intent(&self, id: IntentId) -> Option<&PathIntent> {
        self.intents.get(&id)
    }

    pub fn intents(&self) -> impl Iterator<Item = &PathIntent> {
        self.intents.values()
    }

    pub fn get_intents_by_port(&self, dpid: Dpid, port: PortNumber) -> Vec<&PathIntent> {
        self.by_port
            .get(&SwitchPort::new(dpid, port))
            .map(|ids| ids.iter().filter_map(|id| self.intents.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_intents_by_dpid(&self, dpid: Dpid) -> Vec<&PathIntent> {
        let lo = SwitchPort::new(dpid, PortNumber(0));
        let hi = SwitchPort::new(dpid, PortNumber(u32::MAX));
        let ids: BTreeSet<IntentId> = self
            .by_port
            .range(lo..=hi)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.iter().filter_map(|id| self.intents.get(id)).collect()
    }

    /// Intents using the link, found through its source port
    pub fn get_intents_by_link(&self, tuple: &LinkTuple) -> Vec<&PathIntent> {
        self.get_intents_by_port(tuple.src.dpid, tuple.src.port)
            .into_iter()
            .filter(|intent| intent.path.contains(tuple))
            .collect()
    }

    /// Capacity left on `link` after the bandwidth of every intent using it.
    /// Unbounded links stay unbounded; NaN and infinite reservations are
    /// ignored.
    pub fn get_available_bandwidth(&self, link: &Link) -> f64 {
        if link.capacity.is_infinite() {
            return link.capacity;
        }
        let reserved: f64 = self
            .get_intents_by_link(&link.tuple())
            .iter()
            .map(|intent| intent.bandwidth)
            .filter(|bw| bw.is_finite())
            .sum();
        link.capacity - reserved
    }
}
