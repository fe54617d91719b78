//! Topology elements
//!
//! Elements are plain values keyed by identity. Links and host attachment
//! points name ports by [`SwitchPort`]; nothing holds a reference into the
//! graph.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{Dpid, LinkTuple, MacAddress, OnosInstanceId, PortNumber, Role, Status, SwitchPort};

/// Attribute recording when a switch connected, milliseconds since the epoch
pub const ATTR_CONNECTED_SINCE: &str = "ConnectedSince";
/// Attribute holding a port's name
pub const ATTR_NAME: &str = "name";

pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Switch {
    pub dpid: Dpid,
    pub status: Status,
    pub attributes: Attributes,
}

impl Switch {
    pub fn new(dpid: impl Into<Dpid>) -> Self {
        Self {
            dpid: dpid.into(),
            status: Status::Active,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub dpid: Dpid,
    pub number: PortNumber,
    pub status: Status,
    pub attributes: Attributes,
}

impl Port {
    pub fn new(dpid: impl Into<Dpid>, number: impl Into<PortNumber>) -> Self {
        Self {
            dpid: dpid.into(),
            number: number.into(),
            status: Status::Active,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn switch_port(&self) -> SwitchPort {
        SwitchPort::new(self.dpid, self.number)
    }
}

/// Directed link; a physical cable is two of these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub src: SwitchPort,
    pub dst: SwitchPort,
    pub status: Status,
    /// Non-negative; `f64::INFINITY` when unknown
    pub capacity: f64,
}

impl Link {
    pub fn new(src: SwitchPort, dst: SwitchPort) -> Self {
        Self {
            src,
            dst,
            status: Status::Active,
            capacity: f64::INFINITY,
        }
    }

    pub fn from_tuple(tuple: LinkTuple) -> Self {
        Self::new(tuple.src, tuple.dst)
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn tuple(&self) -> LinkTuple {
        LinkTuple::new(self.src, self.dst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub mac: MacAddress,
    pub attachment_points: BTreeSet<SwitchPort>,
    /// Milliseconds since the epoch
    pub last_seen: u64,
}

impl Host {
    pub fn new(mac: MacAddress, attachment: SwitchPort, last_seen: u64) -> Self {
        let mut attachment_points = BTreeSet::new();
        attachment_points.insert(attachment);
        Self {
            mac,
            attachment_points,
            last_seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mastership {
    pub dpid: Dpid,
    pub instance_id: OnosInstanceId,
    pub role: Role,
}
