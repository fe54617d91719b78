//! Identity types shared by every component
//!
//! All identifiers are small `Copy` newtypes. Graph edges are expressed as
//! identifiers resolved through the topology rather than as references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FlowgridError;

/// Datapath identifier of an OpenFlow switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dpid(pub u64);

impl Dpid {
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Big-endian key bytes used by the datastore
    pub fn to_key_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for Dpid {
    type Err = FlowgridError;

    /// Accepts `00:00:00:00:00:00:00:01`, `0x1` or `1`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(':') {
            let parts: Vec<&str> = s.split(':').collect();
            if parts.len() != 8 {
                return Err(FlowgridError::invalid_input("dpid", format!("malformed dpid {}", s)));
            }
            let mut value = 0u64;
            for part in parts {
                let byte = u8::from_str_radix(part, 16).map_err(|_| {
                    FlowgridError::invalid_input("dpid", format!("malformed dpid {}", s))
                })?;
                value = (value << 8) | u64::from(byte);
            }
            return Ok(Dpid(value));
        }
        parse_u64(s, "dpid").map(Dpid)
    }
}

impl From<u64> for Dpid {
    fn from(v: u64) -> Self {
        Dpid(v)
    }
}

/// Port number, unique within one switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortNumber(pub u32);

impl PortNumber {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PortNumber {
    fn from(v: u32) -> Self {
        PortNumber(v)
    }
}

/// A port on a particular switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SwitchPort {
    pub dpid: Dpid,
    pub port: PortNumber,
}

impl SwitchPort {
    pub fn new(dpid: impl Into<Dpid>, port: impl Into<PortNumber>) -> Self {
        Self {
            dpid: dpid.into(),
            port: port.into(),
        }
    }

    /// `Dpid‖PortNumber`, both big-endian
    pub fn to_key_bytes(&self) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&self.dpid.to_key_bytes());
        key[8..].copy_from_slice(&self.port.0.to_be_bytes());
        key
    }
}

impl fmt::Display for SwitchPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dpid, self.port)
    }
}

/// Directed link identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkTuple {
    pub src: SwitchPort,
    pub dst: SwitchPort,
}

impl LinkTuple {
    pub fn new(src: SwitchPort, dst: SwitchPort) -> Self {
        Self { src, dst }
    }

    /// The same link in the opposite direction
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// `'L'‖srcPortId‖dstPortId`
    pub fn to_key_bytes(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(25);
        key.push(b'L');
        key.extend_from_slice(&self.src.to_key_bytes());
        key.extend_from_slice(&self.dst.to_key_bytes());
        key
    }
}

impl fmt::Display for LinkTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=>{}", self.src, self.dst)
    }
}

/// 48-bit Ethernet address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn from_u64(v: u64) -> Self {
        let b = v.to_be_bytes();
        MacAddress([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    pub fn to_key_bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = FlowgridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(FlowgridError::invalid_input("mac", format!("malformed mac {}", s)));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| FlowgridError::invalid_input("mac", format!("malformed mac {}", s)))?;
        }
        Ok(MacAddress(bytes))
    }
}

/// Opaque identifier of a live controller instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OnosInstanceId(String);

impl OnosInstanceId {
    pub fn new(id: impl Into<String>) -> Result<Self, FlowgridError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(FlowgridError::invalid_input(
                "instance_id",
                "instance id must not be empty",
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OnosInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Defines a 64-bit identifier drawn from an ID block, shown as `0x<hex>`
macro_rules! block_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn value(&self) -> u64 {
                self.0
            }

            pub fn to_key_bytes(&self) -> [u8; 8] {
                self.0.to_be_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = FlowgridError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_u64(s, $field).map($name)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                $name(v)
            }
        }
    };
}

block_id!(
    /// Identifier of a FlowPath
    FlowId,
    "flow_id"
);
block_id!(
    /// Identifier of a single per-switch flow entry
    FlowEntryId,
    "flow_entry_id"
);
block_id!(
    /// Identifier of a user intent
    IntentId,
    "intent_id"
);
block_id!(
    /// Identifier of a flow or intent batch
    FlowBatchId,
    "flow_batch_id"
);

fn parse_u64(s: &str, field: &str) -> Result<u64, FlowgridError> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| FlowgridError::invalid_input(field, format!("cannot parse {:?}", s)))
}

/// Administrative status of a topology element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Active,
    Inactive,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Active => f.write_str("ACTIVE"),
            Status::Inactive => f.write_str("INACTIVE"),
        }
    }
}

/// Mastership role of an instance for a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("MASTER"),
            Role::Slave => f.write_str("SLAVE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpid_display_and_parse() {
        let dpid = Dpid(0x0102);
        assert_eq!(dpid.to_string(), "00:00:00:00:00:00:01:02");
        assert_eq!("00:00:00:00:00:00:01:02".parse::<Dpid>().unwrap(), dpid);
        assert_eq!("0x102".parse::<Dpid>().unwrap(), dpid);
        assert_eq!("258".parse::<Dpid>().unwrap(), dpid);
        assert!("00:01".parse::<Dpid>().is_err());
    }

    #[test]
    fn test_flow_id_text_forms() {
        assert_eq!(FlowId(255).to_string(), "0xff");
        assert_eq!("0xff".parse::<FlowId>().unwrap(), FlowId(255));
        assert_eq!("255".parse::<FlowId>().unwrap(), FlowId(255));
        assert!("zz".parse::<FlowId>().is_err());
    }

    #[test]
    fn test_mac_round_trip() {
        let mac: MacAddress = "aa:bb:cc:dd:ee:01".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:01");
        assert_eq!(MacAddress::from_u64(mac.to_u64()), mac);
        assert!("aa:bb".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_key_layouts() {
        let sp = SwitchPort::new(1u64, 2u32);
        assert_eq!(&sp.to_key_bytes()[..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&sp.to_key_bytes()[8..], &[0, 0, 0, 2]);

        let link = LinkTuple::new(sp, SwitchPort::new(3u64, 4u32));
        let key = link.to_key_bytes();
        assert_eq!(key[0], b'L');
        assert_eq!(key.len(), 25);
        assert_eq!(link.reversed().reversed(), link);
    }

    #[test]
    fn test_instance_id_rejects_empty() {
        assert!(OnosInstanceId::new("  ").is_err());
        assert_eq!(OnosInstanceId::new("a").unwrap().as_str(), "a");
    }
}
