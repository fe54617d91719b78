//! Typed OpenFlow message model
//!
//! The wire codec lives outside this crate. Components build these typed
//! messages and hand them to a [`SwitchConnection`]; `wire_len` reports the
//! OpenFlow 1.0 encoded size so the pusher can rate-limit by bytes.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_FLOW_PRIORITY, DEFAULT_HARD_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use crate::error::FlowgridResult;
use crate::types::{Dpid, MacAddress, PortNumber};

/// Length of `ofp_header`
pub const OFP_HEADER_LEN: usize = 8;
/// Length of an OpenFlow 1.0 `ofp_flow_mod` without actions
pub const OFP_FLOW_MOD_LEN: usize = 72;
/// Length of `ofp_packet_out` without actions and payload
pub const OFP_PACKET_OUT_LEN: usize = 16;

/// All match fields wildcarded
pub const OFPFW_ALL: u32 = (1 << 22) - 1;
pub const OFPFW_IN_PORT: u32 = 1 << 0;
pub const OFPFW_DL_VLAN: u32 = 1 << 1;
pub const OFPFW_DL_SRC: u32 = 1 << 2;
pub const OFPFW_DL_DST: u32 = 1 << 3;
pub const OFPFW_DL_TYPE: u32 = 1 << 4;
pub const OFPFW_NW_PROTO: u32 = 1 << 5;
pub const OFPFW_TP_SRC: u32 = 1 << 6;
pub const OFPFW_TP_DST: u32 = 1 << 7;
const OFPFW_NW_SRC_SHIFT: u32 = 8;
const OFPFW_NW_DST_SHIFT: u32 = 14;
const OFPFW_NW_MASK_BITS: u32 = 0x3f;

/// Maximum bytes of a packet sent to the controller by an output action
pub const OFPCML_NO_BUFFER: u16 = 0xffff;

/// Match structure; `None` fields are wildcarded
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Match {
    pub in_port: Option<PortNumber>,
    pub dl_src: Option<MacAddress>,
    pub dl_dst: Option<MacAddress>,
    pub dl_vlan: Option<u16>,
    pub dl_type: Option<u16>,
    pub nw_proto: Option<u8>,
    pub nw_src: Option<Ipv4Net>,
    pub nw_dst: Option<Ipv4Net>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

impl Match {
    /// A match with every field wildcarded
    pub fn match_all() -> Self {
        Self::default()
    }

    /// OpenFlow 1.0 wildcard bitmap: starts from `OFPFW_ALL` and clears one
    /// bit per concrete field
    pub fn wildcards(&self) -> u32 {
        let mut w = OFPFW_ALL;
        if self.in_port.is_some() {
            w &= !OFPFW_IN_PORT;
        }
        if self.dl_vlan.is_some() {
            w &= !OFPFW_DL_VLAN;
        }
        if self.dl_src.is_some() {
            w &= !OFPFW_DL_SRC;
        }
        if self.dl_dst.is_some() {
            w &= !OFPFW_DL_DST;
        }
        if self.dl_type.is_some() {
            w &= !OFPFW_DL_TYPE;
        }
        if self.nw_proto.is_some() {
            w &= !OFPFW_NW_PROTO;
        }
        if self.tp_src.is_some() {
            w &= !OFPFW_TP_SRC;
        }
        if self.tp_dst.is_some() {
            w &= !OFPFW_TP_DST;
        }
        if let Some(net) = self.nw_src {
            w = set_nw_mask(w, OFPFW_NW_SRC_SHIFT, net.prefix_len());
        }
        if let Some(net) = self.nw_dst {
            w = set_nw_mask(w, OFPFW_NW_DST_SHIFT, net.prefix_len());
        }
        w
    }
}

fn set_nw_mask(wildcards: u32, shift: u32, prefix_len: u8) -> u32 {
    let ignored = 32u32.saturating_sub(u32::from(prefix_len));
    (wildcards & !(OFPFW_NW_MASK_BITS << shift)) | ((ignored & OFPFW_NW_MASK_BITS) << shift)
}

/// Actions applied by a flow entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Output { port: PortNumber, max_len: u16 },
    SetVlanId(u16),
    StripVlan,
    SetDlSrc(MacAddress),
    SetDlDst(MacAddress),
}

impl Action {
    pub fn output(port: PortNumber) -> Self {
        Action::Output {
            port,
            max_len: OFPCML_NO_BUFFER,
        }
    }

    pub fn wire_len(&self) -> usize {
        match self {
            Action::Output { .. } | Action::SetVlanId(_) | Action::StripVlan => 8,
            Action::SetDlSrc(_) | Action::SetDlDst(_) => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowModCommand {
    Add,
    Modify,
    ModifyStrict,
    Delete,
    DeleteStrict,
}

impl FlowModCommand {
    pub fn is_delete(&self) -> bool {
        matches!(self, FlowModCommand::Delete | FlowModCommand::DeleteStrict)
    }
}

/// `ofp_flow_mod_flags`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowModFlags(pub u16);

impl FlowModFlags {
    pub const SEND_FLOW_REM: FlowModFlags = FlowModFlags(1 << 0);
    pub const CHECK_OVERLAP: FlowModFlags = FlowModFlags(1 << 1);
    pub const EMERG: FlowModFlags = FlowModFlags(1 << 2);

    pub fn contains(&self, other: FlowModFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FlowModFlags {
    type Output = FlowModFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FlowModFlags(self.0 | rhs.0)
    }
}

/// Flow table modification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub flow_match: Match,
    pub cookie: u64,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    /// `None` is `OFP_NO_BUFFER`
    pub buffer_id: Option<u32>,
    /// `None` is `OFPP_NONE`
    pub out_port: Option<PortNumber>,
    pub flags: FlowModFlags,
    pub actions: Vec<Action>,
}

impl FlowMod {
    /// A flow-mod with the controller defaults: priority 100, permanent
    /// timeouts, no buffer and `SEND_FLOW_REM`. Delete commands echo the first
    /// output action as `out_port`.
    pub fn new(command: FlowModCommand, flow_match: Match, actions: Vec<Action>) -> Self {
        let out_port = if command.is_delete() {
            actions.iter().find_map(|a| match a {
                Action::Output { port, .. } => Some(*port),
                _ => None,
            })
        } else {
            None
        };

        Self {
            command,
            flow_match,
            cookie: 0,
            priority: DEFAULT_FLOW_PRIORITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            hard_timeout: DEFAULT_HARD_TIMEOUT,
            buffer_id: None,
            out_port,
            flags: FlowModFlags::SEND_FLOW_REM,
            actions,
        }
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn wire_len(&self) -> usize {
        OFP_FLOW_MOD_LEN + self.actions.iter().map(Action::wire_len).sum::<usize>()
    }
}

/// Packet injected into the data plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketOut {
    pub buffer_id: Option<u32>,
    pub in_port: Option<PortNumber>,
    pub actions: Vec<Action>,
    pub data: Vec<u8>,
}

impl PacketOut {
    pub fn wire_len(&self) -> usize {
        OFP_PACKET_OUT_LEN
            + self.actions.iter().map(Action::wire_len).sum::<usize>()
            + self.data.len()
    }
}

/// Outbound message handed to a switch connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfMessage {
    FlowMod(FlowMod),
    PacketOut(PacketOut),
    BarrierRequest { xid: u32 },
}

impl OfMessage {
    pub fn wire_len(&self) -> usize {
        match self {
            OfMessage::FlowMod(fm) => fm.wire_len(),
            OfMessage::PacketOut(po) => po.wire_len(),
            OfMessage::BarrierRequest { .. } => OFP_HEADER_LEN,
        }
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self, OfMessage::BarrierRequest { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortReason {
    Add,
    Delete,
    Modify,
}

/// Port description from features or port-desc replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDesc {
    pub number: PortNumber,
    pub name: String,
    pub hw_addr: MacAddress,
    pub link_up: bool,
}

impl PortDesc {
    pub fn new(number: impl Into<PortNumber>, name: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            name: name.into(),
            hw_addr: MacAddress([0; 6]),
            link_up: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

/// Switch features reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchFeatures {
    pub dpid: Dpid,
    pub n_tables: u8,
    pub ports: Vec<PortDesc>,
}

/// Session to one connected switch
#[async_trait]
pub trait SwitchConnection: Send + Sync {
    fn dpid(&self) -> Dpid;

    fn is_connected(&self) -> bool;

    /// Write one message; barrier replies arrive out of band
    async fn write(&self, msg: OfMessage) -> FlowgridResult<()>;
}
