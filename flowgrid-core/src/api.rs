//! REST boundary: JSON views and request handlers
//!
//! No HTTP server is bundled. An embedding server hands the method, path and
//! body to [`ApiHandlers::route`] and writes back the [`ApiResponse`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::common::OptionContext;
use crate::error::{FlowgridError, FlowgridResult};
use crate::flows::{FlowManager, FlowPath};
use crate::registry::{ControllerRegistry, ControllerRegistryEntry};
use crate::topology::{Host, Link, Port, Switch, Topology, TopologySnapshot};
use crate::types::{FlowId, SwitchPort};

pub const TOPOLOGY_PATH: &str = "/wm/onos/topology";
pub const FLOWS_PATH: &str = "/wm/onos/flows";
pub const REGISTRY_PATH: &str = "/wm/onos/registry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPortJson {
    pub dpid: String,
    pub port_number: u32,
}

impl From<SwitchPort> for SwitchPortJson {
    fn from(sp: SwitchPort) -> Self {
        Self {
            dpid: sp.dpid.to_string(),
            port_number: sp.port.value(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortJson {
    pub dpid: String,
    pub port_number: u32,
    pub state: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attributes: BTreeMap<String, String>,
}

impl From<&Port> for PortJson {
    fn from(port: &Port) -> Self {
        Self {
            dpid: port.dpid.to_string(),
            port_number: port.number.value(),
            state: port.status.to_string(),
            attributes: port.attributes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchJson {
    pub dpid: String,
    pub state: String,
    pub ports: Vec<PortJson>,
}

impl SwitchJson {
    fn from_snapshot(switch: &Switch, snapshot: &TopologySnapshot) -> Self {
        Self {
            dpid: switch.dpid.to_string(),
            state: switch.status.to_string(),
            ports: snapshot.get_ports(switch.dpid).map(PortJson::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkJson {
    pub src: SwitchPortJson,
    pub dst: SwitchPortJson,
    pub state: String,
    /// `None` when the capacity is unknown
    pub capacity: Option<f64>,
}

impl From<&Link> for LinkJson {
    fn from(link: &Link) -> Self {
        Self {
            src: link.src.into(),
            dst: link.dst.into(),
            state: link.status.to_string(),
            capacity: link.capacity.is_finite().then_some(link.capacity),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostJson {
    pub mac: String,
    pub attachment_points: Vec<SwitchPortJson>,
    pub last_seen: u64,
}

impl From<&Host> for HostJson {
    fn from(host: &Host) -> Self {
        Self {
            mac: host.mac.to_string(),
            attachment_points: host.attachment_points.iter().map(|ap| (*ap).into()).collect(),
            last_seen: host.last_seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyJson {
    pub switches: Vec<SwitchJson>,
    pub links: Vec<LinkJson>,
    pub hosts: Vec<HostJson>,
}

impl From<&TopologySnapshot> for TopologyJson {
    fn from(snapshot: &TopologySnapshot) -> Self {
        Self {
            switches: snapshot
                .get_switches()
                .map(|s| SwitchJson::from_snapshot(s, snapshot))
                .collect(),
            links: snapshot.get_links().map(LinkJson::from).collect(),
            hosts: snapshot.get_hosts().map(HostJson::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerEntryJson {
    pub controller_id: String,
    pub is_master: bool,
}

impl From<ControllerRegistryEntry> for ControllerEntryJson {
    fn from(entry: ControllerRegistryEntry) -> Self {
        Self {
            controller_id: entry.controller_id,
            is_master: entry.is_master,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: impl Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status: 200, body },
            Err(e) => Self::error(&FlowgridError::from(e)),
        }
    }

    fn error(err: &FlowgridError) -> Self {
        Self {
            status: err.http_status(),
            body: json!({ "error": err.to_string() }),
        }
    }
}

impl From<FlowgridResult<ApiResponse>> for ApiResponse {
    fn from(result: FlowgridResult<ApiResponse>) -> Self {
        result.unwrap_or_else(|e| {
            if e.http_status() >= 500 {
                warn!("Request failed: {}", e);
            }
            ApiResponse::error(&e)
        })
    }
}

pub struct ApiHandlers {
    topology: Arc<Topology>,
    flows: Arc<FlowManager>,
    registry: Arc<dyn ControllerRegistry>,
}

impl ApiHandlers {
    pub fn new(topology: Arc<Topology>, flows: Arc<FlowManager>, registry: Arc<dyn ControllerRegistry>) -> Self {
        Self {
            topology,
            flows,
            registry,
        }
    }

    /// Dispatch one request
    pub async fn route(&self, method: &str, path: &str, body: Option<&str>) -> ApiResponse {
        debug!("{} {}", method, path);
        let path = path.trim_end_matches('/');
        let result = match (method, path) {
            ("GET", TOPOLOGY_PATH) => Ok(self.topology_json()),
            ("GET", p) if p.starts_with(TOPOLOGY_PATH) => self.topology_part(&p[TOPOLOGY_PATH.len()..]),
            ("POST", "/wm/onos/flows/add/json") => self.add_flow(body.unwrap_or_default()).await,
            ("GET", FLOWS_PATH) => self.flow_summaries().await,
            ("GET", p) if p.starts_with(FLOWS_PATH) => self.get_flow(&p[FLOWS_PATH.len()..]).await,
            ("DELETE", p) if p.starts_with(FLOWS_PATH) => self.delete_flow(&p[FLOWS_PATH.len()..]).await,
            ("GET", "/wm/onos/registry/controllers") => self.controllers().await,
            ("GET", "/wm/onos/registry/switches") => self.registry_switches().await,
            _ => Err(FlowgridError::not_found(format!("route {} {}", method, path))),
        };
        result.into()
    }

    fn topology_json(&self) -> ApiResponse {
        let snapshot = self.topology.snapshot();
        ApiResponse::ok(TopologyJson::from(snapshot.as_ref()))
    }

    fn topology_part(&self, rest: &str) -> FlowgridResult<ApiResponse> {
        let view = TopologyJson::from(self.topology.snapshot().as_ref());
        match rest {
            "/switches" => Ok(ApiResponse::ok(view.switches)),
            "/links" => Ok(ApiResponse::ok(view.links)),
            "/hosts" => Ok(ApiResponse::ok(view.hosts)),
            other => Err(FlowgridError::not_found(format!("topology view {}", other))),
        }
    }

    async fn add_flow(&self, body: &str) -> FlowgridResult<ApiResponse> {
        let path: FlowPath = serde_json::from_str(body)?;
        let flow_id = self.flows.add_flow(path).await?;
        Ok(ApiResponse::ok(json!({ "flowId": flow_id.to_string() })))
    }

    async fn flow_summaries(&self) -> FlowgridResult<ApiResponse> {
        let summaries = self.flows.get_all_flows_summary(FlowId(0), usize::MAX).await?;
        Ok(ApiResponse::ok(summaries))
    }

    fn parse_flow_id(rest: &str) -> FlowgridResult<FlowId> {
        let id = rest
            .strip_prefix('/')
            .filter(|s| !s.is_empty() && !s.contains('/'))
            .ok_or_else(|| FlowgridError::not_found(format!("route {}{}", FLOWS_PATH, rest)))?;
        id.parse()
    }

    async fn get_flow(&self, rest: &str) -> FlowgridResult<ApiResponse> {
        let flow_id = Self::parse_flow_id(rest)?;
        let path = self
            .flows
            .get_flow(flow_id)
            .await?
            .not_found(|| format!("flow {}", flow_id))?;
        Ok(ApiResponse::ok(path))
    }

    async fn delete_flow(&self, rest: &str) -> FlowgridResult<ApiResponse> {
        let flow_id = Self::parse_flow_id(rest)?;
        self.flows.delete_flow(flow_id).await?;
        Ok(ApiResponse::ok(json!({ "flowId": flow_id.to_string() })))
    }

    async fn controllers(&self) -> FlowgridResult<ApiResponse> {
        Ok(ApiResponse::ok(self.registry.get_all_controllers().await?))
    }

    async fn registry_switches(&self) -> FlowgridResult<ApiResponse> {
        let switches: BTreeMap<String, Vec<ControllerEntryJson>> = self
            .registry
            .get_all_switches()
            .await?
            .into_iter()
            .map(|(dpid, entries)| (dpid.to_string(), entries.into_iter().map(Into::into).collect()))
            .collect();
        Ok(ApiResponse::ok(switches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{Datastore, RedbKvClient};
    use crate::events::EventBus;
    use crate::registry::{ClusterRegistry, IdBlock, IdBlockAllocator, InProcessCoordinator};
    use crate::types::OnosInstanceId;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Blocks(AtomicU64);

    #[async_trait]
    impl IdBlockAllocator for Blocks {
        async fn allocate_unique_id_block(&self) -> FlowgridResult<IdBlock> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(IdBlock::new(n * 1000 + 1, 1000))
        }
    }

    async fn handlers() -> ApiHandlers {
        let topology = Arc::new(Topology::new());
        topology.put_switch(Switch::new(1u64), vec![Port::new(1u64, 1u32), Port::new(1u64, 2u32)]);
        topology.put_switch(Switch::new(2u64), vec![Port::new(2u64, 1u32)]);
        topology.put_link(Link::new(SwitchPort::new(1u64, 2u32), SwitchPort::new(2u64, 1u32)).with_capacity(1000.0));

        let client = Arc::new(RedbKvClient::in_memory().unwrap());
        let store = Arc::new(Datastore::new(client, "api"));
        let flows = Arc::new(FlowManager::new(
            store,
            Arc::new(Blocks(AtomicU64::new(0))),
            Arc::new(EventBus::new(16)),
        ));
        let registry = Arc::new(ClusterRegistry::new(Arc::new(InProcessCoordinator::new()), 1000));
        registry.register_controller(OnosInstanceId::new("a").unwrap()).await.unwrap();
        ApiHandlers::new(topology, flows, registry)
    }

    const FLOW: &str = r#"{
        "installer_id": "rest",
        "src": {"dpid": 1, "port": 1},
        "dst": {"dpid": 2, "port": 1},
        "entries": [{
            "dpid": 1,
            "flow_match": {"in_port": 1},
            "actions": [{"Output": {"port": 2, "max_len": 0}}],
            "priority": 100,
            "user_state": "Add",
            "switch_state": "NotUpdated"
        }]
    }"#;

    #[tokio::test]
    async fn test_topology_views() {
        let api = handlers().await;
        let response = api.route("GET", "/wm/onos/topology", None).await;
        assert_eq!(response.status, 200);
        let view: TopologyJson = serde_json::from_value(response.body).unwrap();
        assert_eq!(view.switches.len(), 2);
        assert_eq!(view.switches[0].dpid, "00:00:00:00:00:00:00:01");
        assert_eq!(view.switches[0].state, "ACTIVE");
        assert_eq!(view.switches[0].ports[1].port_number, 2);
        assert_eq!(view.links[0].capacity, Some(1000.0));

        let links = api.route("GET", "/wm/onos/topology/links/", None).await;
        assert_eq!(links.body.as_array().unwrap().len(), 1);
        assert_eq!(links.body[0]["src"]["portNumber"], 2);
        assert_eq!(api.route("GET", "/wm/onos/topology/nothing", None).await.status, 404);
    }

    #[tokio::test]
    async fn test_flow_round_trip() {
        let api = handlers().await;
        let created = api.route("POST", "/wm/onos/flows/add/json", Some(FLOW)).await;
        assert_eq!(created.status, 200);
        let flow_id = created.body["flowId"].as_str().unwrap().to_string();

        let fetched = api.route("GET", &format!("/wm/onos/flows/{}", flow_id), None).await;
        assert_eq!(fetched.status, 200);
        assert_eq!(fetched.body["installer_id"], "rest");

        let summary = api.route("GET", "/wm/onos/flows", None).await;
        assert_eq!(summary.body.as_array().unwrap().len(), 1);
        assert!(summary.body[0].get("entries").is_none());

        let deleted = api.route("DELETE", &format!("/wm/onos/flows/{}", flow_id), None).await;
        assert_eq!(deleted.status, 200);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let api = handlers().await;
        assert_eq!(api.route("POST", "/wm/onos/flows/add/json", Some("{not json")).await.status, 400);
        assert_eq!(api.route("GET", "/wm/onos/flows/0x99", None).await.status, 404);
        assert_eq!(api.route("GET", "/wm/onos/flows/zzz", None).await.status, 400);
        // Deleting an unknown flow succeeds
        assert_eq!(api.route("DELETE", "/wm/onos/flows/0x99", None).await.status, 200);
        assert_eq!(api.route("PUT", "/wm/onos/flows", None).await.status, 404);
    }

    #[tokio::test]
    async fn test_registry_views() {
        let api = handlers().await;
        let controllers = api.route("GET", "/wm/onos/registry/controllers", None).await;
        assert_eq!(controllers.body, json!(["a"]));
        let switches = api.route("GET", "/wm/onos/registry/switches", None).await;
        assert_eq!(switches.status, 200);
        assert_eq!(switches.body, json!({}));
    }
}
