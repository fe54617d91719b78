//! Persistence of topology elements
//!
//! Discovery writes go through [`TopologyDatastore`] only after the registry
//! has confirmed mastership, so every write here is a force write.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::elements::{Host, Link, Mastership, Port, Switch};
use super::Topology;
use crate::common::ResultContext;
use crate::datastore::{Datastore, KvObject, WriteOp};
use crate::error::FlowgridResult;
use crate::types::{Dpid, LinkTuple, MacAddress, OnosInstanceId, Status, SwitchPort};

impl KvObject for Switch {
    const TABLE: &'static str = "switches";

    fn key(&self) -> Vec<u8> {
        self.dpid.to_key_bytes().to_vec()
    }
}

impl KvObject for Port {
    const TABLE: &'static str = "ports";

    fn key(&self) -> Vec<u8> {
        self.switch_port().to_key_bytes().to_vec()
    }
}

impl KvObject for Link {
    const TABLE: &'static str = "links";

    fn key(&self) -> Vec<u8> {
        self.tuple().to_key_bytes()
    }
}

impl KvObject for Host {
    const TABLE: &'static str = "hosts";

    fn key(&self) -> Vec<u8> {
        self.mac.to_key_bytes().to_vec()
    }
}

impl KvObject for Mastership {
    const TABLE: &'static str = "mastership";

    fn key(&self) -> Vec<u8> {
        mastership_key(self.dpid, &self.instance_id)
    }
}

fn mastership_key(dpid: Dpid, instance_id: &OnosInstanceId) -> Vec<u8> {
    let mut key = dpid.to_key_bytes().to_vec();
    key.extend_from_slice(instance_id.as_str().as_bytes());
    key
}

/// Writer for the `switches`, `ports`, `links`, `hosts` and `mastership` tables
#[derive(Clone)]
pub struct TopologyDatastore {
    store: Arc<Datastore>,
}

impl TopologyDatastore {
    pub fn new(store: Arc<Datastore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Datastore> {
        &self.store
    }

    /// Write a switch and its ports ACTIVE in one batch
    pub async fn add_switch(&self, switch: &Switch, ports: &[Port]) -> FlowgridResult<bool> {
        let switch = switch.clone().with_status(Status::Active);
        let mut ops = vec![self.store.op_force_create(&switch)?];
        for port in ports {
            ops.push(self.store.op_force_create(&port.clone().with_status(Status::Active))?);
        }
        let all_ok = self.store.multi_write(&mut ops).await?;
        if !all_ok {
            warn!("Some writes for switch {} failed", switch.dpid);
        }
        Ok(all_ok)
    }

    /// Rewrite a switch and all its stored ports INACTIVE
    pub async fn deactivate_switch(&self, dpid: Dpid) -> FlowgridResult<bool> {
        let switch = match self
            .store
            .read::<Switch>(&dpid.to_key_bytes())
            .await
            .optional()?
        {
            Some(stored) => stored.value,
            None => {
                debug!("Switch {} not stored, nothing to deactivate", dpid);
                return Ok(true);
            }
        };

        let mut ops: Vec<WriteOp> = vec![self.store.op_force_create(&switch.with_status(Status::Inactive))?];
        for port in self.store.read_all::<Port>().await? {
            if port.value.dpid == dpid {
                ops.push(self.store.op_force_create(&port.value.with_status(Status::Inactive))?);
            }
        }
        let all_ok = self.store.multi_write(&mut ops).await?;
        info!("Deactivated switch {} ({} rows)", dpid, ops.len());
        Ok(all_ok)
    }

    pub async fn add_port(&self, port: &Port) -> FlowgridResult<()> {
        self.store
            .force_create(&port.clone().with_status(Status::Active))
            .await
            .log_error("add_port")?;
        Ok(())
    }

    pub async fn deactivate_port(&self, port: SwitchPort) -> FlowgridResult<()> {
        let Some(stored) = self
            .store
            .read::<Port>(&port.to_key_bytes())
            .await
            .optional()?
        else {
            return Ok(());
        };
        self.store
            .force_create(&stored.value.with_status(Status::Inactive))
            .await?;
        Ok(())
    }

    pub async fn add_link(&self, link: &Link) -> FlowgridResult<()> {
        self.store
            .force_create(&link.clone().with_status(Status::Active))
            .await
            .log_error("add_link")?;
        Ok(())
    }

    pub async fn remove_link(&self, tuple: &LinkTuple) -> FlowgridResult<()> {
        self.store.force_delete::<Link>(&tuple.to_key_bytes()).await?;
        Ok(())
    }

    pub async fn add_host(&self, host: &Host) -> FlowgridResult<()> {
        self.store.force_create(host).await?;
        Ok(())
    }

    pub async fn remove_host(&self, mac: MacAddress) -> FlowgridResult<()> {
        self.store.force_delete::<Host>(&mac.to_key_bytes()).await?;
        Ok(())
    }

    pub async fn put_mastership(&self, mastership: &Mastership) -> FlowgridResult<()> {
        self.store.force_create(mastership).await?;
        Ok(())
    }

    pub async fn remove_mastership(&self, dpid: Dpid, instance_id: &OnosInstanceId) -> FlowgridResult<()> {
        self.store
            .force_delete::<Mastership>(&mastership_key(dpid, instance_id))
            .await?;
        Ok(())
    }

    /// Populate `topology` from the stored ACTIVE elements
    ///
    /// Rows are applied switches first so that ports, links and hosts find
    /// their endpoints. Returns the number of switches loaded.
    pub async fn load_into(&self, topology: &Topology) -> FlowgridResult<usize> {
        let mut ports_by_switch: BTreeMap<Dpid, Vec<Port>> = BTreeMap::new();
        for port in self.store.read_all::<Port>().await? {
            if port.value.status == Status::Active {
                ports_by_switch.entry(port.value.dpid).or_default().push(port.value);
            }
        }

        let mut loaded = 0;
        for switch in self.store.read_all::<Switch>().await? {
            if switch.value.status != Status::Active {
                continue;
            }
            let ports = ports_by_switch.remove(&switch.value.dpid).unwrap_or_default();
            topology.put_switch(switch.value, ports);
            loaded += 1;
        }
        for link in self.store.read_all::<Link>().await? {
            topology.put_link(link.value);
        }
        for host in self.store.read_all::<Host>().await? {
            topology.put_host(host.value);
        }
        for mastership in self.store.read_all::<Mastership>().await? {
            topology.put_mastership(mastership.value);
        }
        info!("Loaded {} switches from the datastore", loaded);
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::RedbKvClient;
    use crate::error::ErrorKind;

    fn writer() -> (TopologyDatastore, Arc<RedbKvClient>) {
        let client = Arc::new(RedbKvClient::in_memory().unwrap());
        let store = Arc::new(Datastore::new(client.clone(), "test"));
        (TopologyDatastore::new(store), client)
    }

    #[tokio::test]
    async fn test_add_and_deactivate_switch() {
        let (writer, _) = writer();
        let ports = vec![Port::new(1u64, 1u32), Port::new(1u64, 2u32)];
        assert!(writer.add_switch(&Switch::new(1u64), &ports).await.unwrap());

        assert!(writer.deactivate_switch(Dpid(1)).await.unwrap());
        let sw = writer.store().read::<Switch>(&Dpid(1).to_key_bytes()).await.unwrap();
        assert_eq!(sw.value.status, Status::Inactive);
        for port in writer.store().read_all::<Port>().await.unwrap() {
            assert_eq!(port.value.status, Status::Inactive);
        }
    }

    #[tokio::test]
    async fn test_link_force_writes() {
        let (writer, _) = writer();
        let link = Link::new(SwitchPort::new(1u64, 1u32), SwitchPort::new(2u64, 1u32));
        writer.add_link(&link).await.unwrap();
        writer.add_link(&link).await.unwrap();
        writer.remove_link(&link.tuple()).await.unwrap();
        writer.remove_link(&link.tuple()).await.unwrap();
        assert!(writer.store().read_all::<Link>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_into_skips_inactive() {
        let (writer, _) = writer();
        writer
            .add_switch(&Switch::new(1u64), &[Port::new(1u64, 1u32)])
            .await
            .unwrap();
        writer
            .add_switch(&Switch::new(2u64), &[Port::new(2u64, 1u32)])
            .await
            .unwrap();
        writer
            .add_link(&Link::new(SwitchPort::new(1u64, 1u32), SwitchPort::new(2u64, 1u32)))
            .await
            .unwrap();
        writer.deactivate_switch(Dpid(2)).await.unwrap();

        let topology = Topology::new();
        assert_eq!(writer.load_into(&topology).await.unwrap(), 1);
        let snapshot = topology.snapshot();
        assert!(snapshot.get_switch(Dpid(2)).is_none());
        // Dangling link is rejected by the topology
        assert_eq!(snapshot.get_links().count(), 0);
    }

    #[tokio::test]
    async fn test_writes_fail_transient_when_offline() {
        let (writer, client) = writer();
        client.disconnect();
        let err = writer.add_host(&Host::new(MacAddress([1; 6]), SwitchPort::new(1u64, 1u32), 0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
