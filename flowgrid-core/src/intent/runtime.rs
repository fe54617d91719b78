//! Execution of intent batches

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{calc_path_intents, calc_plan, IntentOperationList, IntentOperator, PathIntent, Plan};
use crate::error::{FlowgridError, FlowgridResult};
use crate::flows::{FlowEntry, FlowManager, FlowPath, FlowPathState};
use crate::registry::{ControllerRegistry, IdBlockAllocator, IdGenerator};
use crate::sync::FlowSynchronizer;
use crate::topology::Topology;
use crate::types::{Dpid, FlowBatchId, FlowId, IntentId, SwitchPort};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentState {
    /// Persisted; the switches have not confirmed every entry yet
    Accepted,
    Installed,
    /// Not satisfiable on the current topology
    PushedBack,
    Failed,
}

/// What happened to one submitted batch
#[derive(Debug)]
pub struct IntentBatchReport {
    pub batch_id: FlowBatchId,
    pub plan: Plan,
    pub states: BTreeMap<IntentId, IntentState>,
    pub pushed_back: Vec<(IntentId, FlowgridError)>,
}

impl IntentBatchReport {
    pub fn state(&self, id: IntentId) -> Option<IntentState> {
        self.states.get(&id).copied()
    }
}

/// Which flow paths realise which intents
///
/// A flow is created by the intent owning its plan entries. Intents of the
/// same batch that compiled to identical entries hold that flow too, and it
/// is deleted once its last holder is removed.
#[derive(Debug, Default)]
struct Installed {
    owned: HashMap<IntentId, FlowId>,
    holders: BTreeMap<FlowId, BTreeSet<IntentId>>,
}

impl Installed {
    fn held_by(&self, id: IntentId) -> Vec<FlowId> {
        self.holders
            .iter()
            .filter(|(_, ids)| ids.contains(&id))
            .map(|(flow_id, _)| *flow_id)
            .collect()
    }

    fn hold(&mut self, id: IntentId, flow_id: FlowId) {
        self.holders.entry(flow_id).or_default().insert(id);
    }

    /// Forget `id`; returns the flows nobody holds any more
    fn release(&mut self, id: IntentId) -> Vec<FlowId> {
        self.owned.remove(&id);
        let mut orphaned = Vec::new();
        self.holders.retain(|flow_id, ids| {
            ids.remove(&id);
            if ids.is_empty() {
                orphaned.push(*flow_id);
                false
            } else {
                true
            }
        });
        orphaned
    }
}

pub struct IntentRuntime {
    topology: Arc<Topology>,
    flows: Arc<FlowManager>,
    sync: Arc<FlowSynchronizer>,
    registry: Arc<dyn ControllerRegistry>,
    batch_ids: IdGenerator<FlowBatchId>,
    installed: Mutex<Installed>,
    installer_id: String,
    default_deadline: Option<Duration>,
    exec_lock: tokio::sync::Mutex<()>,
}

impl IntentRuntime {
    pub fn new(
        topology: Arc<Topology>,
        flows: Arc<FlowManager>,
        sync: Arc<FlowSynchronizer>,
        registry: Arc<dyn ControllerRegistry>,
        allocator: Arc<dyn IdBlockAllocator>,
        installer_id: impl Into<String>,
    ) -> Self {
        Self {
            topology,
            flows,
            sync,
            registry,
            batch_ids: IdGenerator::new(allocator),
            installed: Mutex::new(Installed::default()),
            installer_id: installer_id.into(),
            default_deadline: None,
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Deadline for batches submitted without one
    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    /// Flow path installed for `id`, or one it shares with another intent
    pub fn installed_flow(&self, id: IntentId) -> Option<FlowId> {
        let installed = self.installed.lock();
        installed
            .owned
            .get(&id)
            .copied()
            .or_else(|| installed.held_by(id).first().copied())
    }

    /// `Installed` once every entry of every flow the intent holds is acknowledged
    pub async fn intent_state(&self, id: IntentId) -> FlowgridResult<Option<IntentState>> {
        let flow_ids = self.installed.lock().held_by(id);
        if flow_ids.is_empty() {
            return Ok(None);
        }
        let mut state = IntentState::Installed;
        for flow_id in flow_ids {
            match self.flows.get_flow(flow_id).await? {
                Some(path) if path.state == FlowPathState::Installed => {}
                Some(_) => state = IntentState::Accepted,
                None => return Ok(Some(IntentState::Failed)),
            }
        }
        Ok(Some(state))
    }

    /// Compile and persist one batch
    ///
    /// Compilation runs on a topology snapshot. If `deadline` (or the default
    /// deadline) has passed before anything is written, every intent of the
    /// batch is reported `Failed` and the datastore is left untouched.
    pub async fn execute(
        &self,
        ops: IntentOperationList,
        deadline: Option<Duration>,
    ) -> FlowgridResult<IntentBatchReport> {
        let started = Instant::now();
        let expires = deadline.or(self.default_deadline).map(|d| started + d);

        let _guard = self.exec_lock.lock().await;
        let batch_id = self.batch_ids.next_id().await?;
        let snapshot = self.topology.snapshot();
        let calc = calc_path_intents(&snapshot, &ops);
        let plan = calc_plan(&calc.path_intents);
        debug!(
            "Batch {}: {} path intents, {} plan entries, {} pushed back",
            batch_id,
            calc.path_intents.len(),
            plan.len(),
            calc.pushed_back.len()
        );

        let mut states: BTreeMap<IntentId, IntentState> = calc
            .pushed_back
            .iter()
            .map(|(id, _)| (*id, IntentState::PushedBack))
            .collect();

        if expires.is_some_and(|at| Instant::now() >= at) {
            warn!("Batch {} missed its deadline, nothing written", batch_id);
            let states = ops.iter().map(|op| (op.intent.id(), IntentState::Failed)).collect();
            return Ok(IntentBatchReport {
                batch_id,
                plan,
                states,
                pushed_back: calc.pushed_back,
            });
        }

        let mut touched: BTreeSet<Dpid> = BTreeSet::new();
        let mut removed: Vec<IntentId> = Vec::new();
        let mut added: Vec<PathIntent> = Vec::new();

        for (operator, intent) in &calc.path_intents {
            match operator {
                IntentOperator::Remove => {
                    let state = match self.uninstall(intent.id).await {
                        Ok(()) => IntentState::Accepted,
                        Err(e) => {
                            warn!("Removing intent {} failed: {}", intent.id, e);
                            IntentState::Failed
                        }
                    };
                    touched.extend(intent.path.iter().map(|l| l.src.dpid));
                    touched.extend(intent.endpoints().map(|e| e.dst_switch));
                    removed.push(intent.id);
                    states.insert(intent.id, state);
                }
                IntentOperator::Add => {
                    let state = match self.install(&plan, intent).await {
                        Ok(dpids) => {
                            touched.extend(dpids);
                            added.push(intent.clone());
                            IntentState::Accepted
                        }
                        Err(e) => {
                            warn!("Installing intent {} failed: {}", intent.id, e);
                            IntentState::Failed
                        }
                    };
                    states.insert(intent.id, state);
                }
            }
        }

        self.topology.remove_path_intents(&removed);
        self.topology.add_path_intents(added);

        for dpid in touched.into_iter().filter(|d| self.registry.has_control(*d)) {
            self.sync.kick(dpid);
        }

        info!("Batch {} executed in {:?}", batch_id, started.elapsed());
        Ok(IntentBatchReport {
            batch_id,
            plan,
            states,
            pushed_back: calc.pushed_back,
        })
    }

    async fn uninstall(&self, id: IntentId) -> FlowgridResult<()> {
        let orphaned = self.installed.lock().release(id);
        for flow_id in orphaned {
            self.flows.delete_flow(flow_id).await?;
        }
        Ok(())
    }

    /// Persist the plan entries owned by `intent` as one flow path, and hold
    /// the flows of entries it shares with earlier intents of the batch
    async fn install(&self, plan: &Plan, intent: &PathIntent) -> FlowgridResult<Vec<Dpid>> {
        // Re-adding an id replaces what was installed for it
        self.uninstall(intent.id).await?;

        let mut dpids = self.hold_shared(plan, intent.id);
        dpids.extend(self.install_owned(plan, intent).await?);
        Ok(dpids)
    }

    fn hold_shared(&self, plan: &Plan, id: IntentId) -> Vec<Dpid> {
        let shared = plan.shared_entries_for(id, IntentOperator::Add);
        let mut installed = self.installed.lock();
        let mut dpids = Vec::with_capacity(shared.len());
        for entry in shared {
            let owner_flow = installed.owned.get(&entry.intent_id).copied();
            match owner_flow {
                Some(flow_id) => {
                    installed.hold(id, flow_id);
                    dpids.push(entry.dpid);
                }
                None => debug!(
                    "Intent {} shares an entry on {} with {}, which installed nothing",
                    id, entry.dpid, entry.intent_id
                ),
            }
        }
        dpids
    }

    async fn install_owned(&self, plan: &Plan, intent: &PathIntent) -> FlowgridResult<Vec<Dpid>> {
        let entries: Vec<FlowEntry> = plan
            .entries_for(intent.id, IntentOperator::Add)
            .into_iter()
            .map(|e| FlowEntry::new(e.dpid, e.flow_match.clone(), e.actions.clone()))
            .collect();
        if entries.is_empty() {
            debug!("Intent {} needs no new entries", intent.id);
            return Ok(Vec::new());
        }
        let endpoints = intent
            .endpoints()
            .ok_or_else(|| FlowgridError::path_unsatisfiable(intent.id, "intent has no endpoints"))?;

        let dpids: Vec<Dpid> = entries.iter().map(|e| e.dpid).collect();
        let mut path = FlowPath::new(
            self.installer_id.clone(),
            SwitchPort::new(endpoints.src_switch, endpoints.src_port),
            SwitchPort::new(endpoints.dst_switch, endpoints.dst_port),
        );
        path.intent_id = Some(intent.id);
        path.entries = entries;

        let flow_id = self.flows.add_flow(path).await?;
        let mut installed = self.installed.lock();
        installed.owned.insert(intent.id, flow_id);
        installed.hold(intent.id, flow_id);
        drop(installed);
        debug!("Intent {} installed as flow {}", intent.id, flow_id);
        Ok(dpids)
    }
}
