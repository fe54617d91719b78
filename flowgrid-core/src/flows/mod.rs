//! Flow manager
//!
//! Flow paths and their entries live in the `flow_paths` and `flow_entries`
//! tables. The manager owns every compound write to them: adding and
//! deleting paths for callers, and the acknowledgement-driven state changes
//! applied by the synchroniser. Compound writes are serialised by one async
//! lock and undone with compensating writes when part of a batch fails, so a
//! failed call leaves the pre-call state behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::common::ResultContext;
use crate::datastore::{Datastore, KvObject, Versioned, WriteOp};
use crate::error::{FlowgridError, FlowgridResult};
use crate::events::{ControllerEvent, EventBus, FlowEvent};
use crate::openflow::{Action, Match};
use crate::registry::{IdBlockAllocator, IdGenerator};
use crate::topology::Topology;
use crate::types::{Dpid, FlowBatchId, FlowEntryId, FlowId, IntentId, SwitchPort};

pub mod model;

pub use model::{FlowEntry, FlowEntryError, FlowPath, FlowPathState, FlowPathSummary, SwitchState, UserState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FlowPathRow {
    flow_id: FlowId,
    installer_id: String,
    src: SwitchPort,
    dst: SwitchPort,
    match_filter: Match,
    actions: Vec<Action>,
    state: FlowPathState,
    intent_id: Option<IntentId>,
}

impl KvObject for FlowPathRow {
    const TABLE: &'static str = "flow_paths";

    fn key(&self) -> Vec<u8> {
        self.flow_id.to_key_bytes().to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FlowEntryRow {
    flow_entry_id: FlowEntryId,
    flow_id: FlowId,
    dpid: Dpid,
    flow_match: Match,
    actions: Vec<Action>,
    priority: u16,
    user_state: UserState,
    switch_state: SwitchState,
    error_state: Option<FlowEntryError>,
}

impl KvObject for FlowEntryRow {
    const TABLE: &'static str = "flow_entries";

    fn key(&self) -> Vec<u8> {
        self.flow_entry_id.to_key_bytes().to_vec()
    }
}

impl From<FlowEntryRow> for FlowEntry {
    fn from(row: FlowEntryRow) -> Self {
        FlowEntry {
            flow_entry_id: Some(row.flow_entry_id),
            flow_id: Some(row.flow_id),
            dpid: row.dpid,
            flow_match: row.flow_match,
            actions: row.actions,
            priority: row.priority,
            user_state: row.user_state,
            switch_state: row.switch_state,
            error_state: row.error_state,
        }
    }
}

impl FlowPathRow {
    fn into_path(self, entries: Vec<FlowEntryRow>) -> FlowPath {
        FlowPath {
            flow_id: Some(self.flow_id),
            installer_id: self.installer_id,
            src: self.src,
            dst: self.dst,
            match_filter: self.match_filter,
            actions: self.actions,
            state: self.state,
            intent_id: self.intent_id,
            entries: entries.into_iter().map(FlowEntry::from).collect(),
        }
    }
}

/// One operation of a flow batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowOperation {
    Add(FlowPath),
    Delete(FlowId),
}

pub struct FlowManager {
    store: Arc<Datastore>,
    topology: Option<Arc<Topology>>,
    flow_ids: IdGenerator<FlowId>,
    entry_ids: IdGenerator<FlowEntryId>,
    batch_ids: IdGenerator<FlowBatchId>,
    events: Arc<EventBus<ControllerEvent>>,
    write_lock: Mutex<()>,
}

impl FlowManager {
    pub fn new(
        store: Arc<Datastore>,
        allocator: Arc<dyn IdBlockAllocator>,
        events: Arc<EventBus<ControllerEvent>>,
    ) -> Self {
        Self {
            store,
            topology: None,
            flow_ids: IdGenerator::new(allocator.clone()),
            entry_ids: IdGenerator::new(allocator.clone()),
            batch_ids: IdGenerator::new(allocator),
            events,
            write_lock: Mutex::new(()),
        }
    }

    /// Reject entries on switches missing from `topology`
    pub fn with_topology(mut self, topology: Arc<Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    async fn entry_rows(&self) -> FlowgridResult<Vec<Versioned<FlowEntryRow>>> {
        self.store.read_all::<FlowEntryRow>().await
    }

    async fn entry_rows_for(&self, flow_id: FlowId) -> FlowgridResult<Vec<Versioned<FlowEntryRow>>> {
        let mut rows: Vec<_> = self
            .entry_rows()
            .await?
            .into_iter()
            .filter(|r| r.value.flow_id == flow_id)
            .collect();
        rows.sort_by_key(|r| r.value.flow_entry_id);
        Ok(rows)
    }

    async fn read_path(&self, flow_id: FlowId) -> FlowgridResult<Option<Versioned<FlowPathRow>>> {
        self.store
            .read::<FlowPathRow>(&flow_id.to_key_bytes())
            .await
            .optional()
    }

    async fn read_entry(&self, id: FlowEntryId) -> FlowgridResult<Option<Versioned<FlowEntryRow>>> {
        self.store
            .read::<FlowEntryRow>(&id.to_key_bytes())
            .await
            .optional()
    }

    /// Apply `ops`; if any of them fails, apply the matching `undo` op for
    /// every one that landed and return the first failure
    async fn write_with_rollback(
        &self,
        operation: &str,
        mut ops: Vec<WriteOp>,
        undo: Vec<WriteOp>,
    ) -> FlowgridResult<()> {
        debug_assert_eq!(ops.len(), undo.len());
        let result = self.store.multi_write(&mut ops).await;
        if let Ok(true) = result {
            return Ok(());
        }

        let mut compensation: Vec<WriteOp> = ops
            .iter()
            .zip(undo)
            .filter(|(op, _)| op.succeeded())
            .map(|(_, undo)| undo)
            .collect();
        if !compensation.is_empty() {
            warn!("{}: rolling back {} writes", operation, compensation.len());
            if !self.store.multi_write(&mut compensation).await.unwrap_or(false) {
                warn!("{}: rollback incomplete", operation);
            }
        }

        result?;
        Err(ops
            .iter()
            .find_map(WriteOp::failure)
            .unwrap_or_else(|| FlowgridError::internal(format!("{} failed without a cause", operation))))
    }

    fn check_switches(&self, entries: &[FlowEntry]) -> FlowgridResult<()> {
        let Some(topology) = &self.topology else {
            return Ok(());
        };
        let snapshot = topology.snapshot();
        match entries.iter().find(|e| snapshot.get_switch(e.dpid).is_none()) {
            Some(entry) => Err(FlowgridError::invalid_input(
                "entries",
                format!("switch {} is not in the topology", entry.dpid),
            )),
            None => Ok(()),
        }
    }

    /// Store a flow path and mark its entries for installation
    ///
    /// Entries already stored under the same flow keep their id and become
    /// MODIFY; new ones become ADD. Stored entries the new path no longer
    /// lists become DELETE.
    pub async fn add_flow(&self, path: FlowPath) -> FlowgridResult<FlowId> {
        if path.entries.is_empty() {
            return Err(FlowgridError::invalid_input("entries", "flow path has no entries"));
        }
        self.check_switches(&path.entries)?;

        let _guard = self.write_lock.lock().await;
        let flow_id = match path.flow_id {
            Some(id) => id,
            None => self.flow_ids.next_id().await?,
        };

        let prior_path = self.read_path(flow_id).await?;
        if let Some(prior) = &prior_path {
            if prior.value.installer_id != path.installer_id {
                return Err(FlowgridError::already_exists(format!(
                    "flow {} installed by {}",
                    flow_id, prior.value.installer_id
                )));
            }
        }
        let prior_entries: Vec<FlowEntryRow> = if prior_path.is_some() {
            self.entry_rows_for(flow_id)
                .await?
                .into_iter()
                .map(|r| r.value)
                .collect()
        } else {
            Vec::new()
        };

        let mut rows = Vec::with_capacity(path.entries.len());
        for entry in &path.entries {
            let existing = prior_entries.iter().find(|p| match entry.flow_entry_id {
                Some(id) => p.flow_entry_id == id,
                None => p.dpid == entry.dpid && p.flow_match == entry.flow_match && p.actions == entry.actions,
            });
            let flow_entry_id = match (entry.flow_entry_id, existing) {
                (Some(id), _) => id,
                (None, Some(p)) => p.flow_entry_id,
                (None, None) => self.entry_ids.next_id().await?,
            };
            rows.push(FlowEntryRow {
                flow_entry_id,
                flow_id,
                dpid: entry.dpid,
                flow_match: entry.flow_match.clone(),
                actions: entry.actions.clone(),
                priority: entry.priority,
                user_state: if existing.is_some() { UserState::Modify } else { UserState::Add },
                switch_state: SwitchState::NotUpdated,
                error_state: None,
            });
        }
        for stale in &prior_entries {
            if rows.iter().all(|r| r.flow_entry_id != stale.flow_entry_id) {
                rows.push(FlowEntryRow {
                    user_state: UserState::Delete,
                    switch_state: SwitchState::NotUpdated,
                    ..stale.clone()
                });
            }
        }

        let path_row = FlowPathRow {
            flow_id,
            installer_id: path.installer_id,
            src: path.src,
            dst: path.dst,
            match_filter: path.match_filter,
            actions: path.actions,
            state: FlowPathState::Installing,
            intent_id: path.intent_id,
        };

        let mut ops = vec![self.store.op_force_create(&path_row)?];
        let mut undo = vec![match &prior_path {
            Some(prior) => self.store.op_force_create(&prior.value)?,
            None => self.store.op_force_delete::<FlowPathRow>(path_row.key()),
        }];
        for row in &rows {
            ops.push(self.store.op_force_create(row)?);
            undo.push(match prior_entries.iter().find(|p| p.flow_entry_id == row.flow_entry_id) {
                Some(prior) => self.store.op_force_create(prior)?,
                None => self.store.op_force_delete::<FlowEntryRow>(row.key()),
            });
        }

        self.write_with_rollback("add_flow", ops, undo).await?;
        info!("Flow {} stored with {} entries", flow_id, rows.len());
        self.events.publish(FlowEvent::FlowAdded(flow_id));
        Ok(flow_id)
    }

    /// Mark every entry of a flow for deletion; unknown flows succeed
    pub async fn delete_flow(&self, flow_id: FlowId) -> FlowgridResult<()> {
        let _guard = self.write_lock.lock().await;
        let Some(path) = self.read_path(flow_id).await? else {
            debug!("Delete of unknown flow {}", flow_id);
            return Ok(());
        };

        let entries = self.entry_rows_for(flow_id).await?;
        if entries.is_empty() {
            self.store.force_delete::<FlowPathRow>(&path.value.key()).await?;
            self.events.publish(FlowEvent::FlowRemoved(flow_id));
            return Ok(());
        }

        let deleting = FlowPathRow {
            state: FlowPathState::Deleting,
            ..path.value.clone()
        };
        let mut ops = vec![self.store.op_update(&deleting, path.version)?];
        let mut undo = vec![self.store.op_force_create(&path.value)?];
        for entry in entries {
            if entry.value.user_state == UserState::Delete && entry.value.switch_state == SwitchState::NotUpdated {
                continue;
            }
            let marked = FlowEntryRow {
                user_state: UserState::Delete,
                switch_state: SwitchState::NotUpdated,
                ..entry.value.clone()
            };
            ops.push(self.store.op_update(&marked, entry.version)?);
            undo.push(self.store.op_force_create(&entry.value)?);
        }

        self.write_with_rollback("delete_flow", ops, undo).await?;
        info!("Flow {} marked for deletion", flow_id);
        Ok(())
    }

    /// Drop a flow and all its entries from the datastore at once
    pub async fn clear_flow(&self, flow_id: FlowId) -> FlowgridResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut ops = vec![self.store.op_force_delete::<FlowPathRow>(flow_id.to_key_bytes().to_vec())];
        for entry in self.entry_rows_for(flow_id).await? {
            ops.push(self.store.op_force_delete::<FlowEntryRow>(entry.value.key()));
        }
        if !self.store.multi_write(&mut ops).await? {
            warn!("Clearing flow {} left rows behind", flow_id);
        }
        self.events.publish(FlowEvent::FlowRemoved(flow_id));
        Ok(())
    }

    pub async fn get_flow(&self, flow_id: FlowId) -> FlowgridResult<Option<FlowPath>> {
        let Some(path) = self.read_path(flow_id).await? else {
            return Ok(None);
        };
        let entries = self
            .entry_rows_for(flow_id)
            .await?
            .into_iter()
            .map(|r| r.value)
            .collect();
        Ok(Some(path.value.into_path(entries)))
    }

    /// Every stored flow path ordered by id
    pub async fn get_all_flows(&self) -> FlowgridResult<Vec<FlowPath>> {
        let mut by_flow: HashMap<FlowId, Vec<FlowEntryRow>> = HashMap::new();
        for row in self.entry_rows().await? {
            by_flow.entry(row.value.flow_id).or_default().push(row.value);
        }
        let mut paths: BTreeMap<FlowId, FlowPath> = BTreeMap::new();
        for path in self.store.read_all::<FlowPathRow>().await? {
            let flow_id = path.value.flow_id;
            let mut entries = by_flow.remove(&flow_id).unwrap_or_default();
            entries.sort_by_key(|e| e.flow_entry_id);
            paths.insert(flow_id, path.value.into_path(entries));
        }
        Ok(paths.into_values().collect())
    }

    pub async fn get_all_flows_for(
        &self,
        installer_id: &str,
        src: SwitchPort,
        dst: SwitchPort,
    ) -> FlowgridResult<Vec<FlowPath>> {
        Ok(self
            .get_all_flows()
            .await?
            .into_iter()
            .filter(|p| p.installer_id == installer_id && p.src == src && p.dst == dst)
            .collect())
    }

    /// Up to `max` summaries of flows with id at or above `start`
    pub async fn get_all_flows_summary(&self, start: FlowId, max: usize) -> FlowgridResult<Vec<FlowPathSummary>> {
        let mut counts: HashMap<FlowId, usize> = HashMap::new();
        for row in self.entry_rows().await? {
            *counts.entry(row.value.flow_id).or_default() += 1;
        }
        let mut paths: Vec<FlowPathRow> = self
            .store
            .read_all::<FlowPathRow>()
            .await?
            .into_iter()
            .map(|p| p.value)
            .filter(|p| p.flow_id >= start)
            .collect();
        paths.sort_by_key(|p| p.flow_id);
        Ok(paths
            .into_iter()
            .take(max)
            .map(|p| FlowPathSummary {
                entry_count: counts.get(&p.flow_id).copied().unwrap_or_default(),
                flow_id: p.flow_id,
                installer_id: p.installer_id,
                src: p.src,
                dst: p.dst,
                state: p.state,
            })
            .collect())
    }

    /// Apply the operations in order, stopping at the first failure
    pub async fn execute_batch(&self, ops: Vec<FlowOperation>) -> FlowgridResult<FlowBatchId> {
        let batch_id = self.batch_ids.next_id().await?;
        for op in ops {
            match op {
                FlowOperation::Add(path) => {
                    self.add_flow(path).await?;
                }
                FlowOperation::Delete(flow_id) => self.delete_flow(flow_id).await?,
            }
        }
        debug!("Flow batch {} applied", batch_id);
        Ok(batch_id)
    }

    /// Every stored entry for `dpid`, ordered by id
    pub async fn entries_for_switch(&self, dpid: Dpid) -> FlowgridResult<Vec<FlowEntry>> {
        let mut rows: Vec<FlowEntryRow> = self
            .entry_rows()
            .await?
            .into_iter()
            .map(|r| r.value)
            .filter(|r| r.dpid == dpid)
            .collect();
        rows.sort_by_key(|r| r.flow_entry_id);
        Ok(rows.into_iter().map(FlowEntry::from).collect())
    }

    /// Record that the switch applied an ADD or MODIFY entry
    ///
    /// Returns `false` without writing when the entry is gone, already
    /// updated, or its user state is no longer `pushed`.
    pub async fn mark_updated(&self, id: FlowEntryId, pushed: UserState) -> FlowgridResult<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(entry) = self.read_entry(id).await? else {
            return Ok(false);
        };
        if entry.value.user_state != pushed || entry.value.switch_state == SwitchState::Updated {
            debug!("Ignoring stale acknowledgement for entry {}", id);
            return Ok(false);
        }

        let flow_id = entry.value.flow_id;
        let dpid = entry.value.dpid;
        let updated = FlowEntryRow {
            switch_state: SwitchState::Updated,
            error_state: None,
            ..entry.value
        };
        self.store.update(&updated, entry.version).await?;

        let all_updated = self
            .entry_rows_for(flow_id)
            .await?
            .iter()
            .all(|r| r.value.switch_state == SwitchState::Updated);
        if all_updated {
            if let Some(path) = self.read_path(flow_id).await? {
                if path.value.state == FlowPathState::Installing {
                    let installed = FlowPathRow {
                        state: FlowPathState::Installed,
                        ..path.value
                    };
                    self.store
                        .update(&installed, path.version)
                        .await
                        .log_if_error("mark flow installed")?;
                }
            }
        }

        self.events.publish(FlowEvent::FlowEntryUpdated { flow_entry_id: id, dpid });
        Ok(true)
    }

    /// Remove a DELETE entry the switch has acknowledged, and its flow path
    /// once no entries remain
    pub async fn remove_entry(&self, id: FlowEntryId) -> FlowgridResult<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(entry) = self.read_entry(id).await? else {
            return Ok(false);
        };
        if entry.value.user_state != UserState::Delete {
            debug!("Entry {} is no longer marked for deletion", id);
            return Ok(false);
        }

        let flow_id = entry.value.flow_id;
        let dpid = entry.value.dpid;
        self.store.delete::<FlowEntryRow>(&entry.value.key(), entry.version).await?;
        self.events.publish(FlowEvent::FlowEntryUpdated { flow_entry_id: id, dpid });

        if self.entry_rows_for(flow_id).await?.is_empty() {
            self.store.force_delete::<FlowPathRow>(&flow_id.to_key_bytes()).await?;
            info!("Flow {} removed, no entries left", flow_id);
            self.events.publish(FlowEvent::FlowRemoved(flow_id));
        }
        Ok(true)
    }

    /// Attach an error to an entry
    pub async fn record_error(&self, id: FlowEntryId, error: FlowEntryError) -> FlowgridResult<()> {
        let _guard = self.write_lock.lock().await;
        let Some(entry) = self.read_entry(id).await? else {
            return Ok(());
        };
        let failed = FlowEntryRow {
            error_state: Some(error),
            ..entry.value
        };
        self.store.update(&failed, entry.version).await?;
        Ok(())
    }
}
