//! Flow synchroniser
//!
//! Pushes the stored flow entries of a switch that are not yet applied, and
//! folds the pusher's barrier acknowledgements back into the datastore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::common::ResultContext;
use crate::error::{ErrorKind, FlowgridResult};
use crate::flows::{FlowEntryError, FlowManager, SwitchState, UserState};
use crate::pusher::{FlowPusher, PendingEntry, PushNotice};
use crate::registry::ControllerRegistry;
use crate::types::Dpid;

/// Error type recorded for entries the pusher gave up on
const PUSH_FAILED_ERROR_TYPE: u16 = 0xffff;

/// Failed pushes after which an entry is left alone until its state changes
const MAX_PUSH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct FailedPush {
    attempts: u32,
    retry_at: Instant,
}

impl FailedPush {
    fn allows_retry(&self, now: Instant) -> bool {
        self.attempts < MAX_PUSH_ATTEMPTS && now >= self.retry_at
    }
}

pub struct FlowSynchronizer {
    registry: Arc<dyn ControllerRegistry>,
    flows: Arc<FlowManager>,
    pusher: Arc<FlowPusher>,
    /// Pushed but not yet acknowledged, keyed by (entry, user state)
    in_flight: Mutex<HashMap<PendingEntry, Dpid>>,
    /// Entries the pusher gave up on; retried after a growing delay
    failed: Mutex<HashMap<PendingEntry, FailedPush>>,
    interval: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FlowSynchronizer {
    pub fn new(
        registry: Arc<dyn ControllerRegistry>,
        flows: Arc<FlowManager>,
        pusher: Arc<FlowPusher>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            flows,
            pusher,
            in_flight: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
            interval,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Push every NOT_UPDATED entry of `dpid` that is not already in flight
    ///
    /// Entries whose push failed wait `interval * attempts` before the next
    /// try, and are skipped for good after [`MAX_PUSH_ATTEMPTS`] failures
    /// until their user state changes.
    ///
    /// Returns the number of flow-mods queued. Does nothing unless this
    /// instance masters the switch and the switch is connected.
    pub async fn synchronize(&self, dpid: Dpid) -> FlowgridResult<usize> {
        if !self.registry.has_control(dpid) {
            debug!("Not master for {}, skipping synchronisation", dpid);
            return Ok(0);
        }
        if !self.pusher.is_registered(dpid) {
            debug!("Switch {} is not connected, skipping synchronisation", dpid);
            return Ok(0);
        }

        let entries = self.flows.entries_for_switch(dpid).await?;
        let now = Instant::now();
        let mut pushed = 0;
        for entry in entries.into_iter().filter(|e| e.switch_state == SwitchState::NotUpdated) {
            let Some(flow_entry_id) = entry.flow_entry_id else {
                continue;
            };
            let pending = PendingEntry {
                flow_entry_id,
                user_state: entry.user_state,
            };
            if let Some(failed) = self.failed.lock().get(&pending) {
                if !failed.allows_retry(now) {
                    continue;
                }
            }
            if self.in_flight.lock().insert(pending, dpid).is_some() {
                continue;
            }
            if let Err(e) = self.pusher.push_flow_entry(dpid, entry.to_flow_mod(), pending) {
                self.in_flight.lock().remove(&pending);
                if e.kind() == ErrorKind::Transient {
                    debug!("Queue for {} is full, resuming next round", dpid);
                } else {
                    warn!("Could not queue entry {} for {}: {}", flow_entry_id, dpid, e);
                }
                break;
            }
            pushed += 1;
        }

        let awaiting = self.in_flight.lock().values().any(|d| *d == dpid);
        if pushed > 0 || awaiting {
            // The reply is consumed through the notice channel
            drop(self.pusher.barrier(dpid).log_if_error("queue barrier")?);
        }
        if pushed > 0 {
            debug!("Queued {} entries for {}", pushed, dpid);
        }
        Ok(pushed)
    }

    /// Synchronise every switch this instance masters
    pub async fn synchronize_all(&self) -> usize {
        let Some(id) = self.registry.get_onos_instance_id() else {
            return 0;
        };
        let dpids = match self.registry.get_switches_controlled_by_controller(id.as_str()).await {
            Ok(dpids) => dpids,
            Err(e) => {
                warn!("Could not list switches of {}: {}", id, e);
                return 0;
            }
        };
        let mut total = 0;
        for dpid in dpids {
            match self.synchronize(dpid).await {
                Ok(n) => total += n,
                Err(e) => warn!("Synchronising {} failed: {}", dpid, e),
            }
        }
        total
    }

    /// Fold one pusher notice into the datastore
    pub async fn handle_notice(&self, notice: PushNotice) {
        match notice {
            PushNotice::Acked { dpid, xid, entries } => {
                debug!("Barrier {} from {} acknowledged {} entries", xid, dpid, entries.len());
                for pending in entries {
                    let id = pending.flow_entry_id;
                    let result = match pending.user_state {
                        UserState::Delete => self.flows.remove_entry(id).await,
                        state => self.flows.mark_updated(id, state).await,
                    };
                    if let Err(e) = result {
                        warn!("Applying acknowledgement for entry {} failed: {}", id, e);
                    }
                    self.in_flight.lock().remove(&pending);
                    self.failed.lock().retain(|p, _| p.flow_entry_id != id);
                }
            }
            PushNotice::Failed { dpid, entries, reason } => {
                for pending in entries {
                    let error = FlowEntryError {
                        error_type: PUSH_FAILED_ERROR_TYPE,
                        error_code: 0,
                        message: reason.clone(),
                    };
                    if let Err(e) = self.flows.record_error(pending.flow_entry_id, error).await {
                        warn!("Recording push failure of entry {} failed: {}", pending.flow_entry_id, e);
                    }
                    self.in_flight.lock().remove(&pending);
                    self.note_failure(pending);
                }
                warn!("Pushing to {} failed: {}", dpid, reason);
            }
            PushNotice::Cancelled { dpid, entries } => {
                debug!("{} pushes to {} were cancelled", entries.len(), dpid);
                let mut in_flight = self.in_flight.lock();
                for pending in entries {
                    in_flight.remove(&pending);
                }
            }
        }
    }

    fn note_failure(&self, pending: PendingEntry) {
        let mut failed = self.failed.lock();
        let record = failed.entry(pending).or_insert(FailedPush {
            attempts: 0,
            retry_at: Instant::now(),
        });
        record.attempts += 1;
        record.retry_at = Instant::now() + self.interval * record.attempts;
        if record.attempts >= MAX_PUSH_ATTEMPTS {
            warn!(
                "Entry {} failed {} pushes, not retrying until it changes",
                pending.flow_entry_id, record.attempts
            );
        }
    }

    /// Start the acknowledgement loop and the periodic reader
    pub fn start(self: &Arc<Self>, mut notices: mpsc::UnboundedReceiver<PushNotice>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }

        let sync = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                sync.handle_notice(notice).await;
            }
            debug!("Push notice channel closed");
        }));

        let sync = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let pushed = sync.synchronize_all().await;
                if pushed > 0 {
                    debug!("Periodic synchronisation queued {} entries", pushed);
                }
            }
        }));
        info!("Flow synchroniser started (interval {:?})", self.interval);
    }

    /// Synchronise `dpid` on a background task
    pub fn kick(self: &Arc<Self>, dpid: Dpid) {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = sync.synchronize(dpid).await {
                warn!("Synchronising {} failed: {}", dpid, e);
            }
        });
    }

    pub fn shutdown(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}
