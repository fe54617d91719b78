//! Per-switch flow pusher
//!
//! Every connected switch has one queue with two priorities. Queues are
//! sharded over a fixed pool of worker tasks by `dpid % threads`, so one
//! worker writes all messages for a switch and per-switch order is FIFO
//! within a priority. Each switch has a byte budget per second, and a queue
//! refuses new messages once it holds more than its byte limit.
//!
//! Flow-mods pushed with [`FlowPusher::push_flow_entry`] are remembered until
//! the next barrier has been written, and then until the switch answers that
//! barrier. The answer releases them as a [`PushNotice::Acked`] on the notice
//! channel, which the synchroniser consumes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PusherConfig;
use crate::error::{FlowgridError, FlowgridResult};
use crate::events::{ControllerEvent, EventBus, FlowEvent};
use crate::flows::UserState;
use crate::openflow::{FlowMod, OfMessage, SwitchConnection};
use crate::types::{Dpid, FlowEntryId};

pub mod damper;
pub mod rate;

pub use damper::MessageDamper;
use rate::ByteBucket;

/// Messages a worker writes to one switch before moving to the next
const MAX_BATCH_PER_SWITCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPriority {
    High,
    Normal,
}

/// Flow entry realised by a pushed flow-mod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingEntry {
    pub flow_entry_id: FlowEntryId,
    pub user_state: UserState,
}

/// Outcome of pushed entries, delivered in order per switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushNotice {
    /// The switch answered the barrier that followed these entries
    Acked {
        dpid: Dpid,
        xid: u32,
        entries: Vec<PendingEntry>,
    },
    /// Writing failed even after a retry
    Failed {
        dpid: Dpid,
        entries: Vec<PendingEntry>,
        reason: String,
    },
    /// Dropped with the queue before reaching the switch or before an answer
    Cancelled { dpid: Dpid, entries: Vec<PendingEntry> },
}

struct QueuedMessage {
    msg: OfMessage,
    entry: Option<PendingEntry>,
}

struct SwitchQueue {
    high: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
    queued_bytes: usize,
    bucket: ByteBucket,
    written_since_barrier: Vec<PendingEntry>,
    pending_barriers: HashMap<u32, Vec<PendingEntry>>,
    barrier_waiters: HashMap<u32, oneshot::Sender<()>>,
    /// Set by a non-forced delete; the queue is removed once drained, or
    /// at this deadline if the last barrier is never answered
    closing: Option<Instant>,
}

impl SwitchQueue {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            queued_bytes: 0,
            bucket: ByteBucket::new(bytes_per_sec),
            written_since_barrier: Vec::new(),
            pending_barriers: HashMap::new(),
            barrier_waiters: HashMap::new(),
            closing: None,
        }
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    /// Next message if the byte budget allows it, else how long to wait
    fn pop_ready(&mut self) -> Result<Option<QueuedMessage>, Duration> {
        let front = match self.high.front().or_else(|| self.normal.front()) {
            Some(m) => m,
            None => return Ok(None),
        };
        let len = front.msg.wire_len();
        if !self.bucket.try_take(len) {
            return Err(self.bucket.wait_time(len));
        }
        let msg = match self.high.pop_front() {
            Some(m) => m,
            None => match self.normal.pop_front() {
                Some(m) => m,
                None => return Ok(None),
            },
        };
        self.queued_bytes = self.queued_bytes.saturating_sub(len);
        if let OfMessage::BarrierRequest { xid } = msg.msg {
            self.seal_barrier(xid);
        }
        Ok(Some(msg))
    }

    /// Attach everything written so far to barrier `xid`
    fn seal_barrier(&mut self, xid: u32) {
        let entries = std::mem::take(&mut self.written_since_barrier);
        self.pending_barriers.insert(xid, entries);
    }

    /// Undo `seal_barrier` after the barrier could not be written
    fn unseal_barrier(&mut self, xid: u32) {
        if let Some(mut entries) = self.pending_barriers.remove(&xid) {
            entries.append(&mut self.written_since_barrier);
            self.written_since_barrier = entries;
        }
        self.barrier_waiters.remove(&xid);
    }

    /// Drop whatever would be written after the next barrier
    ///
    /// High-priority messages go out before normal ones, so the cut follows
    /// that order. Without a queued barrier everything is dropped.
    fn cut_after_next_barrier(&mut self) -> Vec<QueuedMessage> {
        let mut cut: Vec<QueuedMessage> = Vec::new();
        match self.high.iter().position(|m| m.msg.is_barrier()) {
            Some(i) => {
                cut.extend(self.high.drain(i + 1..));
                cut.extend(self.normal.drain(..));
            }
            None => match self.normal.iter().position(|m| m.msg.is_barrier()) {
                Some(i) => cut.extend(self.normal.drain(i + 1..)),
                None => {
                    cut.extend(self.high.drain(..));
                    cut.extend(self.normal.drain(..));
                }
            },
        }
        for m in &cut {
            self.queued_bytes = self.queued_bytes.saturating_sub(m.msg.wire_len());
            if let OfMessage::BarrierRequest { xid } = m.msg {
                self.barrier_waiters.remove(&xid);
            }
        }
        cut
    }

    /// Closing and either drained or past its deadline
    fn ready_to_close(&self, now: Instant) -> bool {
        match self.closing {
            Some(deadline) => self.pending_barriers.is_empty() || now >= deadline,
            None => false,
        }
    }

    /// Empty the queue, returning every entry it still tracked
    fn drain_all(&mut self) -> Vec<PendingEntry> {
        let mut entries: Vec<PendingEntry> = self
            .high
            .drain(..)
            .chain(self.normal.drain(..))
            .filter_map(|m| m.entry)
            .collect();
        entries.append(&mut self.written_since_barrier);
        for (_, mut pending) in self.pending_barriers.drain() {
            entries.append(&mut pending);
        }
        self.barrier_waiters.clear();
        self.queued_bytes = 0;
        entries
    }
}

struct Worker {
    queues: Mutex<HashMap<Dpid, SwitchQueue>>,
    notify: Notify,
}

pub struct FlowPusher {
    config: PusherConfig,
    workers: Vec<Arc<Worker>>,
    connections: DashMap<Dpid, Arc<dyn SwitchConnection>>,
    damper: Option<Arc<MessageDamper>>,
    events: Arc<EventBus<ControllerEvent>>,
    notices: mpsc::UnboundedSender<PushNotice>,
    next_xid: AtomicU32,
    stopped: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FlowPusher {
    /// Create the pusher and the receiving end of its notice channel
    pub fn new(
        config: PusherConfig,
        damper: Option<Arc<MessageDamper>>,
        events: Arc<EventBus<ControllerEvent>>,
    ) -> (Self, mpsc::UnboundedReceiver<PushNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let threads = config.threads.max(1);
        let workers = (0..threads)
            .map(|_| {
                Arc::new(Worker {
                    queues: Mutex::new(HashMap::new()),
                    notify: Notify::new(),
                })
            })
            .collect();
        let pusher = Self {
            config,
            workers,
            connections: DashMap::new(),
            damper,
            events,
            notices: tx,
            next_xid: AtomicU32::new(1),
            stopped: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        };
        (pusher, rx)
    }

    /// Spawn the worker tasks
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        for index in 0..self.workers.len() {
            let pusher = Arc::clone(self);
            handles.push(tokio::spawn(async move { pusher.run_worker(index).await }));
        }
        info!("Flow pusher started with {} workers", self.workers.len());
    }

    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.notify.notify_one();
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Pusher worker ended abnormally: {}", e);
            }
        }
    }

    fn worker_for(&self, dpid: Dpid) -> &Arc<Worker> {
        let index = (dpid.value() % self.workers.len() as u64) as usize;
        &self.workers[index]
    }

    fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    fn notify(&self, notice: PushNotice) {
        if self.notices.send(notice).is_err() {
            debug!("Push notice receiver is gone");
        }
    }

    /// Register a connected switch and create its queue
    ///
    /// A queue still closing from an earlier connection is replaced, and
    /// what it still held is cancelled.
    pub fn add_switch(&self, conn: Arc<dyn SwitchConnection>) {
        let dpid = conn.dpid();
        let replaced = {
            let mut queues = self.worker_for(dpid).queues.lock();
            self.connections.insert(dpid, conn);
            match queues.get(&dpid) {
                Some(queue) if queue.closing.is_none() => None,
                _ => queues.insert(dpid, SwitchQueue::new(self.config.bytes_per_sec)),
            }
        };
        if let Some(mut stale) = replaced {
            let leftover = stale.drain_all();
            debug!("Replaced closing push queue for {}", dpid);
            if !leftover.is_empty() {
                self.notify(PushNotice::Cancelled { dpid, entries: leftover });
            }
        }
        debug!("Switch {} registered with the pusher", dpid);
    }

    pub fn is_registered(&self, dpid: Dpid) -> bool {
        self.connections.contains_key(&dpid)
    }

    /// Messages waiting for `dpid`
    pub fn queued_messages(&self, dpid: Dpid) -> usize {
        self.worker_for(dpid)
            .queues
            .lock()
            .get(&dpid)
            .map(SwitchQueue::len)
            .unwrap_or_default()
    }

    fn enqueue(
        &self,
        dpid: Dpid,
        msg: QueuedMessage,
        priority: PushPriority,
        waiter: Option<(u32, oneshot::Sender<()>)>,
    ) -> FlowgridResult<()> {
        let worker = self.worker_for(dpid);
        {
            let mut queues = worker.queues.lock();
            let queue = queues
                .get_mut(&dpid)
                .ok_or_else(|| FlowgridError::not_found(format!("push queue for switch {}", dpid)))?;
            if queue.closing.is_some() {
                return Err(FlowgridError::InvalidOperation {
                    operation: "push".to_string(),
                    reason: format!("queue for switch {} is closing", dpid),
                });
            }
            let len = msg.msg.wire_len();
            if queue.queued_bytes + len > self.config.max_queue_bytes {
                return Err(FlowgridError::transient(
                    "push",
                    format!("queue for switch {} holds {} bytes", dpid, queue.queued_bytes),
                ));
            }
            queue.queued_bytes += len;
            match priority {
                PushPriority::High => queue.high.push_back(msg),
                PushPriority::Normal => queue.normal.push_back(msg),
            }
            if let Some((xid, tx)) = waiter {
                queue.barrier_waiters.insert(xid, tx);
            }
        }
        worker.notify.notify_one();
        Ok(())
    }

    /// Queue a message; spills back with `Transient` when over budget
    pub fn add(&self, dpid: Dpid, msg: OfMessage, priority: PushPriority) -> FlowgridResult<()> {
        self.enqueue(dpid, QueuedMessage { msg, entry: None }, priority, None)
    }

    /// Queue the flow-mod realising `entry`
    pub fn push_flow_entry(&self, dpid: Dpid, flow_mod: FlowMod, entry: PendingEntry) -> FlowgridResult<()> {
        let msg = QueuedMessage {
            msg: OfMessage::FlowMod(flow_mod),
            entry: Some(entry),
        };
        self.enqueue(dpid, msg, PushPriority::Normal, None)
    }

    /// Queue a barrier; the receiver resolves when the switch answers it
    pub fn barrier(&self, dpid: Dpid) -> FlowgridResult<oneshot::Receiver<()>> {
        let xid = self.next_xid();
        let (tx, rx) = oneshot::channel();
        let msg = QueuedMessage {
            msg: OfMessage::BarrierRequest { xid },
            entry: None,
        };
        self.enqueue(dpid, msg, PushPriority::Normal, Some((xid, tx)))?;
        Ok(rx)
    }

    /// Handle a barrier reply from `dpid`
    pub fn barrier_reply(&self, dpid: Dpid, xid: u32) {
        let (entries, waiter) = {
            let mut queues = self.worker_for(dpid).queues.lock();
            match queues.get_mut(&dpid) {
                Some(queue) => (queue.pending_barriers.remove(&xid), queue.barrier_waiters.remove(&xid)),
                None => (None, None),
            }
        };
        if entries.is_none() && waiter.is_none() {
            debug!("Barrier reply {} from {} matches nothing", xid, dpid);
        }
        if let Some(entries) = entries {
            if !entries.is_empty() {
                self.notify(PushNotice::Acked { dpid, xid, entries });
            }
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
    }

    /// Drop the queue of a switch
    ///
    /// With `force` everything pending is dropped at once. Otherwise the
    /// queue is cut after its next barrier, drained, and then removed.
    /// Returns the number of messages dropped.
    pub fn delete_queue(&self, dpid: Dpid, force: bool) -> usize {
        let worker = self.worker_for(dpid);
        let (dropped, cancelled) = {
            let mut queues = worker.queues.lock();
            let Some(queue) = queues.get_mut(&dpid) else {
                return 0;
            };
            if force {
                let dropped = queue.len();
                let cancelled = queue.drain_all();
                queues.remove(&dpid);
                self.connections.remove(&dpid);
                (dropped, cancelled)
            } else {
                let cut = queue.cut_after_next_barrier();
                let cancelled: Vec<PendingEntry> = cut.iter().filter_map(|m| m.entry).collect();
                queue.closing = Some(Instant::now() + self.config.drain_timeout);
                (cut.len(), cancelled)
            }
        };

        if force {
            if let Some(damper) = &self.damper {
                damper.forget_switch(dpid);
            }
        }
        if !cancelled.is_empty() {
            self.notify(PushNotice::Cancelled { dpid, entries: cancelled });
        }
        worker.notify.notify_one();
        info!("Deleted push queue for {} (force={}, dropped {})", dpid, force, dropped);
        dropped
    }

    async fn run_worker(self: Arc<Self>, index: usize) {
        let worker = Arc::clone(&self.workers[index]);
        debug!("Pusher worker {} running", index);
        while !self.stopped.load(Ordering::SeqCst) {
            let wait = self.drain_worker(&worker).await;
            let idle = wait
                .map(|w| w.min(self.config.idle_poll))
                .unwrap_or(self.config.idle_poll)
                .max(Duration::from_millis(1));
            tokio::select! {
                _ = worker.notify.notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
        }
        debug!("Pusher worker {} stopped", index);
    }

    /// One pass over the worker's switches; returns the shortest throttle wait
    async fn drain_worker(&self, worker: &Worker) -> Option<Duration> {
        let dpids: Vec<Dpid> = worker.queues.lock().keys().copied().collect();
        let mut min_wait: Option<Duration> = None;

        for dpid in dpids {
            for _ in 0..MAX_BATCH_PER_SWITCH {
                let next = {
                    let mut queues = worker.queues.lock();
                    let Some(queue) = queues.get_mut(&dpid) else {
                        break;
                    };
                    match queue.pop_ready() {
                        Ok(Some(msg)) => msg,
                        Ok(None) => {
                            if queue.ready_to_close(Instant::now()) {
                                let leftover = queue.drain_all();
                                queues.remove(&dpid);
                                self.connections.remove(&dpid);
                                if !leftover.is_empty() {
                                    self.notify(PushNotice::Cancelled { dpid, entries: leftover });
                                }
                                debug!("Push queue for {} drained and closed", dpid);
                            }
                            break;
                        }
                        Err(wait) => {
                            min_wait = Some(min_wait.map_or(wait, |m| m.min(wait)));
                            break;
                        }
                    }
                };
                self.deliver(worker, dpid, next).await;
            }
        }
        min_wait
    }

    fn record_written(&self, worker: &Worker, dpid: Dpid, entry: Option<PendingEntry>) {
        let Some(entry) = entry else {
            return;
        };
        match worker.queues.lock().get_mut(&dpid) {
            Some(queue) => queue.written_since_barrier.push(entry),
            // Queue deleted while the write was in progress
            None => self.notify(PushNotice::Cancelled {
                dpid,
                entries: vec![entry],
            }),
        }
    }

    async fn deliver(&self, worker: &Worker, dpid: Dpid, queued: QueuedMessage) {
        let Some(conn) = self.connections.get(&dpid).map(|c| Arc::clone(c.value())) else {
            debug!("Switch {} is gone, dropping message", dpid);
            if let Some(entry) = queued.entry {
                self.notify(PushNotice::Cancelled {
                    dpid,
                    entries: vec![entry],
                });
            }
            return;
        };

        match &queued.msg {
            OfMessage::BarrierRequest { xid } => {
                if let Err(e) = conn.write(queued.msg.clone()).await {
                    warn!("Barrier {} to {} failed: {}", xid, dpid, e);
                    if let Some(queue) = worker.queues.lock().get_mut(&dpid) {
                        queue.unseal_barrier(*xid);
                    }
                }
            }
            OfMessage::FlowMod(flow_mod) => {
                if let Some(damper) = &self.damper {
                    if damper.should_suppress(dpid, flow_mod) {
                        debug!("Damped flow-mod to {} (cookie {:#x})", dpid, flow_mod.cookie);
                        self.record_written(worker, dpid, queued.entry);
                        return;
                    }
                }
                if let Err(first) = conn.write(queued.msg.clone()).await {
                    warn!("Flow-mod to {} failed, retrying after a barrier: {}", dpid, first);
                    let xid = self.next_xid();
                    if let Some(queue) = worker.queues.lock().get_mut(&dpid) {
                        queue.seal_barrier(xid);
                    }
                    if conn.write(OfMessage::BarrierRequest { xid }).await.is_err() {
                        if let Some(queue) = worker.queues.lock().get_mut(&dpid) {
                            queue.unseal_barrier(xid);
                        }
                    }
                    if let Err(second) = conn.write(queued.msg.clone()).await {
                        self.fail_switch(worker, dpid, queued.entry, second);
                        return;
                    }
                }
                self.record_written(worker, dpid, queued.entry);
            }
            OfMessage::PacketOut(_) => {
                if let Err(e) = conn.write(queued.msg.clone()).await {
                    warn!("Packet-out to {} failed: {}", dpid, e);
                }
            }
        }
    }

    /// Persistent write failure: drop everything queued for the switch
    fn fail_switch(&self, worker: &Worker, dpid: Dpid, entry: Option<PendingEntry>, error: FlowgridError) {
        let reason = FlowgridError::switch_write_failed(dpid, error.to_string()).to_string();
        warn!("{}; dropping queued messages", reason);

        let dropped: Vec<PendingEntry> = {
            let mut queues = worker.queues.lock();
            match queues.get_mut(&dpid) {
                Some(queue) => {
                    let dropped: Vec<PendingEntry> = queue
                        .high
                        .drain(..)
                        .chain(queue.normal.drain(..))
                        .filter_map(|m| m.entry)
                        .collect();
                    let sealed = &queue.pending_barriers;
                    queue.barrier_waiters.retain(|xid, _| sealed.contains_key(xid));
                    queue.queued_bytes = 0;
                    dropped
                }
                None => Vec::new(),
            }
        };

        self.events.publish(FlowEvent::FlowEntryFailed {
            flow_entry_id: entry.map(|e| e.flow_entry_id),
            dpid,
            reason: reason.clone(),
        });
        if let Some(entry) = entry {
            self.notify(PushNotice::Failed {
                dpid,
                entries: vec![entry],
                reason,
            });
        }
        if !dropped.is_empty() {
            self.notify(PushNotice::Cancelled { dpid, entries: dropped });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow::{Action, FlowModCommand, Match};
    use crate::types::PortNumber;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct TestSwitch {
        dpid: Dpid,
        written: Mutex<Vec<OfMessage>>,
        failures_left: AtomicUsize,
    }

    impl TestSwitch {
        fn new(dpid: u64, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                dpid: Dpid(dpid),
                written: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(failures),
            })
        }

        fn flow_mods(&self) -> Vec<FlowMod> {
            self.written
                .lock()
                .iter()
                .filter_map(|m| match m {
                    OfMessage::FlowMod(fm) => Some(fm.clone()),
                    _ => None,
                })
                .collect()
        }

        fn barriers(&self) -> Vec<u32> {
            self.written
                .lock()
                .iter()
                .filter_map(|m| match m {
                    OfMessage::BarrierRequest { xid } => Some(*xid),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl SwitchConnection for TestSwitch {
        fn dpid(&self) -> Dpid {
            self.dpid
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn write(&self, msg: OfMessage) -> FlowgridResult<()> {
            if msg.is_barrier() {
                self.written.lock().push(msg);
                return Ok(());
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(FlowgridError::transient("write", "socket closed"));
            }
            self.written.lock().push(msg);
            Ok(())
        }
    }

    fn config() -> PusherConfig {
        PusherConfig {
            threads: 2,
            bytes_per_sec: 1_000_000,
            max_queue_bytes: 1_000,
            idle_poll: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(5),
        }
    }

    fn pusher(damper: bool) -> (Arc<FlowPusher>, mpsc::UnboundedReceiver<PushNotice>) {
        let damper = if damper {
            Some(Arc::new(MessageDamper::new(64, Duration::from_secs(5)).unwrap()))
        } else {
            None
        };
        let (pusher, rx) = FlowPusher::new(config(), damper, Arc::new(EventBus::new(16)));
        let pusher = Arc::new(pusher);
        pusher.start();
        (pusher, rx)
    }

    fn flow_mod(command: FlowModCommand, port: u32) -> FlowMod {
        FlowMod::new(command, Match::match_all(), vec![Action::output(PortNumber(port))])
    }

    fn pending(id: u64, user_state: UserState) -> PendingEntry {
        PendingEntry {
            flow_entry_id: FlowEntryId(id),
            user_state,
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_fifo_per_switch() {
        let (pusher, _rx) = pusher(false);
        let switch = TestSwitch::new(1, 0);
        pusher.add_switch(switch.clone());
        for port in 1..=5 {
            pusher
                .add(Dpid(1), OfMessage::FlowMod(flow_mod(FlowModCommand::Add, port)), PushPriority::Normal)
                .unwrap();
        }
        eventually(|| switch.flow_mods().len() == 5).await;
        let ports: Vec<u32> = switch
            .flow_mods()
            .iter()
            .map(|fm| match fm.actions[0] {
                Action::Output { port, .. } => port.value(),
                _ => 0,
            })
            .collect();
        assert_eq!(ports, vec![1, 2, 3, 4, 5]);
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_barrier_acknowledges_entries() {
        let (pusher, mut rx) = pusher(false);
        let switch = TestSwitch::new(3, 0);
        pusher.add_switch(switch.clone());
        pusher
            .push_flow_entry(Dpid(3), flow_mod(FlowModCommand::Add, 1), pending(10, UserState::Add))
            .unwrap();
        pusher
            .push_flow_entry(Dpid(3), flow_mod(FlowModCommand::Add, 2), pending(11, UserState::Add))
            .unwrap();
        let done = pusher.barrier(Dpid(3)).unwrap();

        eventually(|| !switch.barriers().is_empty()).await;
        let xid = switch.barriers()[0];
        pusher.barrier_reply(Dpid(3), xid);
        done.await.unwrap();

        match rx.recv().await.unwrap() {
            PushNotice::Acked { dpid, entries, .. } => {
                assert_eq!(dpid, Dpid(3));
                assert_eq!(entries, vec![pending(10, UserState::Add), pending(11, UserState::Add)]);
            }
            other => panic!("unexpected notice {:?}", other),
        }
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_budget_spills_back() {
        let (pusher, _rx) = pusher(false);
        pusher.add_switch(TestSwitch::new(5, 0));
        pusher.delete_queue(Dpid(5), false);
        assert!(pusher.add(Dpid(5), OfMessage::BarrierRequest { xid: 1 }, PushPriority::High).is_err());

        let (pusher, _rx) = FlowPusher::new(config(), None, Arc::new(EventBus::new(4)));
        pusher.add_switch(TestSwitch::new(5, 0));
        let big = flow_mod(FlowModCommand::Add, 1);
        let mut accepted = 0;
        let err = loop {
            match pusher.add(Dpid(5), OfMessage::FlowMod(big.clone()), PushPriority::Normal) {
                Ok(()) => accepted += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::Transient);
        assert_eq!(accepted, 1_000 / big.wire_len());
    }

    #[tokio::test]
    async fn test_unknown_switch_rejected() {
        let (pusher, _rx) = pusher(false);
        let err = pusher
            .add(Dpid(77), OfMessage::BarrierRequest { xid: 1 }, PushPriority::Normal)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_forced_delete_cancels_pending() {
        let (pusher, mut rx) = FlowPusher::new(config(), None, Arc::new(EventBus::new(4)));
        pusher.add_switch(TestSwitch::new(2, 0));
        pusher
            .push_flow_entry(Dpid(2), flow_mod(FlowModCommand::Add, 1), pending(1, UserState::Add))
            .unwrap();
        assert_eq!(pusher.delete_queue(Dpid(2), true), 1);
        assert!(!pusher.is_registered(Dpid(2)));
        assert_eq!(
            rx.recv().await.unwrap(),
            PushNotice::Cancelled {
                dpid: Dpid(2),
                entries: vec![pending(1, UserState::Add)]
            }
        );
    }

    #[tokio::test]
    async fn test_retry_once_after_failure() {
        let (pusher, _rx) = pusher(false);
        let switch = TestSwitch::new(4, 1);
        pusher.add_switch(switch.clone());
        pusher
            .push_flow_entry(Dpid(4), flow_mod(FlowModCommand::Add, 1), pending(1, UserState::Add))
            .unwrap();
        eventually(|| switch.flow_mods().len() == 1).await;
        assert_eq!(switch.barriers().len(), 1);
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_persistent_failure_drops_queue() {
        let (pusher, mut rx) = pusher(false);
        let switch = TestSwitch::new(6, 2);
        pusher.add_switch(switch.clone());
        pusher
            .push_flow_entry(Dpid(6), flow_mod(FlowModCommand::Add, 1), pending(1, UserState::Add))
            .unwrap();
        match rx.recv().await.unwrap() {
            PushNotice::Failed { entries, .. } => assert_eq!(entries, vec![pending(1, UserState::Add)]),
            other => panic!("unexpected notice {:?}", other),
        }
        assert!(switch.flow_mods().is_empty());
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_damped_duplicate_still_acknowledged() {
        let (pusher, mut rx) = pusher(true);
        let switch = TestSwitch::new(8, 0);
        pusher.add_switch(switch.clone());
        let add = flow_mod(FlowModCommand::Add, 1);
        pusher.push_flow_entry(Dpid(8), add.clone(), pending(1, UserState::Add)).unwrap();
        pusher.push_flow_entry(Dpid(8), add, pending(2, UserState::Add)).unwrap();
        pusher.barrier(Dpid(8)).unwrap();

        eventually(|| !switch.barriers().is_empty()).await;
        assert_eq!(switch.flow_mods().len(), 1);
        pusher.barrier_reply(Dpid(8), switch.barriers()[0]);
        match rx.recv().await.unwrap() {
            PushNotice::Acked { entries, .. } => assert_eq!(entries.len(), 2),
            other => panic!("unexpected notice {:?}", other),
        }
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_replaces_closing_queue() {
        let (pusher, mut rx) = pusher(false);
        let old = TestSwitch::new(9, 0);
        pusher.add_switch(old.clone());
        pusher
            .push_flow_entry(Dpid(9), flow_mod(FlowModCommand::Add, 1), pending(1, UserState::Add))
            .unwrap();
        let _unanswered = pusher.barrier(Dpid(9)).unwrap();
        eventually(|| !old.barriers().is_empty()).await;

        pusher.delete_queue(Dpid(9), false);
        assert!(pusher
            .push_flow_entry(Dpid(9), flow_mod(FlowModCommand::Add, 2), pending(2, UserState::Add))
            .is_err());

        let fresh = TestSwitch::new(9, 0);
        pusher.add_switch(fresh.clone());
        assert_eq!(
            rx.recv().await.unwrap(),
            PushNotice::Cancelled {
                dpid: Dpid(9),
                entries: vec![pending(1, UserState::Add)]
            }
        );
        pusher
            .push_flow_entry(Dpid(9), flow_mod(FlowModCommand::Add, 3), pending(3, UserState::Add))
            .unwrap();
        eventually(|| fresh.flow_mods().len() == 1).await;
        assert!(pusher.is_registered(Dpid(9)));
        assert_eq!(old.flow_mods().len(), 1);
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unanswered_barrier_closes_at_deadline() {
        let config = PusherConfig {
            drain_timeout: Duration::from_millis(50),
            ..config()
        };
        let (pusher, mut rx) = FlowPusher::new(config, None, Arc::new(EventBus::new(4)));
        let pusher = Arc::new(pusher);
        pusher.start();
        let switch = TestSwitch::new(10, 0);
        pusher.add_switch(switch.clone());
        pusher
            .push_flow_entry(Dpid(10), flow_mod(FlowModCommand::Add, 1), pending(1, UserState::Add))
            .unwrap();
        let _unanswered = pusher.barrier(Dpid(10)).unwrap();
        eventually(|| !switch.barriers().is_empty()).await;

        pusher.delete_queue(Dpid(10), false);
        eventually(|| !pusher.is_registered(Dpid(10))).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            PushNotice::Cancelled {
                dpid: Dpid(10),
                entries: vec![pending(1, UserState::Add)]
            }
        );
        pusher.shutdown().await;
    }

    #[test]
    fn test_cut_follows_write_order() {
        let queued = |port: u32, id: u64| QueuedMessage {
            msg: OfMessage::FlowMod(flow_mod(FlowModCommand::Add, port)),
            entry: Some(pending(id, UserState::Add)),
        };
        let mut queue = SwitchQueue::new(1_000_000);
        queue.high.push_back(queued(1, 1));
        queue.high.push_back(QueuedMessage {
            msg: OfMessage::BarrierRequest { xid: 7 },
            entry: None,
        });
        queue.high.push_back(queued(2, 2));
        queue.normal.push_back(queued(3, 3));

        let cut: Vec<FlowEntryId> = queue
            .cut_after_next_barrier()
            .iter()
            .filter_map(|m| m.entry.map(|e| e.flow_entry_id))
            .collect();
        assert_eq!(cut, vec![FlowEntryId(2), FlowEntryId(3)]);
        assert_eq!(queue.high.len(), 2);
        assert!(queue.normal.is_empty());

        let mut bare = SwitchQueue::new(1_000_000);
        bare.high.push_back(queued(1, 1));
        bare.normal.push_back(queued(2, 2));
        assert_eq!(bare.cut_after_next_barrier().len(), 2);
        assert_eq!(bare.len(), 0);
    }
}
