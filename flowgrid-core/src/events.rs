//! Local fan-out of controller events
//!
//! Every listener owns a bounded queue. Publishing never blocks: when a
//! queue is full its oldest event is dropped and counted. Listeners must be
//! subscribed before [`EventBus::start`]; each one is typically drained by a
//! dedicated task via [`EventBus::spawn_listener`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{FlowgridError, FlowgridResult};
use crate::topology::TopologyEvent;
use crate::types::{Dpid, FlowEntryId, FlowId};

/// Flow manager and pusher notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    FlowAdded(FlowId),
    FlowRemoved(FlowId),
    FlowEntryUpdated {
        flow_entry_id: FlowEntryId,
        dpid: Dpid,
    },
    FlowEntryFailed {
        flow_entry_id: Option<FlowEntryId>,
        dpid: Dpid,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Topology(TopologyEvent),
    Flow(FlowEvent),
}

impl From<TopologyEvent> for ControllerEvent {
    fn from(event: TopologyEvent) -> Self {
        ControllerEvent::Topology(event)
    }
}

impl From<FlowEvent> for ControllerEvent {
    fn from(event: FlowEvent) -> Self {
        ControllerEvent::Flow(event)
    }
}

struct ListenerQueue<E> {
    name: String,
    capacity: usize,
    queue: Mutex<VecDeque<E>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<E> ListenerQueue<E> {
    fn push(&self, event: E) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("Listener {} is behind, {} events dropped", self.name, dropped);
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Receiving end of one listener
pub struct Subscription<E> {
    inner: Arc<ListenerQueue<E>>,
}

impl<E> Subscription<E> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Next event; `None` once the bus is closed and the queue is drained
    pub async fn recv(&self) -> Option<E> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<E> {
        self.inner.queue.lock().pop_front()
    }

    /// Events discarded because this listener fell behind
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

pub struct EventBus<E> {
    listeners: Mutex<Vec<Arc<ListenerQueue<E>>>>,
    started: AtomicBool,
    capacity: usize,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, name: impl Into<String>) -> FlowgridResult<Subscription<E>> {
        let name = name.into();
        if self.started.load(Ordering::SeqCst) {
            return Err(FlowgridError::InvalidOperation {
                operation: "subscribe".to_string(),
                reason: format!("listener {} registered after start", name),
            });
        }
        let inner = Arc::new(ListenerQueue {
            name,
            capacity: self.capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.listeners.lock().push(inner.clone());
        Ok(Subscription { inner })
    }

    /// Subscribe and drain the queue on a dedicated task
    pub fn spawn_listener<F>(&self, name: impl Into<String>, mut handler: F) -> FlowgridResult<JoinHandle<()>>
    where
        F: FnMut(E) + Send + 'static,
    {
        let subscription = self.subscribe(name)?;
        Ok(tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event);
            }
            debug!("Listener {} finished", subscription.name());
        }))
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn publish(&self, event: impl Into<E>) {
        let event = event.into();
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener.push(event.clone());
        }
    }

    pub fn publish_all<I>(&self, events: I)
    where
        I: IntoIterator,
        I::Item: Into<E>,
    {
        for event in events {
            self.publish(event);
        }
    }

    /// Wake every listener; they finish once their queues are drained
    pub fn close(&self) {
        for listener in self.listeners.lock().iter() {
            listener.closed.store(true, Ordering::SeqCst);
            listener.notify.notify_one();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}
