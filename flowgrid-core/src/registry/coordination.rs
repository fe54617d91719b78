//! Coordination service seam
//!
//! The registry needs four primitives from its coordination service: a
//! leader latch per path, a service cache with JSON payloads, enumeration of
//! the latch paths under a prefix, and an atomic counter. [`InProcessCoordinator`]
//! provides all of them for a set of controller instances sharing one process,
//! which is what the tests and the single-node binary use.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::{FlowgridError, FlowgridResult};

/// Member of a discovery service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub payload: serde_json::Value,
}

/// Change in a service's membership
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipChange {
    Joined { service: String, instance: ServiceInstance },
    Left { service: String, id: String },
}

/// Result of an atomic add
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    pub pre_value: u64,
    pub post_value: u64,
}

/// Primitives the registry needs from a coordination service
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Join the leader latch at `path`. The receiver yields `true` when the
    /// participant becomes leader and `false` when it loses leadership.
    async fn join_election(&self, path: &str, participant: &str)
        -> FlowgridResult<mpsc::UnboundedReceiver<bool>>;

    async fn leave_election(&self, path: &str, participant: &str) -> FlowgridResult<()>;

    async fn leader(&self, path: &str) -> FlowgridResult<Option<String>>;

    /// Contenders in latch order; the first one leads
    async fn participants(&self, path: &str) -> FlowgridResult<Vec<String>>;

    /// Latch paths that currently have contenders, under `prefix`
    async fn election_paths(&self, prefix: &str) -> FlowgridResult<Vec<String>>;

    async fn register_service(&self, service: &str, instance: ServiceInstance) -> FlowgridResult<()>;

    async fn unregister_service(&self, service: &str, id: &str) -> FlowgridResult<()>;

    async fn service_instances(&self, service: &str) -> FlowgridResult<Vec<ServiceInstance>>;

    fn watch_membership(&self) -> broadcast::Receiver<MembershipChange>;

    async fn add_and_get(&self, counter: &str, delta: u64) -> FlowgridResult<CounterValue>;
}

struct Contender {
    id: String,
    notify: mpsc::UnboundedSender<bool>,
}

#[derive(Default)]
struct CoordinatorState {
    elections: BTreeMap<String, VecDeque<Contender>>,
    services: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    counters: HashMap<String, u64>,
    expired: HashSet<String>,
    /// Latch places of expired sessions, rejoined on restore
    suspended: HashMap<String, Vec<(String, Contender)>>,
}

/// Coordination service shared by instances living in one process
pub struct InProcessCoordinator {
    state: Mutex<CoordinatorState>,
    membership_tx: broadcast::Sender<MembershipChange>,
}

impl InProcessCoordinator {
    pub fn new() -> Self {
        let (membership_tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(CoordinatorState::default()),
            membership_tx,
        }
    }

    fn check_session(state: &CoordinatorState, participant: &str) -> FlowgridResult<()> {
        if state.expired.contains(participant) {
            return Err(FlowgridError::transient(
                "coordination",
                format!("session of {} is expired", participant),
            ));
        }
        Ok(())
    }

    /// Drop `participant` from `path`, promoting the next contender if it led
    fn remove_contender(
        state: &mut CoordinatorState,
        path: &str,
        participant: &str,
        notify_loser: bool,
    ) -> Option<Contender> {
        let queue = state.elections.get_mut(path)?;
        let pos = queue.iter().position(|c| c.id == participant)?;

        let removed = queue.remove(pos);
        if let Some(removed) = &removed {
            if pos == 0 && notify_loser {
                let _ = removed.notify.send(false);
            }
        }
        if pos == 0 {
            if let Some(next) = queue.front() {
                debug!("Leadership of {} passes to {}", path, next.id);
                let _ = next.notify.send(true);
            }
        }
        if queue.is_empty() {
            state.elections.remove(path);
        }
        removed
    }

    /// Simulate loss of `participant`'s session: it loses every latch it
    /// holds (and is told so), and its ephemeral service entries vanish.
    /// Its latch places are kept aside and rejoined by [`restore_session`].
    ///
    /// [`restore_session`]: InProcessCoordinator::restore_session
    pub fn expire_session(&self, participant: &str) {
        let mut left = Vec::new();
        {
            let mut state = self.state.lock();
            warn!("Coordination session of {} expired", participant);
            state.expired.insert(participant.to_string());

            let paths: Vec<String> = state.elections.keys().cloned().collect();
            let mut suspended = Vec::new();
            for path in paths {
                if let Some(contender) = Self::remove_contender(&mut state, &path, participant, true) {
                    suspended.push((path, contender));
                }
            }
            state
                .suspended
                .entry(participant.to_string())
                .or_default()
                .extend(suspended);

            for (service, members) in state.services.iter_mut() {
                if members.remove(participant).is_some() {
                    left.push(MembershipChange::Left {
                        service: service.clone(),
                        id: participant.to_string(),
                    });
                }
            }
        }
        for change in left {
            let _ = self.membership_tx.send(change);
        }
    }

    /// End the expiry of `participant` and put it back in every election it
    /// was in, behind the contenders that joined meanwhile
    pub fn restore_session(&self, participant: &str) {
        let mut state = self.state.lock();
        state.expired.remove(participant);
        let suspended = state.suspended.remove(participant).unwrap_or_default();
        let mut rejoined = 0;
        for (path, contender) in suspended {
            // The watcher on the other end is gone
            if contender.notify.is_closed() {
                continue;
            }
            let queue = state.elections.entry(path).or_default();
            if queue.is_empty() {
                let _ = contender.notify.send(true);
            }
            queue.push_back(contender);
            rejoined += 1;
        }
        info!(
            "Coordination session of {} restored, rejoined {} elections",
            participant, rejoined
        );
    }
}

impl Default for InProcessCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationService for InProcessCoordinator {
    async fn join_election(
        &self,
        path: &str,
        participant: &str,
    ) -> FlowgridResult<mpsc::UnboundedReceiver<bool>> {
        let mut state = self.state.lock();
        Self::check_session(&state, participant)?;

        let queue = state.elections.entry(path.to_string()).or_default();
        if queue.iter().any(|c| c.id == participant) {
            return Err(FlowgridError::already_exists(format!(
                "{} in election {}",
                participant, path
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if queue.is_empty() {
            let _ = tx.send(true);
        }
        queue.push_back(Contender {
            id: participant.to_string(),
            notify: tx,
        });
        Ok(rx)
    }

    async fn leave_election(&self, path: &str, participant: &str) -> FlowgridResult<()> {
        let mut state = self.state.lock();
        Self::remove_contender(&mut state, path, participant, false);
        if let Some(places) = state.suspended.get_mut(participant) {
            places.retain(|(p, _)| p != path);
        }
        Ok(())
    }

    async fn leader(&self, path: &str) -> FlowgridResult<Option<String>> {
        let state = self.state.lock();
        Ok(state
            .elections
            .get(path)
            .and_then(|q| q.front())
            .map(|c| c.id.clone()))
    }

    async fn participants(&self, path: &str) -> FlowgridResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .elections
            .get(path)
            .map(|q| q.iter().map(|c| c.id.clone()).collect())
            .unwrap_or_default())
    }

    async fn election_paths(&self, prefix: &str) -> FlowgridResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .elections
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn register_service(&self, service: &str, instance: ServiceInstance) -> FlowgridResult<()> {
        {
            let mut state = self.state.lock();
            Self::check_session(&state, &instance.id)?;
            state
                .services
                .entry(service.to_string())
                .or_default()
                .insert(instance.id.clone(), instance.payload.clone());
        }
        let _ = self.membership_tx.send(MembershipChange::Joined {
            service: service.to_string(),
            instance,
        });
        Ok(())
    }

    async fn unregister_service(&self, service: &str, id: &str) -> FlowgridResult<()> {
        let removed = {
            let mut state = self.state.lock();
            state
                .services
                .get_mut(service)
                .map(|members| members.remove(id).is_some())
                .unwrap_or(false)
        };
        if removed {
            let _ = self.membership_tx.send(MembershipChange::Left {
                service: service.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn service_instances(&self, service: &str) -> FlowgridResult<Vec<ServiceInstance>> {
        let state = self.state.lock();
        Ok(state
            .services
            .get(service)
            .map(|members| {
                members
                    .iter()
                    .map(|(id, payload)| ServiceInstance {
                        id: id.clone(),
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn watch_membership(&self) -> broadcast::Receiver<MembershipChange> {
        self.membership_tx.subscribe()
    }

    async fn add_and_get(&self, counter: &str, delta: u64) -> FlowgridResult<CounterValue> {
        let mut state = self.state.lock();
        let value = state.counters.entry(counter.to_string()).or_insert(0);
        let pre_value = *value;
        let post_value = pre_value.checked_add(delta).ok_or_else(|| {
            FlowgridError::internal(format!("counter {} overflowed", counter))
        })?;
        *value = post_value;
        Ok(CounterValue {
            pre_value,
            post_value,
        })
    }
}
