//! Suppression of repeated flow-mods

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::DamperConfig;
use crate::error::{FlowgridError, FlowgridResult};
use crate::openflow::{Action, FlowMod, FlowModCommand, Match};
use crate::types::Dpid;

const COMMANDS: [FlowModCommand; 5] = [
    FlowModCommand::Add,
    FlowModCommand::Modify,
    FlowModCommand::ModifyStrict,
    FlowModCommand::Delete,
    FlowModCommand::DeleteStrict,
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DamperKey {
    dpid: Dpid,
    flow_match: Match,
    command: FlowModCommand,
    actions: Vec<Action>,
}

/// LRU of recently written flow-mods with a time-to-live
///
/// A flow-mod whose (switch, match, command, actions) was written less than
/// one window ago is suppressed. The cache never holds more than `capacity`
/// keys; the least recently written one is evicted first.
pub struct MessageDamper {
    cache: Mutex<LruCache<DamperKey, Instant>>,
    window: Duration,
}

impl MessageDamper {
    pub fn new(capacity: usize, window: Duration) -> FlowgridResult<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| FlowgridError::configuration("damper.capacity", "capacity must be positive"))?;
        Ok(Self {
            cache: Mutex::new(LruCache::new(capacity)),
            window,
        })
    }

    /// `None` when damping is disabled
    pub fn from_config(config: &DamperConfig) -> FlowgridResult<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(config.capacity, config.window).map(Some)
    }

    /// Record `flow_mod` and report whether it repeats one still in its window
    pub fn should_suppress(&self, dpid: Dpid, flow_mod: &FlowMod) -> bool {
        let key = DamperKey {
            dpid,
            flow_match: flow_mod.flow_match.clone(),
            command: flow_mod.command,
            actions: flow_mod.actions.clone(),
        };
        let now = Instant::now();
        let mut cache = self.cache.lock();
        if let Some(seen) = cache.get(&key) {
            if now.duration_since(*seen) < self.window {
                return true;
            }
        }
        // A different command on the same rule resets its siblings, so a
        // re-add after a delete is written again.
        for command in COMMANDS {
            if command != key.command {
                cache.pop(&DamperKey { command, ..key.clone() });
            }
        }
        cache.put(key, now);
        false
    }

    /// Forget everything recorded for `dpid`
    pub fn forget_switch(&self, dpid: Dpid) {
        let mut cache = self.cache.lock();
        let keys: Vec<DamperKey> = cache
            .iter()
            .filter(|(k, _)| k.dpid == dpid)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            cache.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortNumber;

    fn flow_mod(command: FlowModCommand, port: u32) -> FlowMod {
        FlowMod::new(command, Match::match_all(), vec![Action::output(PortNumber(port))])
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_within_window_suppressed() {
        let damper = MessageDamper::new(16, Duration::from_millis(250)).unwrap();
        let add = flow_mod(FlowModCommand::Add, 1);
        assert!(!damper.should_suppress(Dpid(1), &add));
        assert!(damper.should_suppress(Dpid(1), &add));
        // Different switch, command or actions are distinct
        assert!(!damper.should_suppress(Dpid(2), &add));
        assert!(!damper.should_suppress(Dpid(1), &flow_mod(FlowModCommand::DeleteStrict, 1)));
        assert!(!damper.should_suppress(Dpid(1), &flow_mod(FlowModCommand::Add, 2)));

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(!damper.should_suppress(Dpid(1), &add));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let damper = MessageDamper::new(4, Duration::from_secs(60)).unwrap();
        for port in 0..10 {
            damper.should_suppress(Dpid(1), &flow_mod(FlowModCommand::Add, port));
        }
        assert_eq!(damper.len(), 4);
        assert!(MessageDamper::new(0, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_delete_resets_add() {
        let damper = MessageDamper::new(8, Duration::from_secs(60)).unwrap();
        let add = flow_mod(FlowModCommand::Add, 1);
        assert!(!damper.should_suppress(Dpid(1), &add));
        assert!(damper.should_suppress(Dpid(1), &add));
        assert!(!damper.should_suppress(Dpid(1), &flow_mod(FlowModCommand::DeleteStrict, 1)));
        assert!(!damper.should_suppress(Dpid(1), &add));
    }

    #[test]
    fn test_forget_switch() {
        let damper = MessageDamper::new(8, Duration::from_secs(60)).unwrap();
        damper.should_suppress(Dpid(1), &flow_mod(FlowModCommand::Add, 1));
        damper.should_suppress(Dpid(2), &flow_mod(FlowModCommand::Add, 1));
        damper.forget_switch(Dpid(1));
        assert_eq!(damper.len(), 1);
    }
}
