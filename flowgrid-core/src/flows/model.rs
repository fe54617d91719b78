//! Flow paths and flow entries as seen by callers

use serde::{Deserialize, Serialize};

use crate::openflow::{Action, FlowMod, FlowModCommand, Match};
use crate::types::{Dpid, FlowEntryId, FlowId, IntentId, SwitchPort};

/// What the controller wants the switch to do with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserState {
    Add,
    Modify,
    Delete,
}

impl UserState {
    /// Command that realises this state on the switch
    pub fn command(&self) -> FlowModCommand {
        match self {
            UserState::Add => FlowModCommand::Add,
            UserState::Modify => FlowModCommand::ModifyStrict,
            UserState::Delete => FlowModCommand::DeleteStrict,
        }
    }
}

/// Whether the switch has acknowledged the entry's user state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchState {
    NotUpdated,
    Updated,
}

/// Error reported by the switch or the pusher for an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntryError {
    pub error_type: u16,
    pub error_code: u16,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowPathState {
    /// Some entries are not yet acknowledged
    Installing,
    Installed,
    /// Entries are being removed from the switches
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    /// Allocated on `add_flow` when absent
    #[serde(default)]
    pub flow_entry_id: Option<FlowEntryId>,
    #[serde(default)]
    pub flow_id: Option<FlowId>,
    pub dpid: Dpid,
    pub flow_match: Match,
    pub actions: Vec<Action>,
    pub priority: u16,
    pub user_state: UserState,
    pub switch_state: SwitchState,
    #[serde(default)]
    pub error_state: Option<FlowEntryError>,
}

impl FlowEntry {
    pub fn new(dpid: impl Into<Dpid>, flow_match: Match, actions: Vec<Action>) -> Self {
        Self {
            flow_entry_id: None,
            flow_id: None,
            dpid: dpid.into(),
            flow_match,
            actions,
            priority: crate::config::DEFAULT_FLOW_PRIORITY,
            user_state: UserState::Add,
            switch_state: SwitchState::NotUpdated,
            error_state: None,
        }
    }

    /// Flow-mod for the entry's current user state, cookie set to the entry id
    pub fn to_flow_mod(&self) -> FlowMod {
        let cookie = self.flow_entry_id.map(|id| id.value()).unwrap_or_default();
        FlowMod::new(self.user_state.command(), self.flow_match.clone(), self.actions.clone())
            .with_cookie(cookie)
            .with_priority(self.priority)
    }
}

/// A named end-to-end flow made of per-switch entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowPath {
    #[serde(default)]
    pub flow_id: Option<FlowId>,
    pub installer_id: String,
    pub src: SwitchPort,
    pub dst: SwitchPort,
    #[serde(default)]
    pub match_filter: Match,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default = "installing")]
    pub state: FlowPathState,
    #[serde(default)]
    pub intent_id: Option<IntentId>,
    pub entries: Vec<FlowEntry>,
}

fn installing() -> FlowPathState {
    FlowPathState::Installing
}

impl FlowPath {
    pub fn new(installer_id: impl Into<String>, src: SwitchPort, dst: SwitchPort) -> Self {
        Self {
            flow_id: None,
            installer_id: installer_id.into(),
            src,
            dst,
            match_filter: Match::match_all(),
            actions: Vec::new(),
            state: FlowPathState::Installing,
            intent_id: None,
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, entry: FlowEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

/// Flow path without match, actions or entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowPathSummary {
    pub flow_id: FlowId,
    pub installer_id: String,
    pub src: SwitchPort,
    pub dst: SwitchPort,
    pub state: FlowPathState,
    pub entry_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortNumber;

    #[test]
    fn test_user_state_commands() {
        assert_eq!(UserState::Add.command(), FlowModCommand::Add);
        assert_eq!(UserState::Modify.command(), FlowModCommand::ModifyStrict);
        assert_eq!(UserState::Delete.command(), FlowModCommand::DeleteStrict);
    }

    #[test]
    fn test_delete_flow_mod_echoes_out_port() {
        let mut entry = FlowEntry::new(1u64, Match::match_all(), vec![Action::output(PortNumber(3))]);
        entry.flow_entry_id = Some(FlowEntryId(0x42));
        entry.user_state = UserState::Delete;
        let fm = entry.to_flow_mod();
        assert_eq!(fm.cookie, 0x42);
        assert_eq!(fm.out_port, Some(PortNumber(3)));
        assert_eq!(fm.priority, 100);
    }

    #[test]
    fn test_flow_path_json_defaults() {
        let json = r#"{
            "installer_id": "app",
            "src": {"dpid": 1, "port": 1},
            "dst": {"dpid": 2, "port": 1},
            "entries": []
        }"#;
        let path: FlowPath = serde_json::from_str(json).unwrap();
        assert_eq!(path.state, FlowPathState::Installing);
        assert!(path.flow_id.is_none());
    }
}
