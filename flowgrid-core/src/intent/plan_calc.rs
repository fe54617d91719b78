//! Install plan assembly

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{IntentOperator, PathIntent};
use crate::openflow::{Action, Match};
use crate::types::{Dpid, IntentId};

/// One switch-level change in a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFlowEntry {
    pub dpid: Dpid,
    pub flow_match: Match,
    pub actions: Vec<Action>,
    pub operator: IntentOperator,
    /// First intent in the batch that contributed the entry with `operator`
    pub intent_id: IntentId,
    /// Other intents of the batch that contributed the same entry
    #[serde(default)]
    pub shared_with: Vec<IntentId>,
}

/// Ordered install phases; every entry of a phase may be pushed in parallel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub phases: Vec<Vec<PlanFlowEntry>>,
}

impl Plan {
    pub fn entries(&self) -> impl Iterator<Item = &PlanFlowEntry> {
        self.phases.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries owned by `intent_id` with the given operator
    pub fn entries_for(&self, intent_id: IntentId, operator: IntentOperator) -> Vec<&PlanFlowEntry> {
        self.entries()
            .filter(|e| e.intent_id == intent_id && e.operator == operator)
            .collect()
    }

    /// Entries `intent_id` contributed with `operator` but another intent owns
    pub fn shared_entries_for(&self, intent_id: IntentId, operator: IntentOperator) -> Vec<&PlanFlowEntry> {
        self.entries()
            .filter(|e| e.operator == operator && e.shared_with.contains(&intent_id))
            .collect()
    }
}

type EntryKey = (Dpid, Match, Vec<Action>);

/// Per-switch entries realising `intent`, last hop first
///
/// Each switch on the path matches on the port the traffic arrived on and
/// the two host MACs, and outputs towards the next hop; the destination
/// switch outputs on the destination port.
pub fn compile_entries(intent: &PathIntent) -> Vec<EntryKey> {
    let Some(endpoints) = intent.endpoints() else {
        return Vec::new();
    };

    let entry = |dpid: Dpid, in_port, out_port| {
        let flow_match = Match {
            in_port: Some(in_port),
            dl_src: Some(endpoints.src_mac),
            dl_dst: Some(endpoints.dst_mac),
            ..Match::default()
        };
        (dpid, flow_match, vec![Action::output(out_port)])
    };

    let mut entries = Vec::with_capacity(intent.path.len() + 1);
    let mut in_port = endpoints.src_port;
    for link in &intent.path {
        entries.push(entry(link.src.dpid, in_port, link.src.port));
        in_port = link.dst.port;
    }
    entries.push(entry(endpoints.dst_switch, in_port, endpoints.dst_port));
    entries.reverse();
    entries
}

/// Fold the resolved operations into a single-phase plan
///
/// Every entry counts +1 per ADD and -1 per REMOVE contribution. Entries end
/// up ADD when positive, REMOVE when negative and are dropped at zero. Order
/// is that of first appearance, so the same input always yields the same
/// plan.
///
/// An entry several intents compile to appears once. It is owned by the
/// first intent that contributed it with the final operator, and lists the
/// others in `shared_with`.
pub fn calc_plan(path_intents: &[(IntentOperator, PathIntent)]) -> Plan {
    let mut order: Vec<(EntryKey, i64, Vec<(IntentOperator, IntentId)>)> = Vec::new();
    let mut index: HashMap<EntryKey, usize> = HashMap::new();

    for (operator, intent) in path_intents {
        let delta = match operator {
            IntentOperator::Add => 1,
            IntentOperator::Remove => -1,
        };
        for key in compile_entries(intent) {
            let i = *index.entry(key.clone()).or_insert_with(|| {
                order.push((key, 0, Vec::new()));
                order.len() - 1
            });
            order[i].1 += delta;
            if !order[i].2.contains(&(*operator, intent.id)) {
                order[i].2.push((*operator, intent.id));
            }
        }
    }

    let phase: Vec<PlanFlowEntry> = order
        .into_iter()
        .filter_map(|((dpid, flow_match, actions), count, contributors)| {
            let operator = match count {
                c if c > 0 => IntentOperator::Add,
                c if c < 0 => IntentOperator::Remove,
                _ => return None,
            };
            let mut ids = contributors
                .into_iter()
                .filter(|(op, _)| *op == operator)
                .map(|(_, id)| id);
            let intent_id = ids.next()?;
            Some(PlanFlowEntry {
                dpid,
                flow_match,
                actions,
                operator,
                intent_id,
                shared_with: ids.collect(),
            })
        })
        .collect();

    let phases = if phase.is_empty() { Vec::new() } else { vec![phase] };
    Plan { phases }
}
