//! Resolution of intent operations into path intents

use tracing::{debug, warn};

use super::bfs::constrained_bfs;
use super::{Intent, IntentOperationList, IntentOperator, PathIntent};
use crate::error::FlowgridError;
use crate::topology::TopologySnapshot;
use crate::types::IntentId;

/// Outcome of resolving one batch
#[derive(Debug, Default)]
pub struct PathCalcOutput {
    /// Resolved operations in submission order
    pub path_intents: Vec<(IntentOperator, PathIntent)>,
    /// Intents that could not be satisfied, with the reason
    pub pushed_back: Vec<(IntentId, FlowgridError)>,
}

/// Resolve every operation against `snapshot`
///
/// ADD intents accepted earlier in the batch reserve bandwidth for the ones
/// after them. A REMOVE resolves to the path intent registered for the same
/// id, whether it was installed earlier or added earlier in this batch.
pub fn calc_path_intents(snapshot: &TopologySnapshot, ops: &IntentOperationList) -> PathCalcOutput {
    let mut working = snapshot.path_intents().clone();
    let mut output = PathCalcOutput::default();

    for op in ops.iter() {
        let id = op.intent.id();
        match op.operator {
            IntentOperator::Add => match resolve(snapshot, &working, &op.intent) {
                Ok(path_intent) => {
                    debug!("Intent {} resolved over {} links", id, path_intent.path.len());
                    working.add_intent(path_intent.clone());
                    output.path_intents.push((IntentOperator::Add, path_intent));
                }
                Err(e) => {
                    warn!("Pushing back intent {}: {}", id, e);
                    output.pushed_back.push((id, e));
                }
            },
            IntentOperator::Remove => match working.remove_intent(id) {
                Some(path_intent) => output.path_intents.push((IntentOperator::Remove, path_intent)),
                None => {
                    warn!("Remove of unknown intent {}", id);
                    output
                        .pushed_back
                        .push((id, FlowgridError::not_found(format!("intent {}", id))));
                }
            },
        }
    }
    output
}

fn resolve(
    snapshot: &TopologySnapshot,
    working: &crate::topology::PathIntentMap,
    intent: &Intent,
) -> Result<PathIntent, FlowgridError> {
    let id = intent.id();

    if let Intent::Path(explicit) = intent {
        if let Some(missing) = explicit.path.iter().find(|t| snapshot.get_link(t).is_none()) {
            return Err(FlowgridError::path_unsatisfiable(id, format!("link {} is not in the topology", missing)));
        }
        return Ok(explicit.clone());
    }

    let endpoints = intent
        .endpoints()
        .ok_or_else(|| FlowgridError::path_unsatisfiable(id, "intent has no endpoints"))?;
    for dpid in [endpoints.src_switch, endpoints.dst_switch] {
        if snapshot.get_switch(dpid).is_none() {
            return Err(FlowgridError::path_unsatisfiable(id, format!("switch {} is not in the topology", dpid)));
        }
    }

    let required = intent.required_bandwidth();
    let path = constrained_bfs(snapshot, working, endpoints.src_switch, endpoints.dst_switch, required)
        .ok_or_else(|| {
            FlowgridError::path_unsatisfiable(
                id,
                format!(
                    "no path from {} to {} with {} available",
                    endpoints.src_switch, endpoints.dst_switch, required
                ),
            )
        })?;

    PathIntent::new(id, intent.clone(), path, required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::intent::test_support::{constrained, sp_intent};
    use crate::topology::{Link, Port, Switch, Topology};
    use crate::types::SwitchPort;

    fn line(capacity: f64) -> Topology {
        let topo = Topology::new();
        for d in 1..=3u64 {
            topo.put_switch(Switch::new(d), (1..=3u32).map(|p| Port::new(d, p)).collect());
        }
        for (a, ap, b, bp) in [(1, 2, 2, 2), (2, 3, 3, 2)] {
            let fwd = Link::new(SwitchPort::new(a, ap), SwitchPort::new(b, bp)).with_capacity(capacity);
            let rev = Link::new(SwitchPort::new(b, bp), SwitchPort::new(a, ap)).with_capacity(capacity);
            topo.put_link(fwd);
            topo.put_link(rev);
        }
        topo
    }

    #[test]
    fn test_missing_switch_is_pushed_back() {
        let snap = line(100.0).snapshot();
        let ops = IntentOperationList::new().add(sp_intent(1, 1, 9));
        let out = calc_path_intents(&snap, &ops);
        assert!(out.path_intents.is_empty());
        assert_eq!(out.pushed_back[0].1.kind(), ErrorKind::PathUnsatisfiable);
    }

    #[test]
    fn test_batch_reserves_bandwidth() {
        let snap = line(100.0).snapshot();
        let ops = IntentOperationList::new()
            .add(constrained(1, 1, 3, 60.0))
            .add(constrained(2, 1, 3, 60.0))
            .add(constrained(3, 1, 3, 30.0));
        let out = calc_path_intents(&snap, &ops);
        let accepted: Vec<IntentId> = out.path_intents.iter().map(|(_, p)| p.id).collect();
        assert_eq!(accepted, vec![IntentId(1), IntentId(3)]);
        assert_eq!(out.pushed_back.len(), 1);
        assert_eq!(out.pushed_back[0].0, IntentId(2));
    }

    #[test]
    fn test_remove_within_batch() {
        let snap = line(f64::INFINITY).snapshot();
        let ops = IntentOperationList::new()
            .add(sp_intent(1, 1, 3))
            .remove(sp_intent(1, 1, 3))
            .remove(sp_intent(7, 1, 3));
        let out = calc_path_intents(&snap, &ops);
        assert_eq!(out.path_intents.len(), 2);
        assert_eq!(out.path_intents[1].0, IntentOperator::Remove);
        assert_eq!(out.pushed_back[0].1.kind(), ErrorKind::NotFound);
    }
}
