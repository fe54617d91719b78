//! Constrained breadth-first search

use std::collections::{HashMap, HashSet, VecDeque};

use crate::topology::{Link, PathIntentMap, TopologySnapshot};
use crate::types::{Dpid, LinkTuple, Status};

fn has_room(link: &Link, reservations: &PathIntentMap, required: f64) -> bool {
    if !(required.is_finite() && required > 0.0) {
        return true;
    }
    reservations.get_available_bandwidth(link) >= required
}

/// Hop-minimising path from `src` to `dst` over ACTIVE links with at least
/// `required` bandwidth available
///
/// Neighbours are visited in (dst dpid, dst port) order, so equal-length
/// paths resolve the same way on every run. `reservations` is consulted
/// instead of the snapshot's own index so that intents accepted earlier in
/// the same batch count against link capacity. Returns an empty path when
/// `src == dst` and `None` when no path exists.
pub fn constrained_bfs(
    snapshot: &TopologySnapshot,
    reservations: &PathIntentMap,
    src: Dpid,
    dst: Dpid,
    required: f64,
) -> Option<Vec<LinkTuple>> {
    if src == dst {
        return Some(Vec::new());
    }

    let mut visited: HashSet<Dpid> = HashSet::new();
    let mut via: HashMap<Dpid, LinkTuple> = HashMap::new();
    let mut queue = VecDeque::new();
    visited.insert(src);
    queue.push_back(src);

    while let Some(current) = queue.pop_front() {
        let mut next_hops: Vec<&Link> = snapshot
            .get_outgoing_links(current)
            .filter(|l| l.status == Status::Active)
            .filter(|l| has_room(l, reservations, required))
            .collect();
        next_hops.sort_by_key(|l| (l.dst.dpid, l.dst.port, l.src.port));

        for link in next_hops {
            let neighbour = link.dst.dpid;
            if !visited.insert(neighbour) {
                continue;
            }
            via.insert(neighbour, link.tuple());
            if neighbour == dst {
                return Some(unwind(&via, src, dst));
            }
            queue.push_back(neighbour);
        }
    }
    None
}

fn unwind(via: &HashMap<Dpid, LinkTuple>, src: Dpid, dst: Dpid) -> Vec<LinkTuple> {
    let mut path = Vec::new();
    let mut at = dst;
    while at != src {
        match via.get(&at) {
            Some(tuple) => {
                path.push(*tuple);
                at = tuple.src.dpid;
            }
            None => break,
        }
    }
    path.reverse();
    path
}
