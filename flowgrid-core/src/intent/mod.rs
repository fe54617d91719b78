//! Intents and their compilation to flow entries
//!
//! An [`Intent`] is a tagged sum: the two shortest-path forms describe what
//! the caller wants, and [`PathIntent`] is the resolved form carrying the
//! link sequence chosen for a parent intent. Compilation runs in three
//! stages:
//!
//! 1. [`path_calc`] resolves each operation against a topology snapshot with
//!    the constrained BFS in [`bfs`], pushing back what cannot be satisfied.
//! 2. [`plan_calc`] expands path intents into per-switch flow entries and
//!    folds ADD/REMOVE contributions into install phases.
//! 3. [`runtime::IntentRuntime`] persists the surviving entries as flow paths
//!    and kicks synchronisation for the switches this instance masters.

use serde::{Deserialize, Serialize};

use crate::error::{FlowgridError, FlowgridResult};
use crate::types::{Dpid, IntentId, LinkTuple, MacAddress, PortNumber};

pub mod bfs;
pub mod path_calc;
pub mod plan_calc;
pub mod runtime;

pub use path_calc::{calc_path_intents, PathCalcOutput};
pub use plan_calc::{calc_plan, Plan, PlanFlowEntry};
pub use runtime::{IntentBatchReport, IntentRuntime, IntentState};

/// Hop-minimising path between two host attachment points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortestPathIntent {
    pub id: IntentId,
    pub src_switch: Dpid,
    pub src_port: PortNumber,
    pub src_mac: MacAddress,
    pub dst_switch: Dpid,
    pub dst_port: PortNumber,
    pub dst_mac: MacAddress,
}

/// Shortest path whose every link has at least `bandwidth` available
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstrainedShortestPathIntent {
    pub path: ShortestPathIntent,
    pub bandwidth: f64,
}

/// A resolved intent: the parent plus the links chosen for it
///
/// The id is the parent's id, so a later REMOVE of the parent finds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathIntent {
    pub id: IntentId,
    pub parent: Box<Intent>,
    pub path: Vec<LinkTuple>,
    pub bandwidth: f64,
}

impl PathIntent {
    pub fn new(id: IntentId, parent: Intent, path: Vec<LinkTuple>, bandwidth: f64) -> FlowgridResult<Self> {
        if matches!(parent, Intent::Path(_)) {
            return Err(FlowgridError::invalid_input(
                "parent",
                format!("path intent {} cannot have a path intent as parent", id),
            ));
        }
        Ok(Self {
            id,
            parent: Box::new(parent),
            path,
            bandwidth,
        })
    }

    /// Endpoints of the parent intent
    pub fn endpoints(&self) -> Option<&ShortestPathIntent> {
        self.parent.endpoints()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Intent {
    ShortestPath(ShortestPathIntent),
    ConstrainedShortestPath(ConstrainedShortestPathIntent),
    Path(PathIntent),
}

impl Intent {
    pub fn id(&self) -> IntentId {
        match self {
            Intent::ShortestPath(i) => i.id,
            Intent::ConstrainedShortestPath(i) => i.path.id,
            Intent::Path(i) => i.id,
        }
    }

    pub fn endpoints(&self) -> Option<&ShortestPathIntent> {
        match self {
            Intent::ShortestPath(i) => Some(i),
            Intent::ConstrainedShortestPath(i) => Some(&i.path),
            Intent::Path(i) => i.parent.endpoints(),
        }
    }

    /// Bandwidth every link on the path must still have available
    pub fn required_bandwidth(&self) -> f64 {
        match self {
            Intent::ShortestPath(_) => 0.0,
            Intent::ConstrainedShortestPath(i) => i.bandwidth,
            Intent::Path(i) => i.bandwidth,
        }
    }
}

impl From<ShortestPathIntent> for Intent {
    fn from(intent: ShortestPathIntent) -> Self {
        Intent::ShortestPath(intent)
    }
}

impl From<ConstrainedShortestPathIntent> for Intent {
    fn from(intent: ConstrainedShortestPathIntent) -> Self {
        Intent::ConstrainedShortestPath(intent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentOperator {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentOperation {
    pub operator: IntentOperator,
    pub intent: Intent,
}

/// Ordered batch of intent operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentOperationList {
    ops: Vec<IntentOperation>,
}

impl IntentOperationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, intent: impl Into<Intent>) -> Self {
        self.ops.push(IntentOperation {
            operator: IntentOperator::Add,
            intent: intent.into(),
        });
        self
    }

    pub fn remove(mut self, intent: impl Into<Intent>) -> Self {
        self.ops.push(IntentOperation {
            operator: IntentOperator::Remove,
            intent: intent.into(),
        });
        self
    }

    pub fn push(&mut self, op: IntentOperation) {
        self.ops.push(op);
    }

    pub fn iter(&self) -> impl Iterator<Item = &IntentOperation> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
