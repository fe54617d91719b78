//! Error handling for the flowgrid controller core
//!
//! Every fallible operation in the crate returns [`FlowgridResult`]. Variants
//! carry the operation and resource they concern so that logs stay useful
//! without a backtrace, and [`FlowgridError::kind`] collapses them onto the
//! small set of kinds callers branch on:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Kind              │ Raised by                  │ REST status │
//! ├──────────────────────────────────────────────────────────────┤
//! │ NotFound          │ datastore, flow manager    │ 404         │
//! │ AlreadyExists     │ datastore, registry        │ 409         │
//! │ VersionMismatch   │ datastore update/delete    │ 409         │
//! │ NoMastership      │ discovery, synchroniser    │ 500         │
//! │ PathUnsatisfiable │ path runtime (push back)   │ 500         │
//! │ SwitchWriteFailed │ flow pusher                │ 500         │
//! │ Transient         │ datastore, coordination    │ 503         │
//! │ InvalidInput      │ API, flow manager, trie    │ 400         │
//! │ Fatal             │ everything else            │ 500         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod constructors;
pub mod conversions;
pub mod types;


pub use types::{ErrorKind, FlowgridError, FlowgridResult, Result};
