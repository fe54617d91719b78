//! Versioned key-value datastore
//!
//! [`KvClient`] is the interface to the replicated store: named tables of
//! versioned rows with conditional writes. [`RedbKvClient`] implements it on
//! top of redb, and [`Datastore`] layers typed access and a last-good read
//! cache on top of any client.

use async_trait::async_trait;

use crate::error::{ErrorKind, FlowgridError, FlowgridResult};

pub mod facade;
pub mod redb_client;

pub use facade::{Datastore, KvObject, Versioned};
pub use redb_client::RedbKvClient;

/// Row version; strictly increasing across every write to one store
pub type Version = u64;

/// Sentinel for rows that do not exist
pub const VERSION_NONEXISTENT: Version = 0;

/// One row of a table listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOpKind {
    Create,
    ForceCreate,
    Update,
    Delete,
    ForceDelete,
}

/// Outcome of one operation inside a `multi_write`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOpStatus {
    NotExecuted,
    Success(Version),
    Failed(ErrorKind),
}

/// Operation submitted to `multi_write`; each reports its own status
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub kind: WriteOpKind,
    pub table: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Expected version for `Update` and `Delete`
    pub version: Version,
    pub status: WriteOpStatus,
}

impl WriteOp {
    pub fn new(kind: WriteOpKind, table: impl Into<String>, key: Vec<u8>, value: Vec<u8>, version: Version) -> Self {
        Self {
            kind,
            table: table.into(),
            key,
            value,
            version,
            status: WriteOpStatus::NotExecuted,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, WriteOpStatus::Success(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, WriteOpKind::Delete | WriteOpKind::ForceDelete)
    }

    /// The error this op failed with, if it failed
    pub fn failure(&self) -> Option<FlowgridError> {
        let WriteOpStatus::Failed(kind) = self.status else {
            return None;
        };
        let resource = format!("{} row", self.table);
        Some(match kind {
            ErrorKind::NotFound => FlowgridError::not_found(resource),
            ErrorKind::AlreadyExists => FlowgridError::already_exists(resource),
            ErrorKind::VersionMismatch => FlowgridError::VersionMismatch {
                resource,
                expected: self.version,
                actual: VERSION_NONEXISTENT,
            },
            ErrorKind::Transient => FlowgridError::transient("multi_write", resource),
            other => FlowgridError::internal(format!("{:?} on {}", other, resource)),
        })
    }
}

/// Client for the replicated key-value store
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Insert a row; fails with `AlreadyExists` if present
    async fn create(&self, table: &str, key: &[u8], value: &[u8]) -> FlowgridResult<Version>;

    /// Insert or overwrite a row without a version check
    async fn force_create(&self, table: &str, key: &[u8], value: &[u8]) -> FlowgridResult<Version>;

    /// Read a row and its version; fails with `NotFound` if absent
    async fn read(&self, table: &str, key: &[u8]) -> FlowgridResult<(Vec<u8>, Version)>;

    /// Overwrite a row if its stored version equals `version`
    async fn update(&self, table: &str, key: &[u8], value: &[u8], version: Version) -> FlowgridResult<Version>;

    /// Delete a row if its stored version equals `version`
    async fn delete(&self, table: &str, key: &[u8], version: Version) -> FlowgridResult<Version>;

    /// Delete a row without a version check, returning the removed version
    /// or `VERSION_NONEXISTENT`
    async fn force_delete(&self, table: &str, key: &[u8]) -> FlowgridResult<Version>;

    /// Every row of a table in key order
    async fn get_all_entries(&self, table: &str) -> FlowgridResult<Vec<KvEntry>>;

    /// Best-effort batch. Every op records its own status and a failed op
    /// does not prevent the others. Returns `true` when all succeeded.
    async fn multi_write(&self, ops: &mut [WriteOp]) -> FlowgridResult<bool>;

    fn version_nonexistent(&self) -> Version {
        VERSION_NONEXISTENT
    }
}
