//! redb-backed implementation of [`KvClient`]
//!
//! Every table is a `TableDefinition<&[u8], &[u8]>` whose value is the row
//! version (big-endian u64) followed by the payload. Versions are drawn from a
//! sequence kept in a meta table inside the same write transaction, so a row
//! that is deleted and recreated never reuses a version.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, TableError, WriteTransaction};
use tracing::{debug, info, warn};

use super::{KvClient, KvEntry, Version, WriteOp, WriteOpKind, WriteOpStatus, VERSION_NONEXISTENT};
use crate::error::{ErrorKind, FlowgridError, FlowgridResult};

const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("__flowgrid_meta");
const VERSION_SEQ_KEY: &str = "version_seq";

/// Key-value client over a local redb database
pub struct RedbKvClient {
    db: Database,
    online: AtomicBool,
}

impl RedbKvClient {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> FlowgridResult<Self> {
        let path = path.as_ref();
        let db = Database::create(path)?;
        info!("Opened datastore at {}", path.display());
        Ok(Self {
            db,
            online: AtomicBool::new(true),
        })
    }

    /// Purely in-memory database, used when no `dbconf` is configured
    pub fn in_memory() -> FlowgridResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        debug!("Opened in-memory datastore");
        Ok(Self {
            db,
            online: AtomicBool::new(true),
        })
    }

    /// Simulate losing the connection to the store
    pub fn disconnect(&self) {
        warn!("Datastore marked offline");
        self.online.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        info!("Datastore back online");
        self.online.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn ensure_online(&self, operation: &str) -> FlowgridResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(FlowgridError::transient(operation, "datastore unreachable"))
        }
    }

    fn with_write<R>(
        &self,
        operation: &str,
        f: impl FnOnce(&WriteTransaction) -> FlowgridResult<R>,
    ) -> FlowgridResult<R> {
        self.ensure_online(operation)?;
        let txn = self.db.begin_write()?;
        match f(&txn) {
            Ok(result) => {
                txn.commit()?;
                Ok(result)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!("Abort after failed {} also failed: {}", operation, abort_err);
                }
                Err(e)
            }
        }
    }

    fn read_row(&self, table: &str, key: &[u8]) -> FlowgridResult<Option<(Vec<u8>, Version)>> {
        self.ensure_online("read")?;
        let txn = self.db.begin_read()?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(table);
        let handle = match txn.open_table(def) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let row = match handle.get(key)? {
            Some(guard) => Some(decode_row(guard.value())?),
            None => None,
        };
        Ok(row.map(|(version, value)| (value, version)))
    }
}

fn encode_row(version: Version, value: &[u8]) -> Vec<u8> {
    let mut row = Vec::with_capacity(8 + value.len());
    row.extend_from_slice(&version.to_be_bytes());
    row.extend_from_slice(value);
    row
}

fn decode_row(row: &[u8]) -> FlowgridResult<(Version, Vec<u8>)> {
    if row.len() < 8 {
        return Err(FlowgridError::internal(format!(
            "corrupt datastore row of {} bytes",
            row.len()
        )));
    }
    let mut version = [0u8; 8];
    version.copy_from_slice(&row[..8]);
    Ok((u64::from_be_bytes(version), row[8..].to_vec()))
}

fn next_version(txn: &WriteTransaction) -> FlowgridResult<Version> {
    let mut meta = txn.open_table(META_TABLE)?;
    let current = meta.get(VERSION_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0);
    let next = current + 1;
    meta.insert(VERSION_SEQ_KEY, next)?;
    Ok(next)
}

fn resource(table: &str, key: &[u8]) -> String {
    format!("{}[{}]", table, hex_key(key))
}

fn hex_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Apply one conditional write inside an open transaction
fn apply_op(
    txn: &WriteTransaction,
    kind: WriteOpKind,
    table: &str,
    key: &[u8],
    value: &[u8],
    expected: Version,
) -> FlowgridResult<Version> {
    let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(table);
    let mut handle = txn.open_table(def)?;
    let current = match handle.get(key)? {
        Some(guard) => Some(decode_row(guard.value())?.0),
        None => None,
    };

    match (kind, current) {
        (WriteOpKind::Create, Some(_)) => Err(FlowgridError::already_exists(resource(table, key))),
        (WriteOpKind::Update, None) | (WriteOpKind::Delete, None) => {
            Err(FlowgridError::not_found(resource(table, key)))
        }
        (WriteOpKind::Update, Some(actual)) | (WriteOpKind::Delete, Some(actual))
            if actual != expected =>
        {
            Err(FlowgridError::VersionMismatch {
                resource: resource(table, key),
                expected,
                actual,
            })
        }
        (WriteOpKind::Delete, Some(actual)) | (WriteOpKind::ForceDelete, Some(actual)) => {
            handle.remove(key)?;
            Ok(actual)
        }
        (WriteOpKind::ForceDelete, None) => Ok(VERSION_NONEXISTENT),
        (WriteOpKind::Create, None) | (WriteOpKind::ForceCreate, _) | (WriteOpKind::Update, Some(_)) => {
            drop(handle);
            let version = next_version(txn)?;
            let mut handle = txn.open_table(def)?;
            handle.insert(key, encode_row(version, value).as_slice())?;
            Ok(version)
        }
    }
}

#[async_trait]
impl KvClient for RedbKvClient {
    async fn create(&self, table: &str, key: &[u8], value: &[u8]) -> FlowgridResult<Version> {
        self.with_write("create", |txn| {
            apply_op(txn, WriteOpKind::Create, table, key, value, VERSION_NONEXISTENT)
        })
    }

    async fn force_create(&self, table: &str, key: &[u8], value: &[u8]) -> FlowgridResult<Version> {
        self.with_write("force_create", |txn| {
            apply_op(txn, WriteOpKind::ForceCreate, table, key, value, VERSION_NONEXISTENT)
        })
    }

    async fn read(&self, table: &str, key: &[u8]) -> FlowgridResult<(Vec<u8>, Version)> {
        self.read_row(table, key)?
            .ok_or_else(|| FlowgridError::not_found(resource(table, key)))
    }

    async fn update(&self, table: &str, key: &[u8], value: &[u8], version: Version) -> FlowgridResult<Version> {
        self.with_write("update", |txn| {
            apply_op(txn, WriteOpKind::Update, table, key, value, version)
        })
    }

    async fn delete(&self, table: &str, key: &[u8], version: Version) -> FlowgridResult<Version> {
        self.with_write("delete", |txn| {
            apply_op(txn, WriteOpKind::Delete, table, key, &[], version)
        })
    }

    async fn force_delete(&self, table: &str, key: &[u8]) -> FlowgridResult<Version> {
        self.with_write("force_delete", |txn| {
            apply_op(txn, WriteOpKind::ForceDelete, table, key, &[], VERSION_NONEXISTENT)
        })
    }

    async fn get_all_entries(&self, table: &str) -> FlowgridResult<Vec<KvEntry>> {
        self.ensure_online("get_all_entries")?;
        let txn = self.db.begin_read()?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(table);
        let handle = match txn.open_table(def) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for item in handle.iter()? {
            let (key, row) = item?;
            let (version, value) = decode_row(row.value())?;
            entries.push(KvEntry {
                key: key.value().to_vec(),
                value,
                version,
            });
        }
        Ok(entries)
    }

    async fn multi_write(&self, ops: &mut [WriteOp]) -> FlowgridResult<bool> {
        if let Err(e) = self.ensure_online("multi_write") {
            for op in ops.iter_mut() {
                op.status = WriteOpStatus::Failed(ErrorKind::Transient);
            }
            return Err(e);
        }

        let txn = self.db.begin_write()?;
        let mut all_ok = true;
        for i in 0..ops.len() {
            let op = &ops[i];
            match apply_op(&txn, op.kind, &op.table, &op.key, &op.value, op.version) {
                Ok(version) => ops[i].status = WriteOpStatus::Success(version),
                Err(e) if e.kind() == ErrorKind::Transient => {
                    // The transaction itself is broken, nothing below will land
                    if let Err(abort_err) = txn.abort() {
                        warn!("Abort of multi_write failed: {}", abort_err);
                    }
                    for op in ops.iter_mut() {
                        op.status = WriteOpStatus::Failed(ErrorKind::Transient);
                    }
                    return Err(e);
                }
                Err(e) => {
                    debug!("multi_write op on {} failed: {}", ops[i].table, e);
                    ops[i].status = WriteOpStatus::Failed(e.kind());
                    all_ok = false;
                }
            }
        }

        if let Err(e) = txn.commit() {
            for op in ops.iter_mut() {
                op.status = WriteOpStatus::Failed(ErrorKind::Transient);
            }
            return Err(e.into());
        }
        Ok(all_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "test::switches";

    #[tokio::test]
    async fn test_create_read_update_delete() {
        let client = RedbKvClient::in_memory().unwrap();

        let v1 = client.create(TABLE, b"k", b"one").await.unwrap();
        assert!(v1 > VERSION_NONEXISTENT);
        let err = client.create(TABLE, b"k", b"again").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let (value, version) = client.read(TABLE, b"k").await.unwrap();
        assert_eq!(value, b"one");
        assert_eq!(version, v1);

        let v2 = client.update(TABLE, b"k", b"two", v1).await.unwrap();
        assert!(v2 > v1);
        let err = client.update(TABLE, b"k", b"three", v1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        assert_eq!(client.read(TABLE, b"k").await.unwrap().0, b"two");

        let err = client.delete(TABLE, b"k", v1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        assert_eq!(client.delete(TABLE, b"k", v2).await.unwrap(), v2);
        assert_eq!(client.read(TABLE, b"k").await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_force_operations_and_versions_never_reused() {
        let client = RedbKvClient::in_memory().unwrap();

        let v1 = client.force_create(TABLE, b"k", b"a").await.unwrap();
        let v2 = client.force_create(TABLE, b"k", b"b").await.unwrap();
        assert!(v2 > v1);

        assert_eq!(client.force_delete(TABLE, b"k").await.unwrap(), v2);
        assert_eq!(client.force_delete(TABLE, b"k").await.unwrap(), VERSION_NONEXISTENT);

        let v3 = client.create(TABLE, b"k", b"c").await.unwrap();
        assert!(v3 > v2);
    }

    #[tokio::test]
    async fn test_missing_table_reads() {
        let client = RedbKvClient::in_memory().unwrap();
        assert!(client.get_all_entries("nope").await.unwrap().is_empty());
        assert_eq!(client.read("nope", b"x").await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_multi_write_reports_each_op() {
        let client = RedbKvClient::in_memory().unwrap();
        client.create(TABLE, b"exists", b"x").await.unwrap();

        let mut ops = vec![
            WriteOp::new(WriteOpKind::Create, TABLE, b"a".to_vec(), b"1".to_vec(), 0),
            WriteOp::new(WriteOpKind::Create, TABLE, b"exists".to_vec(), b"2".to_vec(), 0),
            WriteOp::new(WriteOpKind::ForceCreate, TABLE, b"b".to_vec(), b"3".to_vec(), 0),
        ];
        let all_ok = client.multi_write(&mut ops).await.unwrap();
        assert!(!all_ok);
        assert!(ops[0].succeeded());
        assert_eq!(ops[1].status, WriteOpStatus::Failed(ErrorKind::AlreadyExists));
        assert!(ops[2].succeeded());

        let entries = client.get_all_entries(TABLE).await.unwrap();
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"b"[..], &b"exists"[..]]);
    }

    #[tokio::test]
    async fn test_disconnected_writes_are_transient() {
        let client = RedbKvClient::in_memory().unwrap();
        client.disconnect();
        let err = client.create(TABLE, b"k", b"v").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);

        let mut ops = vec![WriteOp::new(WriteOpKind::ForceCreate, TABLE, b"k".to_vec(), vec![], 0)];
        assert!(client.multi_write(&mut ops).await.is_err());
        assert_eq!(ops[0].status, WriteOpStatus::Failed(ErrorKind::Transient));

        client.reconnect();
        assert!(client.create(TABLE, b"k", b"v").await.is_ok());
    }

    #[tokio::test]
    async fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowgrid.redb");
        {
            let client = RedbKvClient::open(&path).unwrap();
            client.create(TABLE, b"k", b"v").await.unwrap();
        }
        let client = RedbKvClient::open(&path).unwrap();
        assert_eq!(client.read(TABLE, b"k").await.unwrap().0, b"v");
    }
}
