//! Typed access to the key-value store
//!
//! Rows are bincode-encoded [`KvObject`]s stored in `<namespace>::<table>`.
//! Every successful read or write refreshes a local image of the row, and
//! when the store is unreachable reads fall back to that image with
//! `stale = true` instead of failing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{KvClient, KvEntry, Version, WriteOp, WriteOpKind, WriteOpStatus, VERSION_NONEXISTENT};
use crate::common::ResultContext;
use crate::error::{ErrorKind, FlowgridError, FlowgridResult};

/// A record stored in one datastore table
pub trait KvObject: Serialize + DeserializeOwned + Send + Sync {
    /// Table name without the namespace prefix
    const TABLE: &'static str;

    fn key(&self) -> Vec<u8>;
}

/// A decoded row with its version
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
    /// Served from the local image because the store was unreachable
    pub stale: bool,
}

type TableImage = BTreeMap<Vec<u8>, (Vec<u8>, Version)>;

/// Typed facade over a [`KvClient`]
pub struct Datastore {
    client: Arc<dyn KvClient>,
    namespace: String,
    image: Mutex<HashMap<String, TableImage>>,
}

impl Datastore {
    pub fn new(client: Arc<dyn KvClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            image: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<dyn KvClient> {
        &self.client
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn table_name<T: KvObject>(&self) -> String {
        format!("{}::{}", self.namespace, T::TABLE)
    }

    fn encode<T: KvObject>(obj: &T) -> FlowgridResult<Vec<u8>> {
        bincode::serialize(obj)
            .map_err(|e| FlowgridError::serialization(format!("encode {}", T::TABLE), e))
    }

    fn decode<T: KvObject>(bytes: &[u8]) -> FlowgridResult<T> {
        bincode::deserialize(bytes)
            .map_err(|e| FlowgridError::serialization(format!("decode {}", T::TABLE), e))
    }

    fn remember(&self, table: &str, key: &[u8], value: Option<(Vec<u8>, Version)>) {
        let mut image = self.image.lock();
        let rows = image.entry(table.to_string()).or_default();
        match value {
            Some(row) => {
                rows.insert(key.to_vec(), row);
            }
            None => {
                rows.remove(key);
            }
        }
    }

    pub async fn create<T: KvObject>(&self, obj: &T) -> FlowgridResult<Version> {
        let table = self.table_name::<T>();
        let key = obj.key();
        let bytes = Self::encode(obj)?;
        let version = self
            .client
            .create(&table, &key, &bytes)
            .await
            .with_operation("create")?;
        self.remember(&table, &key, Some((bytes, version)));
        Ok(version)
    }

    pub async fn force_create<T: KvObject>(&self, obj: &T) -> FlowgridResult<Version> {
        let table = self.table_name::<T>();
        let key = obj.key();
        let bytes = Self::encode(obj)?;
        let version = self.client.force_create(&table, &key, &bytes).await?;
        self.remember(&table, &key, Some((bytes, version)));
        Ok(version)
    }

    pub async fn read<T: KvObject>(&self, key: &[u8]) -> FlowgridResult<Versioned<T>> {
        let table = self.table_name::<T>();
        match self.client.read(&table, key).await {
            Ok((bytes, version)) => {
                let value = Self::decode(&bytes)?;
                self.remember(&table, key, Some((bytes, version)));
                Ok(Versioned {
                    value,
                    version,
                    stale: false,
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.remember(&table, key, None);
                Err(e)
            }
            Err(e) if e.kind() == ErrorKind::Transient => {
                let cached = self
                    .image
                    .lock()
                    .get(&table)
                    .and_then(|rows| rows.get(key).cloned());
                match cached {
                    Some((bytes, version)) => {
                        debug!("Serving stale row from {} while store is unreachable", table);
                        Ok(Versioned {
                            value: Self::decode(&bytes)?,
                            version,
                            stale: true,
                        })
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update<T: KvObject>(&self, obj: &T, version: Version) -> FlowgridResult<Version> {
        let table = self.table_name::<T>();
        let key = obj.key();
        let bytes = Self::encode(obj)?;
        let new_version = self
            .client
            .update(&table, &key, &bytes, version)
            .await
            .with_operation("update")?;
        self.remember(&table, &key, Some((bytes, new_version)));
        Ok(new_version)
    }

    pub async fn delete<T: KvObject>(&self, key: &[u8], version: Version) -> FlowgridResult<Version> {
        let table = self.table_name::<T>();
        let removed = self.client.delete(&table, key, version).await?;
        self.remember(&table, key, None);
        Ok(removed)
    }

    pub async fn force_delete<T: KvObject>(&self, key: &[u8]) -> FlowgridResult<Version> {
        let table = self.table_name::<T>();
        let removed = self.client.force_delete(&table, key).await?;
        self.remember(&table, key, None);
        Ok(removed)
    }

    /// Every row of `T`'s table; rows that fail to decode are skipped
    pub async fn read_all<T: KvObject>(&self) -> FlowgridResult<Vec<Versioned<T>>> {
        let table = self.table_name::<T>();
        let (entries, stale) = match self.client.get_all_entries(&table).await {
            Ok(entries) => {
                let rows: TableImage = entries
                    .iter()
                    .map(|e| (e.key.clone(), (e.value.clone(), e.version)))
                    .collect();
                self.image.lock().insert(table.clone(), rows);
                (entries, false)
            }
            Err(e) if e.kind() == ErrorKind::Transient => {
                let image = self.image.lock();
                match image.get(&table) {
                    Some(rows) => {
                        debug!("Serving stale listing of {} while store is unreachable", table);
                        let entries = rows
                            .iter()
                            .map(|(k, (v, ver))| KvEntry {
                                key: k.clone(),
                                value: v.clone(),
                                version: *ver,
                            })
                            .collect();
                        (entries, true)
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match Self::decode::<T>(&entry.value) {
                Ok(value) => out.push(Versioned {
                    value,
                    version: entry.version,
                    stale,
                }),
                Err(e) => warn!("Skipping undecodable row in {}: {}", table, e),
            }
        }
        Ok(out)
    }

    pub fn op_create<T: KvObject>(&self, obj: &T) -> FlowgridResult<WriteOp> {
        Ok(WriteOp::new(
            WriteOpKind::Create,
            self.table_name::<T>(),
            obj.key(),
            Self::encode(obj)?,
            VERSION_NONEXISTENT,
        ))
    }

    pub fn op_force_create<T: KvObject>(&self, obj: &T) -> FlowgridResult<WriteOp> {
        Ok(WriteOp::new(
            WriteOpKind::ForceCreate,
            self.table_name::<T>(),
            obj.key(),
            Self::encode(obj)?,
            VERSION_NONEXISTENT,
        ))
    }

    pub fn op_update<T: KvObject>(&self, obj: &T, version: Version) -> FlowgridResult<WriteOp> {
        Ok(WriteOp::new(
            WriteOpKind::Update,
            self.table_name::<T>(),
            obj.key(),
            Self::encode(obj)?,
            version,
        ))
    }

    pub fn op_delete<T: KvObject>(&self, key: Vec<u8>, version: Version) -> WriteOp {
        WriteOp::new(WriteOpKind::Delete, self.table_name::<T>(), key, Vec::new(), version)
    }

    pub fn op_force_delete<T: KvObject>(&self, key: Vec<u8>) -> WriteOp {
        WriteOp::new(
            WriteOpKind::ForceDelete,
            self.table_name::<T>(),
            key,
            Vec::new(),
            VERSION_NONEXISTENT,
        )
    }

    /// Best-effort batch; the local image follows every op that landed
    pub async fn multi_write(&self, ops: &mut [WriteOp]) -> FlowgridResult<bool> {
        let result = self.client.multi_write(ops).await;
        for op in ops.iter() {
            if let WriteOpStatus::Success(version) = op.status {
                if op.is_delete() {
                    self.remember(&op.table, &op.key, None);
                } else {
                    self.remember(&op.table, &op.key, Some((op.value.clone(), version)));
                }
            }
        }
        result
    }
}
