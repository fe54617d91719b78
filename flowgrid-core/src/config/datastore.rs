//! Datastore client configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::error::{FlowgridError, FlowgridResult};

/// Where the key-value datastore lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// Path of the database file; `None` keeps everything in memory
    pub dbconf: Option<PathBuf>,

    /// Table namespace prefix, tables are named `<namespace>::<table>`
    pub namespace: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            dbconf: None,
            namespace: DEFAULT_DATASTORE_NAMESPACE.to_string(),
        }
    }
}

impl DatastoreConfig {
    pub fn from_env() -> FlowgridResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub(crate) fn apply_env(&mut self) -> FlowgridResult<()> {
        if let Ok(path) = std::env::var("FLOWGRID_DBCONF") {
            self.dbconf = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Ok(ns) = std::env::var("FLOWGRID_NAMESPACE") {
            self.namespace = ns;
        }
        Ok(())
    }

    pub fn validate(&self) -> FlowgridResult<()> {
        if self.namespace.is_empty() {
            return Err(FlowgridError::configuration(
                "datastore.namespace",
                "namespace must not be empty",
            ));
        }
        if self.namespace.contains("::") {
            return Err(FlowgridError::configuration(
                "datastore.namespace",
                "namespace must not contain '::'",
            ));
        }
        Ok(())
    }
}
