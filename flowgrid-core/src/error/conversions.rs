//! From implementations so that `?` works across library boundaries

use super::types::FlowgridError;

impl From<redb::Error> for FlowgridError {
    fn from(err: redb::Error) -> Self {
        FlowgridError::storage("redb", err)
    }
}

impl From<redb::DatabaseError> for FlowgridError {
    fn from(err: redb::DatabaseError) -> Self {
        FlowgridError::storage("open database", err)
    }
}

impl From<redb::TransactionError> for FlowgridError {
    fn from(err: redb::TransactionError) -> Self {
        FlowgridError::storage("begin transaction", err)
    }
}

impl From<redb::TableError> for FlowgridError {
    fn from(err: redb::TableError) -> Self {
        FlowgridError::storage("open table", err)
    }
}

impl From<redb::StorageError> for FlowgridError {
    fn from(err: redb::StorageError) -> Self {
        FlowgridError::storage("storage access", err)
    }
}

impl From<redb::CommitError> for FlowgridError {
    fn from(err: redb::CommitError) -> Self {
        FlowgridError::storage("commit transaction", err)
    }
}

impl From<bincode::Error> for FlowgridError {
    fn from(err: bincode::Error) -> Self {
        FlowgridError::serialization("bincode", err)
    }
}

impl From<serde_json::Error> for FlowgridError {
    fn from(err: serde_json::Error) -> Self {
        FlowgridError::InvalidInput {
            field: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for FlowgridError {
    fn from(err: toml::de::Error) -> Self {
        FlowgridError::configuration("toml", err.to_string())
    }
}

impl From<std::io::Error> for FlowgridError {
    fn from(err: std::io::Error) -> Self {
        FlowgridError::storage("io", err)
    }
}

impl From<tokio::task::JoinError> for FlowgridError {
    fn from(err: tokio::task::JoinError) -> Self {
        FlowgridError::Internal {
            message: format!("Task panicked: {}", err),
        }
    }
}

impl From<tokio::time::error::Elapsed> for FlowgridError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FlowgridError::Timeout {
            operation: "async_operation".to_string(),
            duration: std::time::Duration::from_secs(0),
        }
    }
}
