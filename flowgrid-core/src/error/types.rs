//! Core error types for flowgrid

use std::time::Duration;

use thiserror::Error;

/// Error type shared by every flowgrid component
#[derive(Error, Debug)]
pub enum FlowgridError {
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Version mismatch on {resource}: expected {expected}, found {actual}")]
    VersionMismatch {
        resource: String,
        expected: u64,
        actual: u64,
    },

    #[error("Not master for switch {dpid} during {operation}")]
    NoMastership { dpid: String, operation: String },

    #[error("Intent {intent_id} cannot be satisfied: {reason}")]
    PathUnsatisfiable { intent_id: String, reason: String },

    #[error("Write to switch {dpid} failed: {details}")]
    SwitchWriteFailed { dpid: String, details: String },

    #[error("Transient failure during {operation}: {details}")]
    Transient { operation: String, details: String },

    #[error("Timeout after {duration:?} during {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Storage operation failed: {operation}")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization failed: {operation}")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error in {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Invalid operation {operation}: {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification of a [`FlowgridError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    VersionMismatch,
    NoMastership,
    PathUnsatisfiable,
    SwitchWriteFailed,
    Transient,
    InvalidInput,
    Fatal,
}

impl FlowgridError {
    /// The kind callers pattern-match on
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowgridError::NotFound { .. } => ErrorKind::NotFound,
            FlowgridError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            FlowgridError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            FlowgridError::NoMastership { .. } => ErrorKind::NoMastership,
            FlowgridError::PathUnsatisfiable { .. } => ErrorKind::PathUnsatisfiable,
            FlowgridError::SwitchWriteFailed { .. } => ErrorKind::SwitchWriteFailed,
            FlowgridError::Transient { .. }
            | FlowgridError::Timeout { .. }
            | FlowgridError::Storage { .. } => ErrorKind::Transient,
            FlowgridError::InvalidInput { .. } | FlowgridError::InvalidOperation { .. } => {
                ErrorKind::InvalidInput
            }
            FlowgridError::Serialization { .. }
            | FlowgridError::Configuration { .. }
            | FlowgridError::Internal { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// HTTP status presented by the REST bindings
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidInput => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists | ErrorKind::VersionMismatch => 409,
            ErrorKind::Transient => 503,
            _ => 500,
        }
    }
}

/// Result type alias using FlowgridError
pub type FlowgridResult<T> = std::result::Result<T, FlowgridError>;

/// Short alias used inside the crate
pub type Result<T> = FlowgridResult<T>;
