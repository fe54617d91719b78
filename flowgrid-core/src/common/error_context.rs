//! Context helpers for results and options
//!
//! These keep the `?` chains in component code short while still recording
//! which operation failed.

use crate::error::{ErrorKind, FlowgridError, FlowgridResult};

/// Extension methods on [`FlowgridResult`]
pub trait ResultContext<T> {
    /// Log the error at `error` level and hand it back
    fn log_error(self, context: &str) -> FlowgridResult<T>;

    /// Log the error at `warn` level and hand it back
    fn log_if_error(self, context: &str) -> FlowgridResult<T>;

    /// Relabel storage and transient failures with the operation that hit them
    fn with_operation(self, operation: &str) -> FlowgridResult<T>;

    /// Map `NotFound` to `Ok(None)`
    fn optional(self) -> FlowgridResult<Option<T>>;
}

impl<T> ResultContext<T> for FlowgridResult<T> {
    fn log_error(self, context: &str) -> FlowgridResult<T> {
        if let Err(ref e) = self {
            tracing::error!("{}: {}", context, e);
        }
        self
    }

    fn log_if_error(self, context: &str) -> FlowgridResult<T> {
        if let Err(ref e) = self {
            tracing::warn!("{}: {}", context, e);
        }
        self
    }

    fn with_operation(self, operation: &str) -> FlowgridResult<T> {
        self.map_err(|e| match e {
            FlowgridError::Storage { source, .. } => FlowgridError::Storage {
                operation: operation.to_string(),
                source,
            },
            FlowgridError::Serialization { source, .. } => FlowgridError::Serialization {
                operation: operation.to_string(),
                source,
            },
            FlowgridError::Transient { details, .. } => FlowgridError::Transient {
                operation: operation.to_string(),
                details,
            },
            other => other,
        })
    }

    fn optional(self) -> FlowgridResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Extension methods turning `None` into a structured error
pub trait OptionContext<T> {
    fn not_found(self, resource: impl FnOnce() -> String) -> FlowgridResult<T>;
}

impl<T> OptionContext<T> for Option<T> {
    fn not_found(self, resource: impl FnOnce() -> String) -> FlowgridResult<T> {
        self.ok_or_else(|| FlowgridError::NotFound {
            resource: resource(),
        })
    }
}
