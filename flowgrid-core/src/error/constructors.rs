//! Constructor helpers for FlowgridError

use std::fmt::Display;

use super::types::FlowgridError;

impl FlowgridError {
    /// Create a storage error with a boxed source
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        FlowgridError::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error with a boxed source
    pub fn serialization<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        FlowgridError::Serialization {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        FlowgridError::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        FlowgridError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        FlowgridError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn already_exists(resource: impl Into<String>) -> Self {
        FlowgridError::AlreadyExists {
            resource: resource.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, details: impl Into<String>) -> Self {
        FlowgridError::Transient {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn no_mastership(dpid: impl Display, operation: impl Into<String>) -> Self {
        FlowgridError::NoMastership {
            dpid: dpid.to_string(),
            operation: operation.into(),
        }
    }

    pub fn path_unsatisfiable(intent_id: impl Display, reason: impl Into<String>) -> Self {
        FlowgridError::PathUnsatisfiable {
            intent_id: intent_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn switch_write_failed(dpid: impl Display, details: impl Into<String>) -> Self {
        FlowgridError::SwitchWriteFailed {
            dpid: dpid.to_string(),
            details: details.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        FlowgridError::Internal {
            message: message.into(),
        }
    }
}
