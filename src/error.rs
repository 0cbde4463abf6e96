//! Error types for the converge reconciliation engine.
//!
//! Errors are grouped by the layer that raises them: document loading,
//! graph construction, state management, planning, provider calls,
//! provisioners and whole-run orchestration. Structural errors (cycles,
//! address conflicts, destroy protection, stale plans, lock contention)
//! abort a run before anything external is touched; provider and
//! provisioner errors are recorded against a single step.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Desired-state document errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph construction errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Provisioner errors.
    #[error("Provisioner error: {0}")]
    Provisioner(#[from] ProvisionerError),

    /// Run orchestration errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Desired-state document errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The document could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A resource address or reference could not be parsed.
    #[error("Invalid address '{input}': {reason}")]
    InvalidAddress {
        /// The text that failed to parse.
        input: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Resource graph construction errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Dependency edges form a cycle.
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    Cycle {
        /// Addresses along the cycle; the first address is repeated at the end.
        cycle: Vec<String>,
    },

    /// Two declarations expand to the same address.
    #[error("Address conflict: {address} is declared more than once")]
    AddressConflict {
        /// The duplicated address.
        address: String,
    },

    /// A reference or `depends_on` entry names nothing in the document.
    #[error("{from} references unknown resource '{reference}'")]
    UnknownReference {
        /// Address of the referring instance.
        from: String,
        /// The unresolved reference text.
        reference: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The exclusive lock is held elsewhere, or a mutation was attempted without it.
    #[error("State lock contention: {message}")]
    LockContention {
        /// Description of the contention.
        message: String,
        /// Identity of the current lock holder, when known.
        holder: Option<String>,
    },

    /// A rename or import collides with an existing entry.
    #[error("Address conflict: state already contains {address}")]
    AddressConflict {
        /// The colliding address.
        address: String,
    },

    /// The requested entry does not exist.
    #[error("No state entry for {address}")]
    EntryNotFound {
        /// The missing address.
        address: String,
    },

    /// Backend storage error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A destroy or replace would touch a protected instance.
    #[error("{address} has prevent_destroy set but the plan would {action} it")]
    PreventDestroyViolation {
        /// The protected address.
        address: String,
        /// The action that was refused.
        action: String,
    },

    /// The state changed after the plan was computed.
    #[error(
        "Plan is stale: computed against state {expected}, current state is {found}; re-plan"
    )]
    StateDriftDetected {
        /// State version recorded in the plan.
        expected: String,
        /// Current state version.
        found: String,
    },

    /// The step graph derived from the changes is not executable.
    #[error("Invalid plan: {message}")]
    InvalidPlan {
        /// Description of the problem.
        message: String,
    },
}

/// Provider errors, recorded against the step that raised them.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No provider is registered for a resource type.
    #[error("No provider registered for resource type '{resource_type}'")]
    UnknownResourceType {
        /// The unmatched resource type.
        resource_type: String,
    },

    /// A create, update or delete call failed.
    #[error("{operation} of {address} failed: {message}")]
    OperationFailed {
        /// The affected address.
        address: String,
        /// The provider operation (create, update, delete).
        operation: String,
        /// Provider-reported failure.
        message: String,
    },

    /// After-attributes still contain references that cannot be resolved.
    #[error("{address} has unresolved references: {references}")]
    UnresolvedReferences {
        /// The affected address.
        address: String,
        /// Comma separated list of the unresolved expressions.
        references: String,
    },
}

/// Provisioner errors. These taint the instance instead of reverting it.
#[derive(Debug, Error)]
pub enum ProvisionerError {
    /// A command exited unsuccessfully.
    #[error("Command '{command}' failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        /// The failing command.
        command: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The connection method is not supported by the executor.
    #[error("Unsupported connection type '{method}'")]
    UnsupportedConnection {
        /// The requested method.
        method: String,
    },

    /// Connection parameters or commands could not be resolved from the instance.
    #[error("Cannot resolve provisioner input: {message}")]
    Resolution {
        /// Description of the resolution failure.
        message: String,
    },

    /// A command did not complete in time.
    #[error("Command '{command}' timed out after {timeout_secs}s")]
    Timeout {
        /// The command that timed out.
        command: String,
        /// The applied timeout.
        timeout_secs: u64,
    },
}

/// Run orchestration errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The run was aborted before execution.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::State(StateError::LockContention { .. }))
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::State(StateError::LockContention { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true for errors that abort a run before any external mutation.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Graph(_)
                | Self::Plan(_)
                | Self::State(
                    StateError::LockContention { .. } | StateError::AddressConflict { .. }
                )
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Creates an address parse error.
    #[must_use]
    pub fn invalid_address(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a lock contention error.
    #[must_use]
    pub fn lock_contention(message: impl Into<String>, holder: Option<String>) -> Self {
        Self::LockContention {
            message: message.into(),
            holder,
        }
    }
}

impl ProviderError {
    /// Creates an operation failure.
    #[must_use]
    pub fn failed(
        address: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            address: address.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_full_path() {
        let err = GraphError::Cycle {
            cycle: vec!["a.x".into(), "b.y".into(), "a.x".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a.x -> b.y -> a.x");
    }

    #[test]
    fn test_lock_contention_is_retryable() {
        let err = ConvergeError::from(StateError::lock_contention("held", Some("ci".into())));
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(2));
        assert!(err.is_structural());
    }

    #[test]
    fn test_provider_error_is_not_structural() {
        let err = ConvergeError::from(ProviderError::failed("null_thing.a", "create", "boom"));
        assert!(!err.is_retryable());
        assert!(!err.is_structural());
    }
}
