//! Error types for table rebuilds
//!
//! Every failure a rebuild can surface, classified so callers (and a
//! scheduler sitting above this crate) can tell a precondition violation from
//! a concurrent-DDL abort or a lock-budget exhaustion.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The relation cannot be rebuilt at all (kind, persistence, identity)
    Eligibility,
    /// Caller lacks a required privilege
    Privilege,
    /// Bad arguments or configuration
    Configuration,
    /// The relation changed structurally while the rebuild ran
    Concurrency,
    /// Exclusive-lock budget or lock availability
    Locking,
    /// Logic fault inside the engine or the host
    Internal,
    /// Spill file and other I/O
    Io,
}

/// Rebuild errors
#[derive(Error, Debug)]
pub enum SqueezeError {
    /// Wrong object kind, persistence, sharing or a system relation
    #[error("Relation not eligible: {0}")]
    NotEligible(String),

    /// An incompatible reader (e.g. an open cursor) is attached to the table
    #[error("Relation in use: {0}")]
    InUseExternally(String),

    /// The table has no usable row-identity index
    #[error("Table \"{schema}\".\"{table}\" has no identity index")]
    NoIdentityKey { schema: String, table: String },

    /// Replica identity FULL is refused
    #[error("Replica identity \"full\" not supported")]
    ReplicaIdentityFull,

    /// Insufficient privilege
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A capture session with the same name is already active
    #[error("Capture session already active: {0}")]
    AlreadyActive(String),

    /// Bad tablespace, index mapping or clustering index argument
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Relation does not exist (at lookup time)
    #[error("Relation not found: {0}")]
    RelationNotFound(String),

    /// Catalog fingerprint mismatch at a checkpoint
    #[error("Concurrent structural change: {0}")]
    ConcurrentStructuralChange(String),

    /// The final merge exceeded the lock budget on every attempt
    #[error("max_exclusive_lock_duration prevented completion after {attempts} attempts")]
    LockBudgetExceeded { attempts: u32 },

    /// A lock could not be granted
    #[error("Lock not available: {0}")]
    LockNotAvailable(String),

    /// Identity-index row missing during replay and similar logic faults
    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host-side failure not covered by the variants above
    #[error("Host error: {0}")]
    Host(String),

    /// Spill file encoding error
    #[error("Spill error: {0}")]
    Spill(#[from] bincode::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SqueezeError {
    /// Create a not-eligible error
    pub fn not_eligible(msg: impl Into<String>) -> Self {
        Self::NotEligible(msg.into())
    }

    /// Create an in-use error
    pub fn in_use(msg: impl Into<String>) -> Self {
        Self::InUseExternally(msg.into())
    }

    /// Create a permission error
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create an invalid-configuration error
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a concurrent structural change error
    pub fn structural_change(msg: impl Into<String>) -> Self {
        Self::ConcurrentStructuralChange(msg.into())
    }

    /// Create an internal inconsistency error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalInconsistency(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a host error
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    /// Create a lock-not-available error
    pub fn lock_not_available(msg: impl Into<String>) -> Self {
        Self::LockNotAvailable(msg.into())
    }

    /// Check if running the whole rebuild again later may succeed.
    ///
    /// Nothing inside a rebuild is retried except the final-merge loop; this
    /// only tells a caller that the source was left untouched and the failure
    /// depended on timing rather than on the table itself.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::LockBudgetExceeded { .. } | Self::LockNotAvailable(_) | Self::AlreadyActive(_)
        )
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotEligible(_)
            | Self::InUseExternally(_)
            | Self::NoIdentityKey { .. }
            | Self::ReplicaIdentityFull
            | Self::RelationNotFound(_) => ErrorCategory::Eligibility,
            Self::PermissionDenied(_) => ErrorCategory::Privilege,
            Self::InvalidConfiguration(_) | Self::Config(_) => ErrorCategory::Configuration,
            Self::ConcurrentStructuralChange(_) | Self::AlreadyActive(_) => {
                ErrorCategory::Concurrency
            }
            Self::LockBudgetExceeded { .. } | Self::LockNotAvailable(_) => ErrorCategory::Locking,
            Self::InternalInconsistency(_) | Self::Host(_) => ErrorCategory::Internal,
            Self::Spill(_) | Self::Io(_) => ErrorCategory::Io,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotEligible(_) => "not_eligible",
            Self::InUseExternally(_) => "in_use",
            Self::NoIdentityKey { .. } => "no_identity_key",
            Self::ReplicaIdentityFull => "replica_identity_full",
            Self::PermissionDenied(_) => "permission_denied",
            Self::AlreadyActive(_) => "already_active",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::RelationNotFound(_) => "relation_not_found",
            Self::ConcurrentStructuralChange(_) => "concurrent_structural_change",
            Self::LockBudgetExceeded { .. } => "lock_budget_exceeded",
            Self::LockNotAvailable(_) => "lock_not_available",
            Self::InternalInconsistency(_) => "internal_inconsistency",
            Self::Config(_) => "config_error",
            Self::Host(_) => "host_error",
            Self::Spill(_) => "spill_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Result type for rebuild operations
pub type Result<T> = std::result::Result<T, SqueezeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SqueezeError::structural_change("Concurrent change of index detected");
        assert!(err.to_string().contains("Concurrent structural change"));
        assert!(err.to_string().contains("index detected"));

        let err = SqueezeError::NoIdentityKey {
            schema: "public".into(),
            table: "t".into(),
        };
        assert_eq!(
            err.to_string(),
            "Table \"public\".\"t\" has no identity index"
        );
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(SqueezeError::LockBudgetExceeded { attempts: 4 }.is_retriable());
        assert!(SqueezeError::lock_not_available("t").is_retriable());

        assert!(!SqueezeError::structural_change("x").is_retriable());
        assert!(!SqueezeError::internal("row not found").is_retriable());
        assert!(!SqueezeError::not_eligible("view").is_retriable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            SqueezeError::ReplicaIdentityFull.category(),
            ErrorCategory::Eligibility
        );
        assert_eq!(
            SqueezeError::permission_denied("x").category(),
            ErrorCategory::Privilege
        );
        assert_eq!(
            SqueezeError::invalid_configuration("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            SqueezeError::structural_change("x").category(),
            ErrorCategory::Concurrency
        );
        assert_eq!(
            SqueezeError::LockBudgetExceeded { attempts: 4 }.category(),
            ErrorCategory::Locking
        );
    }

    #[test]
    fn test_error_code() {
        assert_eq!(SqueezeError::ReplicaIdentityFull.error_code(), "replica_identity_full");
        assert_eq!(
            SqueezeError::internal("x").error_code(),
            "internal_inconsistency"
        );
    }
}
