//! Error types for Tessera
//!
//! Three error families cross crate boundaries: model construction errors,
//! action failures reported by the executor, and catalog access failures.

use thiserror::Error;

/// Result type alias for value-model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors constructing or mutating value-model types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid chunk range: min {min} is not below max {max}")]
    InvalidRange { min: String, max: String },

    #[error("Chunk version component has reached its maximum value")]
    VersionOverflow,
}

/// Failure reported by the executor for a dispatched action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("Shard version is stale")]
    StaleShardVersion,

    #[error("Routing table is stale")]
    StaleConfig,

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Operation failed: {code}: {message}")]
    Failed { code: i32, message: String },
}

impl ActionError {
    /// Whether the failed action may simply be retried.
    ///
    /// Stale-version errors resolve themselves once the routing information
    /// is refreshed, so they are treated like transient infrastructure
    /// failures.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ActionError::StaleShardVersion | ActionError::StaleConfig | ActionError::Transient(_)
        )
    }
}

/// Failure accessing the cluster catalog or the persistence layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Collection {0} not found")]
    CollectionNotFound(uuid::Uuid),

    #[error("No chunks or chunk version for shard {shard}")]
    ShardVersionUnavailable { shard: String },

    #[error("Catalog write failed: {code}: {message}")]
    WriteFailed { code: i32, message: String },

    #[error("Catalog I/O error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_errors_are_retriable() {
        assert!(ActionError::StaleShardVersion.is_retriable());
        assert!(ActionError::StaleConfig.is_retriable());
        assert!(ActionError::Transient("socket closed".to_string()).is_retriable());
    }

    #[test]
    fn test_operational_failure_is_not_retriable() {
        let err = ActionError::Failed {
            code: 13,
            message: "not authorized".to_string(),
        };
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = CatalogError::WriteFailed {
            code: 11000,
            message: "duplicate key".to_string(),
        };
        assert_eq!(err.to_string(), "Catalog write failed: 11000: duplicate key");
    }
}
