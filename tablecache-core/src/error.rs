//! Error types for tablecache operations

use crate::ObjectId;
use thiserror::Error;

/// Index consistency errors.
///
/// Both conflict variants are recovered inside the cache by invalidating it
/// and retrying the originating call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("Unique violation in index {index}: key {key} already present")]
    UniqueViolation { index: String, key: String },

    #[error("Key of object {id} changed while cached in index {index}")]
    KeyChanged { index: String, id: ObjectId },

    #[error("Index {index} is permanent and cannot be detached")]
    PermanentIndex { index: String },
}

/// Storage collaborator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Load failed for {entity}: {reason}")]
    LoadFailed { entity: String, reason: String },

    #[error("Serial query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("A cache for {name} is already registered")]
    DuplicateCache { name: String },

    #[error("Malformed configuration: {reason}")]
    Malformed { reason: String },
}

/// Master error type for all tablecache errors.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache {cache}: {operation} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted {
        cache: String,
        operation: &'static str,
        attempts: u32,
    },
}

impl CacheError {
    /// Unique violations and key changes mean the cached population can no
    /// longer be trusted and must be rebuilt.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CacheError::Index(IndexError::UniqueViolation { .. })
                | CacheError::Index(IndexError::KeyChanged { .. })
        )
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, CacheError::Storage(_))
    }
}

/// Result type alias for tablecache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_error_display_unique_violation() {
        let err = IndexError::UniqueViolation {
            index: "name".to_string(),
            key: "\"acme\"".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Unique violation"));
        assert!(msg.contains("name"));
        assert!(msg.contains("acme"));
    }

    #[test]
    fn test_storage_error_display_load_failed() {
        let err = StorageError::LoadFailed {
            entity: "Customer".to_string(),
            reason: "connection reset".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Customer"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "keep_quota".to_string(),
            value: "150".to_string(),
            reason: "must be a percentage".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("keep_quota"));
        assert!(msg.contains("150"));
        assert!(msg.contains("must be a percentage"));
    }

    #[test]
    fn test_conflict_classification() {
        let unique = CacheError::from(IndexError::UniqueViolation {
            index: "id".to_string(),
            key: "1".to_string(),
        });
        assert!(unique.is_conflict());

        let changed = CacheError::from(IndexError::KeyChanged {
            index: "name".to_string(),
            id: 7,
        });
        assert!(changed.is_conflict());

        let permanent = CacheError::from(IndexError::PermanentIndex {
            index: "id".to_string(),
        });
        assert!(!permanent.is_conflict());

        let storage = CacheError::from(StorageError::LockPoisoned);
        assert!(!storage.is_conflict());
        assert!(storage.is_storage());
    }

    #[test]
    fn test_retries_exhausted_display() {
        let err = CacheError::ConflictRetriesExhausted {
            cache: "Customer".to_string(),
            operation: "select",
            attempts: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Customer"));
        assert!(msg.contains("select"));
        assert!(msg.contains('3'));
    }
}
