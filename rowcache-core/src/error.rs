//! Error types for rowcache operations

use thiserror::Error;

/// Relational store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Query failed on {table}: {reason}")]
    QueryFailed { table: String, reason: String },

    #[error("{op} failed on {table} for key {key}: {reason}")]
    WriteFailed {
        table: String,
        op: WriteOp,
        key: String,
        reason: String,
    },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Failed to decode row of {table}: {reason}")]
    Decode { table: String, reason: String },

    #[error("Post-write callback failed for {identity}: {reason}")]
    CallbackFailed { identity: String, reason: String },

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },
}

/// Relational write operation, used for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    Replace,
    Delete,
    Count,
}

impl std::fmt::Display for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WriteOp::Insert => "INSERT",
            WriteOp::Update => "UPDATE",
            WriteOp::Replace => "REPLACE",
            WriteOp::Delete => "DELETE",
            WriteOp::Count => "COUNT",
        };
        f.write_str(name)
    }
}

/// Cache tier errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache transport {op} failed for {key}: {reason}")]
    Transport {
        op: &'static str,
        key: String,
        reason: String,
    },

    #[error("Cache value for {key} could not be encoded or decoded: {reason}")]
    Encoding { key: String, reason: String },

    /// The relational write already succeeded; only the cache is behind.
    #[error("Data committed but cache synchronisation failed (cache may be stale): {reason}")]
    PostWriteSync { reason: String },
}

/// Caller misuse of the manager API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("forceInsert and forceUpdate cannot both be set for {identity}")]
    ConflictingForceFlags { identity: String },

    #[error("{identity} is already reserved for the opposite operation ({staged})")]
    ReservedForOpposite {
        identity: String,
        staged: &'static str,
    },

    #[error("Manager is not writable: no transaction is open")]
    NotWritable,

    #[error("Unknown field {field} on {table}")]
    UnknownField { table: String, field: String },

    #[error("Empty key used for lookup on {table}")]
    EmptyKey { table: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} does not exist in store settings")]
    UnknownStore { name: String },

    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Custom column codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("{codec} codec rejected value: {reason}")]
    WrongShape { codec: &'static str, reason: String },
}

/// Master error type for all rowcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowcacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl RowcacheError {
    /// True when the relational write is durable and only a cache tier lags.
    pub fn is_stale_cache(&self) -> bool {
        matches!(self, RowcacheError::Cache(CacheError::PostWriteSync { .. }))
    }
}

/// Result type alias for rowcache operations.
pub type RowcacheResult<T> = Result<T, RowcacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_failed_display_names_operation() {
        let err = StorageError::WriteFailed {
            table: "dummy".to_string(),
            op: WriteOp::Insert,
            key: "1000#&#1000".to_string(),
            reason: "UNIQUE constraint failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("INSERT"));
        assert!(msg.contains("dummy"));
        assert!(msg.contains("1000#&#1000"));
    }

    #[test]
    fn test_reserved_for_opposite_display() {
        let err = UsageError::ReservedForOpposite {
            identity: "dummy:1".to_string(),
            staged: "delete",
        };
        let msg = err.to_string();
        assert!(msg.contains("already reserved for the opposite operation"));
        assert!(msg.contains("dummy:1"));
    }

    #[test]
    fn test_unknown_store_display() {
        let err = ConfigError::UnknownStore {
            name: "analytics".to_string(),
        };
        assert_eq!(err.to_string(), "analytics does not exist in store settings");
    }

    #[test]
    fn test_master_error_from_and_stale_flag() {
        let err: RowcacheError = CacheError::PostWriteSync {
            reason: "connection reset".to_string(),
        }
        .into();
        assert!(err.is_stale_cache());

        let err: RowcacheError = UsageError::NotWritable.into();
        assert!(!err.is_stale_cache());
        assert!(err.to_string().starts_with("Usage error"));
    }
}
