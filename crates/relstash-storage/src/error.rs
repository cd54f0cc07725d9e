//! Storage error types for relstash-storage.
//!
//! [`StorageError`] covers all anticipated failure modes in the storage layer:
//! driver and migration failures, integrity violations (an expected
//! single-row write touching some other number of rows), missing tables when
//! schema creation is disabled, and stored type names that no longer resolve.

use relstash_core::CoreError;
use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The SQLite driver reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying the bookkeeping migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The object model rejected an operation (unknown class, object that
    /// cannot be constructed, wrong node kind, ...).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A configuration value could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A data integrity violation was detected.
    #[error("integrity error: {reason}")]
    IntegrityError { reason: String },

    /// A write that must touch exactly `expected` rows touched `actual`.
    #[error("update count mismatch in {table} for id {id}: expected {expected}, got {actual}")]
    UpdateCount {
        table: String,
        id: i64,
        expected: usize,
        actual: usize,
    },

    /// A table is missing and the session may not create it.
    #[error("table {table} does not exist and schema creation is disabled")]
    SchemaPermission { table: String },

    /// A class, enum, or type name read from storage cannot be resolved.
    #[error("cannot resolve stored type name: {name}")]
    TypeResolution { name: String },

    /// The requested object is not stored or not known to the session.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A value does not fit the declared type of its column.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

impl StorageError {
    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        StorageError::IntegrityError {
            reason: reason.into(),
        }
    }
}
