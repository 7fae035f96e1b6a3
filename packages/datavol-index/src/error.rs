//! Error types for datavol-index

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient connectivity or quota failure, retry with backoff
    BackendUnavailable,
    /// Backend rejected a query (non-transient)
    Database,
    /// Metadata key reused with another type, or staging/committed schemas diverged
    SchemaConflict,
    /// Metadata value type has no column mapping
    MetadataTypeNotSupported,
    /// Promote succeeded but a later commit step failed; staging is retained
    PartialCommitFailure,
    /// Caller supplied an invalid entry, record or identifier
    Validation,
    /// Serialization/deserialization errors
    Serialization,
    /// Transaction scope errors
    Transaction,
    /// Configuration errors
    Config,
    /// Missing table or object
    NotFound,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::Database => "database",
            ErrorKind::SchemaConflict => "schema_conflict",
            ErrorKind::MetadataTypeNotSupported => "metadata_type_not_supported",
            ErrorKind::PartialCommitFailure => "partial_commit_failure",
            ErrorKind::Validation => "validation",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Config => "config",
            ErrorKind::NotFound => "not_found",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Whether the caller may retry the failed operation as a whole.
    ///
    /// A partial commit is retryable because the next commit re-derives the
    /// same anti-join delta from the retained staging rows.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::BackendUnavailable | ErrorKind::PartialCommitFailure
        )
    }

    // Convenience constructors
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendUnavailable, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn schema_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SchemaConflict, message)
    }

    pub fn metadata_type_not_supported(key: &str, type_name: &str) -> Self {
        Self::new(
            ErrorKind::MetadataTypeNotSupported,
            format!("Metadata key '{}' has unsupported type {}", key, type_name),
        )
    }

    pub fn partial_commit(step: &str, cause: StorageError) -> Self {
        Self::new(
            ErrorKind::PartialCommitFailure,
            format!("Commit failed after promote, during {}: {}", step, cause),
        )
        .with_source(cause)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("Table not found: {}", table.into()),
        )
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let transient = matches!(
            err.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen)
        );
        let message = format!("SQLite error: {}", err);
        if transient {
            StorageError::backend_unavailable(message).with_source(err)
        } else {
            StorageError::database(message).with_source(err)
        }
    }
}

// PostgreSQL error conversions
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let transient = matches!(
            err,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
        );
        let message = format!("PostgreSQL error: {}", err);
        if transient {
            StorageError::backend_unavailable(message).with_source(err)
        } else {
            StorageError::database(message).with_source(err)
        }
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("IO error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
