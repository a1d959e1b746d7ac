//! Error types for the bulk import/export library.
//!
//! Every error carries an [`ErrorKind`] tag. Connectivity and capacity errors
//! are fatal for a run; conversion and reference errors are counted and the
//! run continues.

use thiserror::Error;

/// Classification of a [`BulkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Backend unreachable or connection lost.
    Connectivity,
    /// A single record could not be mapped to backend rows.
    Conversion,
    /// A pending reference never resolved.
    Reference,
    /// Queue or pool exhaustion beyond the configured timeout.
    Capacity,
    /// Invalid configuration.
    Config,
    /// The run or statement was cancelled.
    Cancelled,
    /// Local file I/O or serialization.
    Io,
}

impl ErrorKind {
    /// Fatal kinds abort the run and shut down the worker pool.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Connectivity | ErrorKind::Capacity | ErrorKind::Config | ErrorKind::Io
        )
    }
}

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum BulkError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection could not be established or was lost
    #[error("Connectivity error: {message}\n  Context: {context}")]
    Connectivity { message: String, context: String },

    /// Pool or queue exhausted beyond its timeout
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// Record could not be converted into backend rows
    #[error("Conversion failed for record {record}: {message}")]
    Conversion { record: String, message: String },

    /// Reference could not be resolved
    #[error("Unresolvable reference to '{target}' from {origin}")]
    Reference { origin: String, target: String },

    /// Worker or blocking task panicked
    #[error("Task failed: {0}")]
    Task(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (user request or statement interrupt)
    #[error("Operation cancelled")]
    Cancelled,
}

impl BulkError {
    /// Create a connectivity error with context about where it occurred
    pub fn connectivity(message: impl Into<String>, context: impl Into<String>) -> Self {
        BulkError::Connectivity {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a conversion error for one record
    pub fn conversion(record: impl Into<String>, message: impl Into<String>) -> Self {
        BulkError::Conversion {
            record: record.into(),
            message: message.into(),
        }
    }

    /// Create a reference error
    pub fn reference(origin: impl Into<String>, target: impl Into<String>) -> Self {
        BulkError::Reference {
            origin: origin.into(),
            target: target.into(),
        }
    }

    /// Create a capacity error
    pub fn capacity(message: impl Into<String>) -> Self {
        BulkError::Capacity(message.into())
    }

    /// Classify this error according to the pipeline's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BulkError::Config(_) => ErrorKind::Config,
            BulkError::Postgres(e) => postgres_error_kind(e),
            BulkError::Sqlite(e) => sqlite_error_kind(e),
            BulkError::Connectivity { .. } => ErrorKind::Connectivity,
            BulkError::Capacity(_) => ErrorKind::Capacity,
            BulkError::Conversion { .. } => ErrorKind::Conversion,
            BulkError::Reference { .. } => ErrorKind::Reference,
            BulkError::Task(_) => ErrorKind::Connectivity,
            BulkError::Io(_) | BulkError::Yaml(_) | BulkError::Json(_) => ErrorKind::Io,
            BulkError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this error must abort the run.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Statement-level PostgreSQL failures are per-record problems; a closed
/// client or a cancelled query is not.
fn postgres_error_kind(e: &tokio_postgres::Error) -> ErrorKind {
    if e.is_closed() {
        return ErrorKind::Connectivity;
    }
    match e.code() {
        Some(code) if *code == tokio_postgres::error::SqlState::QUERY_CANCELED => {
            ErrorKind::Cancelled
        }
        Some(code) if code.code().starts_with("08") => ErrorKind::Connectivity,
        Some(_) => ErrorKind::Conversion,
        None => ErrorKind::Connectivity,
    }
}

fn sqlite_error_kind(e: &rusqlite::Error) -> ErrorKind {
    use rusqlite::ErrorCode;

    match e.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => ErrorKind::Cancelled,
        Some(ErrorCode::CannotOpen)
        | Some(ErrorCode::NotADatabase)
        | Some(ErrorCode::SystemIoFailure)
        | Some(ErrorCode::DiskFull) => ErrorKind::Connectivity,
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => ErrorKind::Capacity,
        _ => ErrorKind::Conversion,
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, BulkError>;
