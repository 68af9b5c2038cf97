//! Error types for the row merge library.

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Main error type for staging, merge and pipeline operations.
#[derive(Error, Debug)]
pub enum RowMergeError {
    /// Configuration error (invalid file, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or protocol error without statement context
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// A statement was rejected by the server
    #[error("Query failed: {message}\n  Statement: {statement}")]
    Query {
        message: String,
        statement: String,
        code: Option<String>,
    },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Column names, column types and value rows disagree in length
    #[error("Arity mismatch in {context}: expected {expected} values, got {actual}")]
    ArityMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A join or target column does not exist on the table
    #[error("Unknown column(s) on {table}: {}", columns.join(", "))]
    UnknownColumn { table: String, columns: Vec<String> },

    /// The named table does not exist
    #[error("Table {0} does not exist")]
    NoSuchTable(String),

    /// The named table already exists
    #[error("Table {0} already exists")]
    TableExists(String),

    /// No usable row transform was supplied
    #[error("Invalid transform: {0}")]
    InvalidTransform(String),

    /// Batch size of zero
    #[error("Invalid batch size {0}: must be non-zero (negative selects the whole table)")]
    InvalidBatchSize(i64),

    /// A value cannot be rendered as a literal of its declared column type
    #[error("Cannot render value for column {column}: {message}")]
    InvalidLiteral { column: String, message: String },

    /// The staging table is left over from an earlier run
    #[error("Staging table {table} could not be created: {message}")]
    StagingConflict { table: String, message: String },

    /// The merge UPDATE failed
    #[error("Merge into {table} failed: {message}")]
    MergeFailure { table: String, message: String },

    /// The caller's row transform failed
    #[error("Row transform failed: {0}")]
    Transform(String),

    /// Invalid argument that is not covered by a more specific variant
    #[error("Validation failed: {0}")]
    Validation(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RowMergeError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        RowMergeError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Wrap a driver error together with the statement that caused it.
    pub fn query(err: &tokio_postgres::Error, statement: impl Into<String>) -> Self {
        let (message, code) = match err.as_db_error() {
            Some(db) => (db.message().to_string(), Some(db.code().code().to_string())),
            None => (err.to_string(), err.code().map(|c| c.code().to_string())),
        };
        RowMergeError::Query {
            message,
            statement: statement.into(),
            code,
        }
    }

    /// Create a Transform error, used by row transforms to reject a row.
    pub fn transform(message: impl Into<String>) -> Self {
        RowMergeError::Transform(message.into())
    }

    /// Create an InvalidLiteral error
    pub fn literal(column: impl Into<String>, message: impl Into<String>) -> Self {
        RowMergeError::InvalidLiteral {
            column: column.into(),
            message: message.into(),
        }
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            RowMergeError::Query { code, .. } => code.as_deref(),
            RowMergeError::Database(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }

    /// True when the server rejected a CREATE because the relation exists.
    pub fn is_duplicate_table(&self) -> bool {
        self.sql_state() == Some(SqlState::DUPLICATE_TABLE.code())
    }

    /// Validation errors are raised before any row I/O happens.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RowMergeError::ArityMismatch { .. }
                | RowMergeError::UnknownColumn { .. }
                | RowMergeError::InvalidTransform(_)
                | RowMergeError::InvalidBatchSize(_)
                | RowMergeError::Validation(_)
                | RowMergeError::NoSuchTable(_)
                | RowMergeError::TableExists(_)
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            RowMergeError::Config(_) | RowMergeError::Yaml(_) => 2,
            e if e.is_validation() => 3,
            RowMergeError::Database(_)
            | RowMergeError::Query { .. }
            | RowMergeError::Pool { .. }
            | RowMergeError::StagingConflict { .. }
            | RowMergeError::MergeFailure { .. } => 4,
            _ => 1,
        }
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

/// Result type alias for row merge operations.
pub type Result<T> = std::result::Result<T, RowMergeError>;
