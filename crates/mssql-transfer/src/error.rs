//! Error types for the transfer library.

use thiserror::Error;

use crate::classify::ClassifiedError;

/// Process exit code for configuration problems.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Process exit code for connection and probe failures.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Process exit code for a failed transfer.
pub const EXIT_TRANSFER_ERROR: u8 = 3;
/// Process exit code for an unknown job id.
pub const EXIT_NOT_FOUND: u8 = 4;
/// Process exit code for a cancelled job.
pub const EXIT_CANCELLED: u8 = 5;
/// Process exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for transfer operations.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Malformed request or table spec. Raised before any I/O, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handshake, authentication or network failure while opening a connection.
    #[error("Connection error ({endpoint}): {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: tiberius::error::Error,
    },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Query failure reported by the server or the driver.
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Transient failure that survived the per-query retry budget.
    #[error("Transient query error after {attempts} attempts: {source}")]
    TransientQuery {
        attempts: u32,
        #[source]
        source: Box<TransferError>,
    },

    /// Unrecoverable error while reading or writing one chunk.
    #[error("Chunk {chunk} of table {table} failed: {source}")]
    Chunk {
        table: String,
        chunk: usize,
        #[source]
        source: Box<TransferError>,
    },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Table { table: String, message: String },

    /// The job as a whole failed.
    #[error("Job failed: {0}")]
    Job(String),

    /// Connectivity probe rejected a configuration.
    #[error("Probe failed for {endpoint}: {}", .error.message)]
    ProbeFailed {
        endpoint: String,
        error: Box<ClassifiedError>,
    },

    /// No status record exists for the requested job.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Status store error
    #[error("Status store error: {0}")]
    Status(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transfer was cancelled (SIGINT, cancel request)
    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        TransferError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Table error
    pub fn table(table: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Table {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Wrap an error as the failure of one chunk.
    pub fn chunk(table: impl Into<String>, chunk: usize, source: TransferError) -> Self {
        TransferError::Chunk {
            table: table.into(),
            chunk,
            source: Box::new(source),
        }
    }

    /// Short label naming the error family, used in classified output.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Config(_) => "ConfigError",
            TransferError::Connection { .. } => "ConnectionError",
            TransferError::Pool { .. } => "PoolError",
            TransferError::Database(_) => "DatabaseError",
            TransferError::TransientQuery { .. } => "TransientQueryError",
            TransferError::Chunk { .. } => "ChunkFailure",
            TransferError::Table { .. } => "TableFailure",
            TransferError::Job(_) => "JobFailure",
            TransferError::ProbeFailed { .. } => "ProbeFailed",
            TransferError::JobNotFound(_) => "JobNotFound",
            TransferError::Status(_) => "StatusError",
            TransferError::Io(_) => "IoError",
            TransferError::Yaml(_) => "YamlError",
            TransferError::Json(_) => "JsonError",
            TransferError::Cancelled => "Cancelled",
        }
    }

    /// Find the driver error at the root of this error, if any.
    pub fn driver_error(&self) -> Option<&tiberius::error::Error> {
        match self {
            TransferError::Connection { source, .. } => Some(source),
            TransferError::Database(e) => Some(e),
            TransferError::TransientQuery { source, .. } | TransferError::Chunk { source, .. } => {
                source.driver_error()
            }
            _ => None,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            TransferError::Config(_) | TransferError::Yaml(_) | TransferError::Json(_) => {
                EXIT_CONFIG_ERROR
            }
            TransferError::Connection { .. }
            | TransferError::Pool { .. }
            | TransferError::ProbeFailed { .. } => EXIT_CONNECTION_ERROR,
            TransferError::JobNotFound(_) => EXIT_NOT_FOUND,
            TransferError::Cancelled => EXIT_CANCELLED,
            TransferError::Io(_) => EXIT_IO_ERROR,
            _ => EXIT_TRANSFER_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        if let TransferError::ProbeFailed { error, .. } = self {
            if let Some(ref explanation) = error.explanation {
                output.push_str(&format!("\n  {}", explanation));
            }
            for suggestion in &error.suggestions {
                output.push_str(&format!("\n  - {}", suggestion));
            }
        }

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

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;
