//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder written wherever a password would otherwise be shown.
pub const REDACTED: &str = "[REDACTED]";

/// Connection settings for one side of a transfer.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Database host (alias: `server`).
    #[serde(alias = "server")]
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username (alias: `username`).
    #[serde(alias = "username")]
    pub user: String,

    /// Password.
    pub password: String,

    /// Driver options.
    #[serde(default)]
    pub options: DriverOptions,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &REDACTED)
            .field("options", &self.options)
            .finish()
    }
}

impl DatabaseConfig {
    /// `host:port`, as echoed in probe results and logs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Copy of this config with the password replaced.
    pub fn redacted(&self) -> Self {
        Self {
            password: REDACTED.to_string(),
            ..self.clone()
        }
    }
}

/// Driver-level connection options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverOptions {
    /// Require TLS (default: false).
    #[serde(default)]
    pub encrypt: bool,

    /// Trust the server certificate without validation (default: true).
    #[serde(default = "default_true")]
    pub trust_server_cert: bool,

    /// TCP connect and login timeout in seconds (default: 60).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Application name reported to the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,

    /// Named instance (resolved through the server's browser service).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            encrypt: false,
            trust_server_cert: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            application_name: None,
            instance_name: None,
        }
    }
}

/// How rows land in the target table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Insert every row.
    #[default]
    Append,
    /// Remove all target rows once, then insert.
    Truncate,
    /// Merge on the upsert key: update on match, insert otherwise.
    Upsert,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Append => "append",
            WriteMode::Truncate => "truncate",
            WriteMode::Upsert => "upsert",
        }
    }
}

/// Per-table transfer specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableTransferSpec {
    /// Source table, optionally schema-qualified (`dbo.PARTS`).
    pub source_table: String,

    /// Target table (default: same as source).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,

    /// Maximum number of source rows to move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<u64>,

    /// Row filter, the body of a WHERE clause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,

    /// Explicit projection (default: all columns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_columns: Option<Vec<String>>,

    /// Source column -> target column renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_mapping: Option<BTreeMap<String, String>>,

    /// Ordering, `column [ASC|DESC]` terms separated by commas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,

    #[serde(default)]
    pub write_mode: WriteMode,

    /// Key column for upsert mode, named as in the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsert_key: Option<String>,
}

impl TableTransferSpec {
    /// Plain append of every row of `source_table` into a same-named table.
    pub fn new(source_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: None,
            row_limit: None,
            where_clause: None,
            selected_columns: None,
            column_mapping: None,
            order_by: None,
            write_mode: WriteMode::Append,
            upsert_key: None,
        }
    }

    /// Target table name, defaulting to the source name.
    pub fn target_name(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.source_table)
    }

    /// Target column name for a source column.
    pub fn mapped_column<'a>(&'a self, source_column: &'a str) -> &'a str {
        self.column_mapping
            .as_ref()
            .and_then(|m| {
                m.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(source_column))
                    .map(|(_, v)| v.as_str())
            })
            .unwrap_or(source_column)
    }
}

/// Engine tuning knobs. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineOptions {
    /// Minimum idle connections per side (default: 2).
    #[serde(default = "default_pool_min")]
    pub pool_min: u32,

    /// Maximum connections per side (default: 5).
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,

    /// Physical connection lifetime before recycling (default: 1800s).
    #[serde(default = "default_recycle_secs")]
    pub recycle_secs: u64,

    /// Idle connection timeout (default: 600s).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Wait for a pooled connection (default: 120s).
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Attempts to acquire the first connection (default: 3).
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Base backoff between acquisition attempts (default: 500ms, linear).
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    /// Attempts per query for transient failures (default: 3).
    #[serde(default = "default_query_retry_attempts")]
    pub query_retry_attempts: u32,

    /// Fixed backoff between query attempts (default: 2000ms).
    #[serde(default = "default_query_retry_backoff_ms")]
    pub query_retry_backoff_ms: u64,

    /// Minimum spacing of persisted PROGRESS updates (default: 2000ms).
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            recycle_secs: default_recycle_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            connect_retries: default_connect_retries(),
            connect_backoff_ms: default_connect_backoff_ms(),
            query_retry_attempts: default_query_retry_attempts(),
            query_retry_backoff_ms: default_query_retry_backoff_ms(),
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

/// A transfer job description as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRequest {
    pub source: DatabaseConfig,
    pub target: DatabaseConfig,

    /// Tables in processing order.
    pub tables: Vec<TableTransferSpec>,

    /// Rows per chunk (default: 1000, minimum 100).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Tables transferred concurrently (default: 1).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Record chunk/table failures as warnings and keep going (default: false).
    #[serde(default)]
    pub skip_errors: bool,

    #[serde(default)]
    pub engine: EngineOptions,
}

impl TransferRequest {
    pub fn new(
        source: DatabaseConfig,
        target: DatabaseConfig,
        tables: Vec<TableTransferSpec>,
    ) -> Self {
        Self {
            source,
            target,
            tables,
            chunk_size: default_chunk_size(),
            max_workers: default_max_workers(),
            skip_errors: false,
            engine: EngineOptions::default(),
        }
    }

    /// Copy of the request with both passwords replaced, for persistence.
    pub fn redacted(&self) -> Self {
        Self {
            source: self.source.redacted(),
            target: self.target.redacted(),
            ..self.clone()
        }
    }
}

// Default value functions
fn default_mssql_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    1000
}

fn default_max_workers() -> usize {
    1
}

fn default_pool_min() -> u32 {
    2
}

fn default_pool_max() -> u32 {
    5
}

fn default_recycle_secs() -> u64 {
    1800
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_acquire_timeout_secs() -> u64 {
    120
}

fn default_connect_retries() -> u32 {
    3
}

fn default_connect_backoff_ms() -> u64 {
    500
}

fn default_query_retry_attempts() -> u32 {
    3
}

fn default_query_retry_backoff_ms() -> u64 {
    2000
}

fn default_status_interval_ms() -> u64 {
    2000
}
