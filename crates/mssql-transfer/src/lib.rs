//! # mssql-transfer
//!
//! Chunked table-to-table bulk transfer between SQL Server databases.
//!
//! A job copies one or more tables from a source database to a target
//! database:
//!
//! - **Chunked reads** using `OFFSET ... FETCH NEXT` windows over a stable order
//! - **Atomic chunk writes**, one transaction per chunk
//! - **Write modes**: append, truncate-then-insert, and keyed upsert via `MERGE`
//! - **Failure policy**: abort on first failure, or skip failed chunks and tables
//! - **Job status** persisted to memory, JSON files or an MSSQL table
//! - **Error diagnosis** mapping driver failures to remediation hints
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mssql_transfer::{
//!     FileStatusStore, MssqlConnector, ServiceSettings, TransferRequest, TransferService,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mssql_transfer::Result<()> {
//!     let request = TransferRequest::load("transfer.yaml")?;
//!     let service = TransferService::new(
//!         Arc::new(MssqlConnector),
//!         Arc::new(FileStatusStore::new(".transfer-status")),
//!         ServiceSettings::default(),
//!     );
//!     let record = service.run(request, CancellationToken::new()).await?;
//!     println!("{}: {} rows", record.status, record.stats.transferred_rows);
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod orchestrator;
pub mod query;
pub mod reader;
pub mod service;
pub mod stats;
pub mod status;
pub mod writer;

// Re-exports for convenient access
pub use classify::{classify, ClassifiedError, Diagnosis, ErrorResponse};
pub use config::{DatabaseConfig, EngineOptions, TableTransferSpec, TransferRequest, WriteMode};
pub use connection::{ConnectionFactory, ProbeResult, SqlExecutor};
pub use core::{Chunk, SqlValue};
pub use error::{Result, TransferError};
pub use orchestrator::TransferOrchestrator;
pub use query::{build_insert_or_upsert, build_select, WritePlan};
pub use reader::{ChunkedReader, RowSource};
pub use service::{Connector, MssqlConnector, ServiceSettings, SubmitReceipt, TransferService};
pub use stats::{JobStats, JobStatus, ProgressEvent, TableStatus};
pub use status::{
    FileStatusStore, JobStatusRecord, MemoryStatusStore, MssqlStatusStore, StatusStore, StatusView,
};
pub use writer::{ChunkWriter, RowSink};
