//! MSSQL database-backed job status storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

use super::{JobStatusRecord, StatusStore};
use crate::connection::SqlExecutor;
use crate::core::{quote_mssql, SqlNullType, SqlValue};
use crate::error::{Result, TransferError};
use crate::query::Statement;
use crate::stats::JobStatus;

/// Default schema holding the `job_status` table.
pub const DEFAULT_STATUS_SCHEMA: &str = "_mssql_transfer";

/// Stores one row per job in `[<schema>].[job_status]`.
pub struct MssqlStatusStore {
    executor: Arc<dyn SqlExecutor>,
    schema: String,
}

impl MssqlStatusStore {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self {
            executor,
            schema: DEFAULT_STATUS_SCHEMA.to_string(),
        }
    }

    /// Use a different schema. The name must be a valid identifier.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        quote_mssql(&schema)?;
        self.schema = schema;
        Ok(self)
    }

    fn table(&self) -> String {
        format!("[{}].[job_status]", self.schema.replace(']', "]]"))
    }

    fn init_statements(&self) -> Vec<String> {
        let schema_literal = self.schema.replace('\'', "''");
        vec![
            format!(
                "IF NOT EXISTS (SELECT * FROM sys.schemas WHERE name = '{0}')
                 BEGIN
                     EXEC('CREATE SCHEMA [{0}]')
                 END",
                schema_literal
            ),
            format!(
                "IF NOT EXISTS (SELECT * FROM sys.tables WHERE name = 'job_status' AND schema_id = SCHEMA_ID('{}'))
                 BEGIN
                     CREATE TABLE {} (
                         job_id NVARCHAR(100) NOT NULL PRIMARY KEY,
                         status NVARCHAR(20) NOT NULL CHECK (status IN ('PENDING', 'STARTED', 'PROGRESS', 'SUCCESS', 'FAILURE')),
                         progress FLOAT NOT NULL DEFAULT 0,
                         config_hash NVARCHAR(100) NOT NULL,
                         request NVARCHAR(MAX),
                         stats NVARCHAR(MAX) NOT NULL,
                         error NVARCHAR(MAX),
                         created_at DATETIME2 NOT NULL,
                         updated_at DATETIME2 NOT NULL DEFAULT GETUTCDATE()
                     )
                 END",
                schema_literal,
                self.table()
            ),
        ]
    }

    fn save_statement(&self, record: &JobStatusRecord) -> Result<Statement> {
        let request = match record.request {
            Some(ref request) => SqlValue::Text(serde_json::to_string(request)?),
            None => SqlValue::Null(SqlNullType::String),
        };
        let error = match record.error {
            Some(ref e) => SqlValue::Text(e.clone()),
            None => SqlValue::Null(SqlNullType::String),
        };

        // Single MERGE keyed on job_id; atomic without an explicit transaction.
        let sql = format!(
            "MERGE {} AS target
             USING (SELECT @P1 AS job_id) AS source
             ON target.job_id = source.job_id
             WHEN MATCHED THEN
                 UPDATE SET
                     status = @P2,
                     progress = @P3,
                     config_hash = @P4,
                     request = @P5,
                     stats = @P6,
                     error = @P7,
                     updated_at = @P9
             WHEN NOT MATCHED THEN
                 INSERT (job_id, status, progress, config_hash, request, stats, error, created_at, updated_at)
                 VALUES (@P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8, @P9);",
            self.table()
        );

        Ok(Statement {
            sql,
            params: vec![
                SqlValue::Text(record.job_id.clone()),
                SqlValue::Text(record.status.as_str().to_string()),
                SqlValue::F64(record.progress),
                SqlValue::Text(record.config_hash.clone()),
                request,
                SqlValue::Text(serde_json::to_string(&record.stats)?),
                error,
                SqlValue::DateTime(record.created_at.naive_utc()),
                SqlValue::DateTime(record.updated_at.naive_utc()),
            ],
        })
    }

    fn load_statement(&self, job_id: &str) -> Statement {
        Statement {
            sql: format!(
                "SELECT job_id, status, progress, config_hash, request, stats, error, created_at, updated_at
                 FROM {} WHERE job_id = @P1",
                self.table()
            ),
            params: vec![SqlValue::Text(job_id.to_string())],
        }
    }
}

fn text(row: &[SqlValue], idx: usize, column: &str) -> Result<Option<String>> {
    match row.get(idx) {
        Some(SqlValue::Text(s)) => Ok(Some(s.clone())),
        Some(SqlValue::Null(_)) => Ok(None),
        _ => Err(TransferError::Status(format!(
            "job_status.{} has an unexpected type",
            column
        ))),
    }
}

fn required_text(row: &[SqlValue], idx: usize, column: &str) -> Result<String> {
    text(row, idx, column)?
        .ok_or_else(|| TransferError::Status(format!("job_status.{} is NULL", column)))
}

fn timestamp(row: &[SqlValue], idx: usize, column: &str) -> Result<DateTime<Utc>> {
    match row.get(idx) {
        Some(SqlValue::DateTime(dt)) => Ok(utc(*dt)),
        _ => Err(TransferError::Status(format!(
            "job_status.{} is not a timestamp",
            column
        ))),
    }
}

fn utc(naive: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

fn record_from_row(row: &[SqlValue]) -> Result<JobStatusRecord> {
    let status_text = required_text(row, 1, "status")?;
    let status = JobStatus::parse(&status_text)
        .ok_or_else(|| TransferError::Status(format!("Invalid job status: {}", status_text)))?;
    let progress = match row.get(2) {
        Some(SqlValue::F64(p)) => *p,
        Some(SqlValue::F32(p)) => *p as f64,
        _ => 0.0,
    };
    let request = match text(row, 4, "request")? {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    Ok(JobStatusRecord {
        job_id: required_text(row, 0, "job_id")?,
        status,
        progress,
        request,
        config_hash: required_text(row, 3, "config_hash")?,
        stats: serde_json::from_str(&required_text(row, 5, "stats")?)?,
        error: text(row, 6, "error")?,
        created_at: timestamp(row, 7, "created_at")?,
        updated_at: timestamp(row, 8, "updated_at")?,
    })
}

#[async_trait]
impl StatusStore for MssqlStatusStore {
    async fn init(&self) -> Result<()> {
        for sql in self.init_statements() {
            self.executor.execute(&Statement::raw(sql)).await?;
        }
        Ok(())
    }

    async fn save(&self, record: &JobStatusRecord) -> Result<()> {
        let statement = self.save_statement(record)?;
        self.executor.execute(&statement).await?;
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<JobStatusRecord>> {
        let rows = self.executor.query_rows(&self.load_statement(job_id)).await?;
        match rows.first() {
            Some(row) => Ok(Some(record_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "mssql"
    }
}
