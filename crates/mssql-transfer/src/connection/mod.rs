//! Pooled SQL Server connections.
//!
//! [`ConnectionFactory`] owns one bb8 pool for one side of a job. All reads
//! and writes go through the [`SqlExecutor`] trait so the reader and writer
//! can be exercised against a scripted executor in tests.

mod convert;
mod manager;
mod retry;

#[cfg(test)]
pub(crate) mod scripted;

pub use convert::{column_to_value, row_to_values, to_sql_param, value_to_text};
pub use manager::{MssqlClient, TiberiusConnectionManager, SESSION_SETTINGS};
pub use retry::RetryPolicy;

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection, RunError};
use serde::{Deserialize, Serialize};
use tiberius::ToSql;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::classify::{classify, ClassifiedError, Diagnosis};
use crate::config::{DatabaseConfig, EngineOptions};
use crate::core::SqlValue;
use crate::error::{Result, TransferError};
use crate::query::Statement;

/// Smallest and largest pool size per side.
pub const POOL_SIZE_RANGE: (u32, u32) = (2, 5);

/// Low-level query surface used by the reader and writer.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// `host:port` of the server behind this executor.
    fn endpoint(&self) -> String;

    /// Round trip a trivial query.
    async fn ping(&self) -> Result<()>;

    /// First column of the first row as an integer, if any row came back.
    async fn query_scalar(&self, sql: &str) -> Result<Option<i64>>;

    /// Column names of a query's first result set.
    async fn query_column_names(&self, sql: &str) -> Result<Vec<String>>;

    /// First column of every row, as text. NULLs are skipped.
    async fn query_strings(&self, statement: &Statement) -> Result<Vec<String>>;

    /// All rows of a query's first result set.
    async fn query_rows(&self, statement: &Statement) -> Result<Vec<Vec<SqlValue>>>;

    /// Run one statement and return the affected row count.
    async fn execute(&self, statement: &Statement) -> Result<u64>;

    /// Run statements inside `BEGIN/COMMIT TRANSACTION`, rolling back on
    /// any failure. Returns the summed affected row count.
    async fn execute_in_transaction(&self, statements: &[Statement]) -> Result<u64>;

    /// Release pooled connections.
    async fn close(&self);
}

/// Outcome of a connectivity probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub success: bool,
    /// `host:port`.
    pub server: String,
    pub database: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<ClassifiedError>,
}

impl ProbeResult {
    pub fn ok(config: &DatabaseConfig) -> Self {
        Self {
            success: true,
            server: config.endpoint(),
            database: config.database.clone(),
            message: "Connection successful".to_string(),
            diagnosis: None,
        }
    }

    pub fn failed(config: &DatabaseConfig, err: &TransferError) -> Self {
        let classified = classify(err);
        Self {
            success: false,
            server: config.endpoint(),
            database: config.database.clone(),
            message: classified.message.clone(),
            diagnosis: Some(classified),
        }
    }

    /// Turn a failed probe into [`TransferError::ProbeFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        let error = self
            .diagnosis
            .unwrap_or_else(|| ClassifiedError::plain("ConnectionError", self.message.clone()));
        Err(TransferError::ProbeFailed {
            endpoint: self.server,
            error: Box::new(error),
        })
    }
}

/// Bounded acquisition retry: linear backoff, no retry on rejected logins.
#[derive(Debug, Clone, Copy)]
struct AcquirePolicy {
    attempts: u32,
    backoff: Duration,
}

/// A pooled handle to one database.
pub struct ConnectionFactory {
    config: DatabaseConfig,
    pool: RwLock<Option<Pool<TiberiusConnectionManager>>>,
    acquire: AcquirePolicy,
    retry: RetryPolicy,
}

impl ConnectionFactory {
    /// Build the pool and validate one connection.
    pub async fn open(config: &DatabaseConfig, engine: &EngineOptions) -> Result<Self> {
        let (min, max) = POOL_SIZE_RANGE;
        let max_size = engine.pool_max.clamp(min, max);
        let min_idle = engine.pool_min.clamp(1, max_size);

        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(min_idle))
            .connection_timeout(Duration::from_secs(engine.acquire_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(engine.idle_timeout_secs)))
            .max_lifetime(Some(Duration::from_secs(engine.recycle_secs)))
            .test_on_check_out(true)
            .build_unchecked(manager);

        let factory = Self {
            config: config.clone(),
            pool: RwLock::new(Some(pool)),
            acquire: AcquirePolicy {
                attempts: engine.connect_retries.max(1),
                backoff: Duration::from_millis(engine.connect_backoff_ms),
            },
            retry: RetryPolicy::new(
                engine.query_retry_attempts,
                Duration::from_millis(engine.query_retry_backoff_ms),
            ),
        };

        // Surface handshake and login failures here rather than mid-transfer.
        {
            let mut conn = factory.acquire().await?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!(
            "Connected to MSSQL: {}/{} (pool_size={})",
            config.endpoint(),
            config.database,
            max_size
        );

        Ok(factory)
    }

    /// Probe a database with a dedicated connection. Never returns an error;
    /// failures are reported through the classified diagnosis.
    pub async fn probe(config: &DatabaseConfig) -> ProbeResult {
        match Self::probe_inner(config).await {
            Ok(()) => {
                debug!("Probe of {} succeeded", config.endpoint());
                ProbeResult::ok(config)
            }
            Err(e) => {
                warn!("Probe of {} failed: {}", config.endpoint(), e);
                ProbeResult::failed(config, &e)
            }
        }
    }

    async fn probe_inner(config: &DatabaseConfig) -> Result<()> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let mut client = manager
            .open()
            .await
            .map_err(|source| TransferError::Connection {
                endpoint: config.endpoint(),
                source,
            })?;
        client
            .simple_query("BEGIN TRANSACTION; SELECT 1; COMMIT TRANSACTION;")
            .await?
            .into_results()
            .await?;
        Ok(())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    async fn pool(&self) -> Result<Pool<TiberiusConnectionManager>> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| TransferError::pool("pool is closed", self.config.endpoint()))
    }

    /// Check out a connection, retrying handshake failures with linear backoff.
    async fn acquire(&self) -> Result<PooledConnection<'static, TiberiusConnectionManager>> {
        let pool = self.pool().await?;
        let mut attempt = 1;
        loop {
            let err = match pool.get_owned().await {
                Ok(conn) => return Ok(conn),
                Err(RunError::User(source)) => TransferError::Connection {
                    endpoint: self.config.endpoint(),
                    source,
                },
                Err(RunError::TimedOut) => TransferError::pool(
                    "timed out waiting for a connection",
                    format!("acquiring connection to {}", self.config.endpoint()),
                ),
            };

            let diagnosis = classify(&err).diagnosis;
            let rejected = matches!(
                diagnosis,
                Diagnosis::AuthenticationFailed | Diagnosis::LoginFailed
            );
            if rejected || attempt >= self.acquire.attempts {
                return Err(err);
            }
            warn!(
                "Connection attempt {}/{} to {} failed: {}",
                attempt,
                self.acquire.attempts,
                self.config.endpoint(),
                err
            );
            tokio::time::sleep(self.acquire.backoff * attempt).await;
            attempt += 1;
        }
    }
}

fn bind(params: &[SqlValue]) -> Vec<Box<dyn ToSql>> {
    params.iter().map(to_sql_param).collect()
}

async fn execute_statement(conn: &mut MssqlClient, statement: &Statement) -> Result<u64> {
    let params = bind(&statement.params);
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let result = conn.execute(statement.sql.as_str(), &param_refs).await?;
    Ok(result.total())
}

async fn rollback(conn: &mut MssqlClient) {
    let outcome = match conn
        .simple_query("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION")
        .await
    {
        Ok(stream) => stream.into_results().await.map(|_| ()),
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        warn!("Rollback failed: {}", e);
    }
}

/// BEGIN/COMMIT go through `simple_query`; sending them through `execute`
/// wraps them in sp_executesql and the server rejects the unbalanced
/// transaction count (error 266).
async fn run_transaction(conn: &mut MssqlClient, statements: &[Statement]) -> Result<u64> {
    conn.simple_query("BEGIN TRANSACTION")
        .await?
        .into_results()
        .await?;

    let mut affected = 0;
    for statement in statements {
        match execute_statement(conn, statement).await {
            Ok(n) => affected += n,
            Err(e) => {
                rollback(conn).await;
                return Err(e);
            }
        }
    }

    let commit = match conn.simple_query("COMMIT TRANSACTION").await {
        Ok(stream) => stream.into_results().await.map(|_| ()),
        Err(e) => Err(e),
    };
    if let Err(e) = commit {
        rollback(conn).await;
        return Err(e.into());
    }
    Ok(affected)
}

#[async_trait]
impl SqlExecutor for ConnectionFactory {
    fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    async fn ping(&self) -> Result<()> {
        self.retry
            .run("ping", move || async move {
                let mut conn = self.acquire().await?;
                conn.simple_query("SELECT 1").await?.into_row().await?;
                Ok(())
            })
            .await
    }

    async fn query_scalar(&self, sql: &str) -> Result<Option<i64>> {
        self.retry
            .run("scalar query", move || async move {
                let mut conn = self.acquire().await?;
                let row = conn.simple_query(sql).await?.into_row().await?;
                match row {
                    Some(row) => Ok(row.try_get::<i64, _>(0)?),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn query_column_names(&self, sql: &str) -> Result<Vec<String>> {
        self.retry
            .run("column probe", move || async move {
                let mut conn = self.acquire().await?;
                let mut stream = conn.simple_query(sql).await?;
                let names = stream
                    .columns()
                    .await?
                    .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
                    .unwrap_or_default();
                stream.into_results().await?;
                Ok(names)
            })
            .await
    }

    async fn query_strings(&self, statement: &Statement) -> Result<Vec<String>> {
        self.retry
            .run("lookup query", move || async move {
                let mut conn = self.acquire().await?;
                let params = bind(&statement.params);
                let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
                let rows = conn
                    .query(statement.sql.as_str(), &param_refs)
                    .await?
                    .into_first_result()
                    .await?;
                let mut values = Vec::with_capacity(rows.len());
                for row in &rows {
                    if let Some(value) = row.try_get::<&str, _>(0)? {
                        values.push(value.to_string());
                    }
                }
                Ok(values)
            })
            .await
    }

    async fn query_rows(&self, statement: &Statement) -> Result<Vec<Vec<SqlValue>>> {
        self.retry
            .run("row read", move || async move {
                let mut conn = self.acquire().await?;
                let params = bind(&statement.params);
                let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
                let rows = conn
                    .query(statement.sql.as_str(), &param_refs)
                    .await?
                    .into_first_result()
                    .await?;
                rows.into_iter().map(row_to_values).collect()
            })
            .await
    }

    async fn execute(&self, statement: &Statement) -> Result<u64> {
        self.retry
            .run("statement", move || async move {
                let mut conn = self.acquire().await?;
                execute_statement(&mut conn, statement).await
            })
            .await
    }

    async fn execute_in_transaction(&self, statements: &[Statement]) -> Result<u64> {
        self.retry
            .run("write transaction", move || async move {
                let mut conn = self.acquire().await?;
                run_transaction(&mut conn, statements).await
            })
            .await
    }

    async fn close(&self) {
        if self.pool.write().await.take().is_some() {
            debug!("Closed pool for {}", self.config.endpoint());
        }
    }
}
