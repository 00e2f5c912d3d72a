//! Target side of a table transfer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::TableTransferSpec;
use crate::connection::SqlExecutor;
use crate::core::Chunk;
use crate::error::Result;
use crate::query::{build_truncate, Statement, WritePlan};

/// Applies chunks to the target database.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Verify the target is reachable.
    async fn probe(&self) -> Result<()>;

    /// Remove every row from the spec's target table.
    async fn clear_table(&self, spec: &TableTransferSpec) -> Result<()>;

    /// Apply one chunk atomically and return the rows written.
    async fn write_chunk(&self, plan: &WritePlan, chunk: Chunk) -> Result<u64>;

    /// Release the underlying connections.
    async fn close(&self);
}

/// [`RowSink`] that writes each chunk inside one transaction.
pub struct ChunkWriter {
    executor: Arc<dyn SqlExecutor>,
}

impl ChunkWriter {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl RowSink for ChunkWriter {
    async fn probe(&self) -> Result<()> {
        self.executor.ping().await
    }

    async fn clear_table(&self, spec: &TableTransferSpec) -> Result<()> {
        let sql = build_truncate(spec)?;
        self.executor.execute(&Statement::raw(sql)).await?;
        info!("Truncated {}", spec.target_name());
        Ok(())
    }

    async fn write_chunk(&self, plan: &WritePlan, chunk: Chunk) -> Result<u64> {
        if chunk.is_empty() {
            return Ok(0);
        }
        let rows = chunk.len() as u64;
        let statements = plan.statements(chunk)?;
        self.executor.execute_in_transaction(&statements).await?;
        debug!(
            "{}: wrote {} rows in {} statements ({})",
            plan.table(),
            rows,
            statements.len(),
            plan.mode().as_str()
        );
        Ok(rows)
    }

    async fn close(&self) {
        self.executor.close().await;
    }
}
