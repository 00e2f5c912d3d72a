//! Source side of a table transfer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::TableTransferSpec;
use crate::connection::SqlExecutor;
use crate::core::Chunk;
use crate::error::{Result, TransferError};
use crate::query::{SelectQuery, Statement};

/// Reads counts, column lists and chunk windows from the source database.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Verify the source is reachable.
    async fn probe(&self) -> Result<()>;

    /// Rows the full SELECT will return.
    async fn count_rows(&self, spec: &TableTransferSpec) -> Result<u64>;

    /// Column names, in the order the SELECT returns them.
    async fn resolve_columns(&self, spec: &TableTransferSpec) -> Result<Vec<String>>;

    /// One window of the SELECT, starting at `offset`.
    async fn read_chunk(
        &self,
        spec: &TableTransferSpec,
        columns: &[String],
        offset: u64,
        size: usize,
    ) -> Result<Chunk>;

    /// Release the underlying connections.
    async fn close(&self);
}

/// [`RowSource`] over an [`SqlExecutor`] using OFFSET/FETCH windows.
pub struct ChunkedReader {
    executor: Arc<dyn SqlExecutor>,
}

impl ChunkedReader {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl RowSource for ChunkedReader {
    async fn probe(&self) -> Result<()> {
        self.executor.ping().await
    }

    async fn count_rows(&self, spec: &TableTransferSpec) -> Result<u64> {
        let query = SelectQuery::from_spec(spec)?;
        let count = self.executor.query_scalar(&query.count_sql()).await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn resolve_columns(&self, spec: &TableTransferSpec) -> Result<Vec<String>> {
        if let Some(columns) = SelectQuery::explicit_columns(spec) {
            return Ok(columns);
        }

        let query = SelectQuery::from_spec(spec)?;
        let columns = self.executor.query_strings(&query.column_lookup()).await?;
        if !columns.is_empty() {
            return Ok(columns);
        }

        debug!(
            "{}: no catalog columns found, probing result metadata",
            spec.source_table
        );
        let columns = self
            .executor
            .query_column_names(&query.column_probe_sql())
            .await?;
        if columns.is_empty() {
            return Err(TransferError::table(
                &spec.source_table,
                "could not resolve any columns",
            ));
        }
        Ok(columns)
    }

    async fn read_chunk(
        &self,
        spec: &TableTransferSpec,
        columns: &[String],
        offset: u64,
        size: usize,
    ) -> Result<Chunk> {
        let query = SelectQuery::from_spec(spec)?;
        let rows = self
            .executor
            .query_rows(&Statement::raw(query.chunk_sql(offset, size)))
            .await?;
        Chunk::new(columns.to_vec(), rows)
    }

    async fn close(&self) {
        self.executor.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::scripted::ScriptedExecutor;
    use crate::core::SqlValue;

    fn reader() -> (Arc<ScriptedExecutor>, ChunkedReader) {
        let exec = Arc::new(ScriptedExecutor::new());
        let reader = ChunkedReader::new(exec.clone());
        (exec, reader)
    }

    #[tokio::test]
    async fn test_count_rows() {
        let (exec, reader) = reader();
        exec.push_scalar(Some(500));
        let spec = TableTransferSpec::new("dbo.PARTS");
        assert_eq!(reader.count_rows(&spec).await.unwrap(), 500);
        assert!(exec.sql_log()[0].starts_with("SELECT COUNT_BIG(*)"));
    }

    #[tokio::test]
    async fn test_count_rows_empty_result_is_zero() {
        let (_exec, reader) = reader();
        let spec = TableTransferSpec::new("dbo.PARTS");
        assert_eq!(reader.count_rows(&spec).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_explicit_columns_skip_lookup() {
        let (exec, reader) = reader();
        let mut spec = TableTransferSpec::new("dbo.PARTS");
        spec.selected_columns = Some(vec!["ID".into(), "NAME".into()]);
        let cols = reader.resolve_columns(&spec).await.unwrap();
        assert_eq!(cols, vec!["ID", "NAME"]);
        assert!(exec.sql_log().is_empty());
    }

    #[tokio::test]
    async fn test_catalog_lookup_then_probe_fallback() {
        let (exec, reader) = reader();
        let spec = TableTransferSpec::new("dbo.PARTS");

        exec.push_strings(&["ID", "NAME", "QTY"]);
        assert_eq!(
            reader.resolve_columns(&spec).await.unwrap(),
            vec!["ID", "NAME", "QTY"]
        );

        exec.push_strings(&[]);
        exec.push_column_names(&["ID", "NAME"]);
        assert_eq!(reader.resolve_columns(&spec).await.unwrap(), vec!["ID", "NAME"]);
        assert!(exec.sql_log().last().unwrap().starts_with("SELECT TOP 0"));
    }

    #[tokio::test]
    async fn test_no_columns_is_table_error() {
        let (_exec, reader) = reader();
        let spec = TableTransferSpec::new("dbo.PARTS");
        let err = reader.resolve_columns(&spec).await.unwrap_err();
        assert!(matches!(err, TransferError::Table { .. }));
    }

    #[tokio::test]
    async fn test_read_chunk_window_and_width_check() {
        let (exec, reader) = reader();
        let spec = TableTransferSpec::new("dbo.PARTS");
        let cols = vec!["ID".to_string(), "NAME".to_string()];

        exec.push_rows(vec![
            vec![SqlValue::I32(1), SqlValue::from("a")],
            vec![SqlValue::I32(2), SqlValue::from("b")],
        ]);
        let chunk = reader.read_chunk(&spec, &cols, 100, 100).await.unwrap();
        assert_eq!(chunk.len(), 2);
        assert!(exec.sql_log()[0].ends_with("OFFSET 100 ROWS FETCH NEXT 100 ROWS ONLY"));

        exec.push_rows(vec![vec![SqlValue::I32(3)]]);
        assert!(reader.read_chunk(&spec, &cols, 200, 100).await.is_err());
    }

    #[tokio::test]
    async fn test_read_failure_propagates_and_close_reaches_executor() {
        let (exec, reader) = reader();
        let spec = TableTransferSpec::new("dbo.PARTS");
        let cols = vec!["ID".to_string()];

        exec.push_row_error("Invalid object name 'dbo.PARTS'.");
        let err = reader.read_chunk(&spec, &cols, 0, 100).await.unwrap_err();
        assert!(err.to_string().contains("Invalid object name"));

        assert!(!exec.is_closed());
        reader.close().await;
        assert!(exec.is_closed());
    }
}
