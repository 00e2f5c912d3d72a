//! SELECT-side statements: projection, count, chunk window and column discovery.

use crate::config::TableTransferSpec;
use crate::core::identifier::{parse_order_by, quote_mssql, render_order_by, validate_filter, TableName};
use crate::core::SqlValue;
use crate::error::{Result, TransferError};

use super::Statement;

/// The validated parts of a table's SELECT, rendered on demand.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    table: TableName,
    projection: Option<Vec<String>>,
    filter: Option<String>,
    order: Option<String>,
    order_columns: Vec<String>,
    limit: Option<u64>,
}

impl SelectQuery {
    pub fn from_spec(spec: &TableTransferSpec) -> Result<Self> {
        let table = TableName::parse(&spec.source_table)?;

        let projection = match spec.selected_columns {
            Some(ref cols) if !cols.is_empty() => Some(
                cols.iter()
                    .map(|c| quote_mssql(c))
                    .collect::<Result<Vec<_>>>()?,
            ),
            _ => None,
        };

        let filter = match spec.where_clause.as_deref().map(str::trim) {
            Some(f) if !f.is_empty() => {
                validate_filter(f)?;
                Some(f.to_string())
            }
            _ => None,
        };

        let (order, order_columns) = match spec.order_by.as_deref().map(str::trim) {
            Some(o) if !o.is_empty() => {
                let terms = parse_order_by(o)?;
                let cols = terms.iter().map(|t| t.column.clone()).collect();
                (Some(render_order_by(&terms)), cols)
            }
            _ => (None, Vec::new()),
        };

        // The limited form orders over the derived table, so the order
        // columns must survive the projection.
        if spec.row_limit.is_some() {
            if let Some(ref selected) = spec.selected_columns {
                if let Some(missing) = order_columns
                    .iter()
                    .find(|o: &&String| !selected.iter().any(|s| s.eq_ignore_ascii_case(o)))
                {
                    return Err(TransferError::Config(format!(
                        "order_by column {} must be in selected_columns when row_limit is set",
                        missing
                    )));
                }
            }
        }

        Ok(Self {
            table,
            projection,
            filter,
            order,
            order_columns,
            limit: spec.row_limit,
        })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Whether chunk windows are stable across repeated reads.
    pub fn has_stable_order(&self) -> bool {
        !self.order_columns.is_empty()
    }

    /// Explicit projection names, unquoted, when one was given.
    pub fn explicit_columns(spec: &TableTransferSpec) -> Option<Vec<String>> {
        spec.selected_columns.clone().filter(|c| !c.is_empty())
    }

    /// `SELECT <projection> FROM <table> [WHERE ...]` without ordering.
    fn base(&self) -> String {
        let projection = match self.projection {
            Some(ref cols) => cols.join(", "),
            None => "*".to_string(),
        };
        let mut sql = format!("SELECT {} FROM {}", projection, self.table.quoted());
        if let Some(ref filter) = self.filter {
            sql.push_str(&format!(" WHERE ({})", filter));
        }
        sql
    }

    fn order_clause(&self) -> String {
        match self.order {
            Some(ref order) => format!(" ORDER BY {}", order),
            None => String::new(),
        }
    }

    /// The full SELECT: projection, filter, order, then the row limit.
    pub fn select_sql(&self) -> String {
        match self.limit {
            None => format!("{}{}", self.base(), self.order_clause()),
            Some(limit) => format!(
                "SELECT TOP ({}) * FROM ({}) AS limited{}",
                limit,
                self.base(),
                self.order_clause()
            ),
        }
    }

    /// Row count of the full SELECT.
    pub fn count_sql(&self) -> String {
        let inner = match self.limit {
            None => self.base(),
            Some(_) => self.select_sql(),
        };
        format!("SELECT COUNT_BIG(*) FROM ({}) AS total_rows", inner)
    }

    /// One OFFSET/FETCH window over the full SELECT.
    pub fn chunk_sql(&self, offset: u64, size: usize) -> String {
        let order = self
            .order
            .clone()
            .unwrap_or_else(|| "(SELECT NULL)".to_string());
        let source = match self.limit {
            None => self.base(),
            Some(_) => format!("SELECT * FROM ({}) AS src", self.select_sql()),
        };
        format!(
            "{} ORDER BY {} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            source, order, offset, size
        )
    }

    /// Zero-row probe whose result metadata names the columns.
    pub fn column_probe_sql(&self) -> String {
        format!("SELECT TOP 0 * FROM ({}) AS column_check", self.base())
    }

    /// INFORMATION_SCHEMA lookup of the source table's columns.
    pub fn column_lookup(&self) -> Statement {
        let catalog = match self.table.database() {
            Some(db) => format!("[{}].", db.replace(']', "]]")),
            None => String::new(),
        };
        let mut params = vec![SqlValue::Text(self.table.object().to_string())];
        let schema_predicate = match self.table.schema() {
            Some(schema) => {
                params.push(SqlValue::Text(schema.to_string()));
                "TABLE_SCHEMA = @P2"
            }
            None => "TABLE_SCHEMA = SCHEMA_NAME()",
        };
        Statement {
            sql: format!(
                "SELECT COLUMN_NAME FROM {}INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_NAME = @P1 AND {} ORDER BY ORDINAL_POSITION",
                catalog, schema_predicate
            ),
            params,
        }
    }
}
