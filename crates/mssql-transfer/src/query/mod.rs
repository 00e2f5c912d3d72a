//! Statement construction for one table transfer.
//!
//! All SQL the engine sends is produced here. Identifiers come from
//! [`crate::core::identifier`] and are always bracket-quoted; row data is
//! always bound as `@Pn` parameters.

mod select;
mod write;

pub use select::SelectQuery;
pub use write::{build_truncate, WritePlan};

use crate::config::TableTransferSpec;
use crate::core::SqlValue;
use crate::error::Result;

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    /// A statement without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Build the full SELECT for a table spec.
pub fn build_select(spec: &TableTransferSpec) -> Result<String> {
    Ok(SelectQuery::from_spec(spec)?.select_sql())
}

/// Build the write plan (INSERT or MERGE) for a spec and its resolved columns.
pub fn build_insert_or_upsert(spec: &TableTransferSpec, resolved: &[String]) -> Result<WritePlan> {
    WritePlan::build(spec, resolved)
}
