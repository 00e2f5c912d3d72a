//! Target-side statements: batched INSERT and keyed MERGE.

use tracing::warn;

use crate::config::{TableTransferSpec, WriteMode};
use crate::core::identifier::{validate_identifier, TableName};
use crate::core::Chunk;
use crate::error::{Result, TransferError};

use super::Statement;

/// SQL Server allows 2100 parameters per request; `sp_executesql` spends
/// two of them on the statement text and the parameter declaration.
const MAX_PARAMS_PER_STATEMENT: usize = 2098;

/// Row limit of a single table value constructor (`VALUES (...), (...)`).
const MAX_ROWS_PER_VALUES: usize = 1000;

fn quote(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Resolved write strategy for one table: target, column mapping and mode.
#[derive(Debug, Clone)]
pub struct WritePlan {
    table: String,
    target: TableName,
    source_columns: Vec<String>,
    target_columns: Vec<String>,
    mode: WriteMode,
    key_index: Option<usize>,
}

impl WritePlan {
    /// Build the plan from a spec and the columns the reader resolved.
    ///
    /// # Errors
    ///
    /// `TransferError::Config` when upsert mode lacks a key, the key is not
    /// among `resolved`, or the mapping produces an invalid or duplicate
    /// target column.
    pub fn build(spec: &TableTransferSpec, resolved: &[String]) -> Result<Self> {
        if resolved.is_empty() {
            return Err(TransferError::Config(format!(
                "No columns resolved for {}",
                spec.source_table
            )));
        }
        let target = TableName::parse(spec.target_name())?;

        if let Some(ref mapping) = spec.column_mapping {
            for source in mapping.keys() {
                if !resolved.iter().any(|c| c.eq_ignore_ascii_case(source)) {
                    warn!(
                        "{}: column_mapping entry {} does not match any source column, ignoring",
                        spec.source_table, source
                    );
                }
            }
        }

        let mut target_columns: Vec<String> = Vec::with_capacity(resolved.len());
        for column in resolved {
            let mapped = spec.mapped_column(column);
            validate_identifier(mapped)?;
            if target_columns.iter().any(|c| c.eq_ignore_ascii_case(mapped)) {
                return Err(TransferError::Config(format!(
                    "{}: target column {} is produced by more than one source column",
                    spec.source_table, mapped
                )));
            }
            target_columns.push(mapped.to_string());
        }

        let key_index = match spec.write_mode {
            WriteMode::Upsert => {
                let key = spec
                    .upsert_key
                    .as_deref()
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| {
                        TransferError::Config(format!(
                            "{}: write_mode 'upsert' requires upsert_key",
                            spec.source_table
                        ))
                    })?;
                let idx = resolved
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(key))
                    .ok_or_else(|| {
                        TransferError::Config(format!(
                            "{}: upsert_key {} is not present in resolved columns [{}]",
                            spec.source_table,
                            key,
                            resolved.join(", ")
                        ))
                    })?;
                Some(idx)
            }
            _ => None,
        };

        Ok(Self {
            table: spec.source_table.clone(),
            target,
            source_columns: resolved.to_vec(),
            target_columns,
            mode: spec.write_mode,
            key_index,
        })
    }

    /// Source table this plan writes for.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn target(&self) -> &TableName {
        &self.target
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn source_columns(&self) -> &[String] {
        &self.source_columns
    }

    pub fn target_columns(&self) -> &[String] {
        &self.target_columns
    }

    /// Mapped name of the upsert key, in upsert mode.
    pub fn key_column(&self) -> Option<&str> {
        self.key_index.map(|i| self.target_columns[i].as_str())
    }

    /// Rows that fit one statement under the parameter and VALUES limits.
    pub fn rows_per_statement(&self) -> usize {
        (MAX_PARAMS_PER_STATEMENT / self.target_columns.len())
            .clamp(1, MAX_ROWS_PER_VALUES)
    }

    fn values_list(&self, rows: usize) -> String {
        let width = self.target_columns.len();
        (0..rows)
            .map(|r| {
                let placeholders: Vec<String> = (0..width)
                    .map(|c| format!("@P{}", r * width + c + 1))
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Statement text for `rows` rows with positional placeholders.
    pub fn statement_sql(&self, rows: usize) -> String {
        let cols: Vec<String> = self.target_columns.iter().map(|c| quote(c)).collect();
        let col_list = cols.join(", ");

        let Some(key_idx) = self.key_index else {
            return format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.target.quoted(),
                col_list,
                self.values_list(rows)
            );
        };

        let key = &cols[key_idx];
        let update_set: Vec<String> = cols
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != key_idx)
            .map(|(_, c)| format!("target.{} = source.{}", c, c))
            .collect();
        let source_values: Vec<String> = cols.iter().map(|c| format!("source.{}", c)).collect();

        let mut sql = format!(
            "MERGE INTO {} AS target USING (VALUES {}) AS source ({}) ON target.{} = source.{}",
            self.target.quoted(),
            self.values_list(rows),
            col_list,
            key,
            key
        );
        if !update_set.is_empty() {
            sql.push_str(&format!(
                " WHEN MATCHED THEN UPDATE SET {}",
                update_set.join(", ")
            ));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
            col_list,
            source_values.join(", ")
        ));
        sql
    }

    /// Split a chunk into parameterized statements.
    pub fn statements(&self, chunk: Chunk) -> Result<Vec<Statement>> {
        let matches = chunk.columns.len() == self.source_columns.len()
            && chunk
                .columns
                .iter()
                .zip(&self.source_columns)
                .all(|(a, b)| a.eq_ignore_ascii_case(b));
        if !matches {
            return Err(TransferError::table(
                &self.table,
                format!(
                    "chunk columns [{}] do not match resolved columns [{}]",
                    chunk.columns.join(", "),
                    self.source_columns.join(", ")
                ),
            ));
        }

        let per_statement = self.rows_per_statement();
        let mut statements = Vec::with_capacity(chunk.rows.len().div_ceil(per_statement));
        let mut rows = chunk.rows.into_iter().peekable();
        while rows.peek().is_some() {
            let batch: Vec<_> = rows.by_ref().take(per_statement).collect();
            let sql = self.statement_sql(batch.len());
            let params = batch.into_iter().flatten().collect();
            statements.push(Statement { sql, params });
        }
        Ok(statements)
    }
}

/// `TRUNCATE TABLE` for the spec's target.
pub fn build_truncate(spec: &TableTransferSpec) -> Result<String> {
    let target = TableName::parse(spec.target_name())?;
    Ok(format!("TRUNCATE TABLE {}", target.quoted()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;
    use std::collections::BTreeMap;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn upsert_spec() -> TableTransferSpec {
        let mut spec = TableTransferSpec::new("dbo.PARTS");
        spec.write_mode = WriteMode::Upsert;
        spec.upsert_key = Some("ID".into());
        spec
    }

    #[test]
    fn test_insert_sql_with_mapping() {
        let mut spec = TableTransferSpec::new("dbo.PARTS");
        spec.target_table = Some("dbo.PARTS_COPY".into());
        let mut mapping = BTreeMap::new();
        mapping.insert("NAME".to_string(), "PART_NAME".to_string());
        spec.column_mapping = Some(mapping);

        let plan = WritePlan::build(&spec, &cols(&["ID", "NAME"])).unwrap();
        assert_eq!(plan.target_columns(), &cols(&["ID", "PART_NAME"])[..]);
        assert_eq!(
            plan.statement_sql(2),
            "INSERT INTO [dbo].[PARTS_COPY] ([ID], [PART_NAME]) VALUES (@P1, @P2), (@P3, @P4)"
        );
    }

    #[test]
    fn test_merge_sql() {
        let plan = WritePlan::build(&upsert_spec(), &cols(&["ID", "NAME", "QTY"])).unwrap();
        assert_eq!(plan.key_column(), Some("ID"));
        let sql = plan.statement_sql(1);
        assert_eq!(
            sql,
            "MERGE INTO [dbo].[PARTS] AS target USING (VALUES (@P1, @P2, @P3)) AS source ([ID], [NAME], [QTY]) \
             ON target.[ID] = source.[ID] \
             WHEN MATCHED THEN UPDATE SET target.[NAME] = source.[NAME], target.[QTY] = source.[QTY] \
             WHEN NOT MATCHED THEN INSERT ([ID], [NAME], [QTY]) VALUES (source.[ID], source.[NAME], source.[QTY]);"
        );
    }

    #[test]
    fn test_merge_key_only_is_insert_only() {
        let plan = WritePlan::build(&upsert_spec(), &cols(&["ID"])).unwrap();
        let sql = plan.statement_sql(1);
        assert!(!sql.contains("WHEN MATCHED"));
        assert!(sql.contains("WHEN NOT MATCHED THEN INSERT ([ID])"));
    }

    #[test]
    fn test_merge_uses_mapped_key() {
        let mut spec = upsert_spec();
        let mut mapping = BTreeMap::new();
        mapping.insert("ID".to_string(), "PART_ID".to_string());
        spec.column_mapping = Some(mapping);
        let plan = WritePlan::build(&spec, &cols(&["ID", "NAME"])).unwrap();
        assert_eq!(plan.key_column(), Some("PART_ID"));
        assert!(plan
            .statement_sql(1)
            .contains("ON target.[PART_ID] = source.[PART_ID]"));
    }

    #[test]
    fn test_upsert_without_key_is_config_error() {
        let mut spec = upsert_spec();
        spec.upsert_key = None;
        let err = WritePlan::build(&spec, &cols(&["ID"])).unwrap_err();
        assert!(matches!(err, TransferError::Config(_)));
    }

    #[test]
    fn test_upsert_key_absent_from_resolved() {
        let mut spec = upsert_spec();
        spec.upsert_key = Some("PART_NO".into());
        let err = WritePlan::build(&spec, &cols(&["ID", "NAME"])).unwrap_err();
        assert!(matches!(err, TransferError::Config(_)));
        assert!(err.to_string().contains("not present in resolved columns"));
    }

    #[test]
    fn test_upsert_key_case_insensitive() {
        let mut spec = upsert_spec();
        spec.upsert_key = Some("id".into());
        let plan = WritePlan::build(&spec, &cols(&["ID", "NAME"])).unwrap();
        assert_eq!(plan.key_column(), Some("ID"));
    }

    #[test]
    fn test_duplicate_target_column_rejected() {
        let mut spec = TableTransferSpec::new("dbo.PARTS");
        let mut mapping = BTreeMap::new();
        mapping.insert("NAME".to_string(), "ID".to_string());
        spec.column_mapping = Some(mapping);
        assert!(WritePlan::build(&spec, &cols(&["ID", "NAME"])).is_err());
    }

    #[test]
    fn test_rows_per_statement_limits() {
        let spec = TableTransferSpec::new("t");
        let plan = WritePlan::build(&spec, &cols(&["A"])).unwrap();
        assert_eq!(plan.rows_per_statement(), 1000);

        let wide: Vec<String> = (0..30).map(|i| format!("C{}", i)).collect();
        let plan = WritePlan::build(&spec, &wide).unwrap();
        assert_eq!(plan.rows_per_statement(), 69);
    }

    #[test]
    fn test_statements_stay_under_server_parameter_limit() {
        let spec = TableTransferSpec::new("t");
        let narrow = cols(&["A", "B", "C"]);
        let plan = WritePlan::build(&spec, &narrow).unwrap();
        let rows: Vec<Vec<SqlValue>> = (0..700)
            .map(|r| (0..3).map(|c| SqlValue::I32(r * 10 + c)).collect())
            .collect();
        let chunk = Chunk::new(narrow.clone(), rows).unwrap();
        let statements = plan.statements(chunk).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|s| s.params.len() <= 2098));
        assert_eq!(statements[0].params.len(), 699 * 3);
        assert_eq!(statements[1].params.len(), 3);
    }

    #[test]
    fn test_statements_split_and_flatten() {
        let spec = TableTransferSpec::new("t");
        let wide: Vec<String> = (0..30).map(|i| format!("C{}", i)).collect();
        let plan = WritePlan::build(&spec, &wide).unwrap();
        let rows: Vec<Vec<SqlValue>> = (0..150)
            .map(|r| (0..30).map(|c| SqlValue::I32(r * 100 + c)).collect())
            .collect();
        let chunk = Chunk::new(wide.clone(), rows).unwrap();
        let statements = plan.statements(chunk).unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].params.len(), 69 * 30);
        assert_eq!(statements[2].params.len(), 12 * 30);
        assert!(statements[2].sql.ends_with("@P360)"));
    }

    #[test]
    fn test_statements_reject_mismatched_chunk() {
        let spec = TableTransferSpec::new("t");
        let plan = WritePlan::build(&spec, &cols(&["A", "B"])).unwrap();
        let chunk = Chunk::new(cols(&["A", "C"]), vec![]).unwrap();
        assert!(plan.statements(chunk).is_err());
    }

    #[test]
    fn test_build_truncate() {
        let mut spec = TableTransferSpec::new("dbo.PARTS");
        assert_eq!(build_truncate(&spec).unwrap(), "TRUNCATE TABLE [dbo].[PARTS]");
        spec.target_table = Some("stage.PARTS".into());
        assert_eq!(build_truncate(&spec).unwrap(), "TRUNCATE TABLE [stage].[PARTS]");
    }
}
