//! Request validation. Everything here runs before any I/O.

use std::collections::HashSet;

use super::{DatabaseConfig, TableTransferSpec, TransferRequest, WriteMode};
use crate::core::identifier::{parse_order_by, validate_filter, validate_identifier, TableName};
use crate::error::{Result, TransferError};

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 100;

/// Validate a transfer request.
pub fn validate(request: &TransferRequest) -> Result<()> {
    validate_database(&request.source, "source")?;
    validate_database(&request.target, "target")?;

    if request.tables.is_empty() {
        return Err(TransferError::Config(
            "tables must list at least one table".into(),
        ));
    }
    if request.chunk_size < MIN_CHUNK_SIZE {
        return Err(TransferError::Config(format!(
            "chunk_size must be at least {}, got {}",
            MIN_CHUNK_SIZE, request.chunk_size
        )));
    }
    if request.max_workers == 0 {
        return Err(TransferError::Config("max_workers must be at least 1".into()));
    }

    let engine = &request.engine;
    if engine.pool_max == 0 || engine.pool_min > engine.pool_max {
        return Err(TransferError::Config(format!(
            "engine.pool_min ({}) must not exceed engine.pool_max ({}), and pool_max must be at least 1",
            engine.pool_min, engine.pool_max
        )));
    }
    if engine.query_retry_attempts == 0 {
        return Err(TransferError::Config(
            "engine.query_retry_attempts must be at least 1".into(),
        ));
    }
    if engine.connect_retries == 0 {
        return Err(TransferError::Config(
            "engine.connect_retries must be at least 1".into(),
        ));
    }

    // One table has exactly one writer.
    let mut targets = HashSet::new();
    for (idx, spec) in request.tables.iter().enumerate() {
        validate_table(spec).map_err(|e| match e {
            TransferError::Config(msg) => {
                TransferError::Config(format!("tables[{}] ({}): {}", idx, spec.source_table, msg))
            }
            other => other,
        })?;
        if !targets.insert(spec.target_name().to_lowercase()) {
            return Err(TransferError::Config(format!(
                "tables[{}]: target table {} is written by more than one table spec",
                idx,
                spec.target_name()
            )));
        }
    }

    Ok(())
}

fn validate_database(config: &DatabaseConfig, side: &str) -> Result<()> {
    if config.host.trim().is_empty() {
        return Err(TransferError::Config(format!("{}.host is required", side)));
    }
    if config.port == 0 {
        return Err(TransferError::Config(format!("{}.port must be non-zero", side)));
    }
    if config.database.trim().is_empty() {
        return Err(TransferError::Config(format!("{}.database is required", side)));
    }
    if config.user.trim().is_empty() {
        return Err(TransferError::Config(format!("{}.user is required", side)));
    }
    if config.options.connect_timeout_secs == 0 {
        return Err(TransferError::Config(format!(
            "{}.options.connect_timeout_secs must be at least 1",
            side
        )));
    }
    Ok(())
}

/// Validate a single table spec against the identifier and fragment policy.
pub fn validate_table(spec: &TableTransferSpec) -> Result<()> {
    TableName::parse(&spec.source_table)?;
    if let Some(ref target) = spec.target_table {
        TableName::parse(target)?;
    }

    if let Some(0) = spec.row_limit {
        return Err(TransferError::Config("row_limit must be at least 1".into()));
    }

    if let Some(ref columns) = spec.selected_columns {
        if columns.is_empty() {
            return Err(TransferError::Config(
                "selected_columns must not be empty when given".into(),
            ));
        }
        for column in columns {
            validate_identifier(column)?;
        }
    }

    if let Some(ref mapping) = spec.column_mapping {
        for (from, to) in mapping {
            validate_identifier(from)?;
            validate_identifier(to)?;
        }
    }

    if let Some(ref filter) = spec.where_clause {
        validate_filter(filter)?;
    }

    if let Some(ref order) = spec.order_by {
        parse_order_by(order)?;
    }

    match (spec.write_mode, spec.upsert_key.as_deref()) {
        (WriteMode::Upsert, None) => {
            return Err(TransferError::Config(
                "write_mode 'upsert' requires upsert_key".into(),
            ));
        }
        (WriteMode::Upsert, Some(key)) if key.trim().is_empty() => {
            return Err(TransferError::Config(
                "write_mode 'upsert' requires a non-empty upsert_key".into(),
            ));
        }
        (WriteMode::Upsert, Some(key)) => {
            validate_identifier(key)?;
            // With an explicit projection the resolved columns are known now.
            if let Some(ref columns) = spec.selected_columns {
                if !columns.iter().any(|c| c.eq_ignore_ascii_case(key)) {
                    return Err(TransferError::Config(format!(
                        "upsert_key {} is not among selected_columns",
                        key
                    )));
                }
            }
        }
        _ => {}
    }

    Ok(())
}
