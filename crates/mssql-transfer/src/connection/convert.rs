//! Conversion between tiberius wire values and [`SqlValue`].

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tiberius::{ColumnData, FromSql, ToSql};
use uuid::Uuid;

use crate::core::{SqlNullType, SqlValue};
use crate::error::Result;

/// Convert one column of a result row into an owned value.
///
/// The source SELECT may be `*`, so conversion is driven by the wire type
/// rather than catalog metadata.
pub fn column_to_value(data: ColumnData<'static>) -> Result<SqlValue> {
    let value = match data {
        ColumnData::Bit(v) => v.map(SqlValue::Bool).unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        ColumnData::U8(v) => v
            .map(|b| SqlValue::I16(b as i16))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I16(v) => v.map(SqlValue::I16).unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I32(v) => v.map(SqlValue::I32).unwrap_or(SqlValue::Null(SqlNullType::I32)),
        ColumnData::I64(v) => v.map(SqlValue::I64).unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnData::F32(v) => v.map(SqlValue::F32).unwrap_or(SqlValue::Null(SqlNullType::F32)),
        ColumnData::F64(v) => v.map(SqlValue::F64).unwrap_or(SqlValue::Null(SqlNullType::F64)),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid).unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        ColumnData::String(v) => v
            .map(|s| SqlValue::Text(s.into_owned()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        ColumnData::Binary(v) => v
            .map(|b| SqlValue::Bytes(b.into_owned()))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        ColumnData::Numeric(v) => match v {
            Some(n) => match Decimal::try_from_i128_with_scale(n.value(), n.scale() as u32) {
                Ok(d) => SqlValue::Decimal(d),
                // Beyond 28 digits of precision; keep the exact text.
                Err(_) => SqlValue::Text(n.to_string()),
            },
            None => SqlValue::Null(SqlNullType::Decimal),
        },
        ColumnData::Xml(v) => v
            .map(|x| SqlValue::Text(x.into_owned().into_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        ref temporal @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => NaiveDateTime::from_sql(temporal)?
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        ref date @ ColumnData::Date(_) => NaiveDate::from_sql(date)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        ref time @ ColumnData::Time(_) => NaiveTime::from_sql(time)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        ref offset @ ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(offset)?
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        #[allow(unreachable_patterns)]
        other => {
            return Err(crate::error::TransferError::Config(format!(
                "Unsupported column type: {:?}",
                other
            )))
        }
    };
    Ok(value)
}

/// Convert a whole result row.
pub fn row_to_values(row: tiberius::Row) -> Result<Vec<SqlValue>> {
    row.into_iter().map(column_to_value).collect()
}

/// Box a value as a bindable parameter. NULLs keep their type hint so the
/// server sees a typed NULL.
pub fn to_sql_param(value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(null_type) => match null_type {
            SqlNullType::Bool => Box::new(Option::<bool>::None),
            SqlNullType::I16 => Box::new(Option::<i16>::None),
            SqlNullType::I32 => Box::new(Option::<i32>::None),
            SqlNullType::I64 => Box::new(Option::<i64>::None),
            SqlNullType::F32 => Box::new(Option::<f32>::None),
            SqlNullType::F64 => Box::new(Option::<f64>::None),
            SqlNullType::String => Box::new(Option::<String>::None),
            SqlNullType::Bytes => Box::new(Option::<Vec<u8>>::None),
            SqlNullType::Uuid => Box::new(Option::<Uuid>::None),
            SqlNullType::Decimal => Box::new(Option::<Decimal>::None),
            SqlNullType::DateTime => Box::new(Option::<NaiveDateTime>::None),
            SqlNullType::DateTimeOffset => Box::new(Option::<DateTime<FixedOffset>>::None),
            SqlNullType::Date => Box::new(Option::<NaiveDate>::None),
            SqlNullType::Time => Box::new(Option::<NaiveTime>::None),
        },
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::Bytes(b) => Box::new(b.clone()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::Time(t) => Box::new(*t),
    }
}

/// Render a value as plain text, for scalar and string-column queries.
pub fn value_to_text(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Null(_) => None,
        SqlValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        SqlValue::I16(i) => Some(i.to_string()),
        SqlValue::I32(i) => Some(i.to_string()),
        SqlValue::I64(i) => Some(i.to_string()),
        SqlValue::F32(f) => Some(f.to_string()),
        SqlValue::F64(f) => Some(f.to_string()),
        SqlValue::Text(s) => Some(s.clone()),
        SqlValue::Bytes(b) => Some(b.iter().map(|byte| format!("{:02X}", byte)).collect()),
        SqlValue::Uuid(u) => Some(u.to_string()),
        SqlValue::Decimal(d) => Some(d.to_string()),
        SqlValue::DateTime(dt) => Some(dt.to_string()),
        SqlValue::DateTimeOffset(dto) => Some(dto.to_rfc3339()),
        SqlValue::Date(d) => Some(d.to_string()),
        SqlValue::Time(t) => Some(t.to_string()),
    }
}
