//! Core building blocks shared by the reader, writer and query builder.
//!
//! - [`identifier`]: identifier grammar, quoting and fragment validation
//! - [`value`]: row values and fixed-schema chunks

pub mod identifier;
pub mod value;

pub use identifier::{
    parse_order_by, quote_mssql, render_order_by, validate_filter, validate_identifier,
    OrderTerm, TableName,
};
pub use value::{Chunk, SqlNullType, SqlValue};
