//! Centralized identifier validation and quoting for SQL injection prevention.
//!
//! Table and column names cannot be bound as parameters, so every name that
//! ends up in generated SQL goes through this module:
//!
//! 1. Names must match a restricted identifier grammar (letters, digits, `_`,
//!    `$`, `#`, `@`; first character a letter, `_` or `#`; at most 128 chars).
//! 2. Names are always rendered bracket-quoted with `]` escaped.
//!
//! Free-form fragments supplied by callers (filters, orderings) are not
//! identifiers. Filters are checked against an allow-list policy by
//! [`validate_filter`]; orderings are parsed into [`OrderTerm`]s and
//! re-rendered, so no caller text reaches the server unquoted.

use std::fmt;

use crate::error::{Result, TransferError};

/// Maximum identifier length for SQL Server.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Maximum length of a filter fragment.
const MAX_FILTER_LENGTH: usize = 4000;

/// Validate an identifier against the restricted grammar.
///
/// # Errors
///
/// Returns `TransferError::Config` for invalid identifiers with a descriptive message.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TransferError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(TransferError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(TransferError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_alphabetic() || c == '_' || c == '#')
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '$' | '#' | '@'));
    // Unicode letters and digits are valid in regular SQL Server identifiers.
    if !first_ok {
        return Err(TransferError::Config(format!(
            "SECURITY: Identifier {:?} must start with a letter, '_' or '#'",
            name
        )));
    }
    if !rest_ok {
        return Err(TransferError::Config(format!(
            "SECURITY: Identifier {:?} may only contain letters, digits, '_', '$', '#' or '@'",
            name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// Escapes closing brackets by doubling them and wraps in brackets.
/// Validates the identifier before quoting.
///
/// ```ignore
/// assert_eq!(quote_mssql("users")?, "[users]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Strip one level of `[...]` quoting, if present.
fn unbracket(part: &str) -> &str {
    let part = part.trim();
    part.strip_prefix('[')
        .and_then(|p| p.strip_suffix(']'))
        .unwrap_or(part)
}

/// A validated, possibly qualified table name (`table`, `schema.table` or
/// `database.schema.table`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    parts: Vec<String>,
}

impl TableName {
    /// Parse a dotted table name. Each part may already be bracket-quoted.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<String> = raw.split('.').map(|p| unbracket(p).to_string()).collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(TransferError::Config(format!(
                "Table name {:?} must have one to three dot-separated parts",
                raw
            )));
        }
        for part in &parts {
            validate_identifier(part).map_err(|e| {
                TransferError::Config(format!("Invalid table name {:?}: {}", raw, e))
            })?;
        }
        Ok(Self { parts })
    }

    /// Unqualified object name.
    pub fn object(&self) -> &str {
        &self.parts[self.parts.len() - 1]
    }

    /// Schema part, when the name is qualified.
    pub fn schema(&self) -> Option<&str> {
        if self.parts.len() >= 2 {
            Some(&self.parts[self.parts.len() - 2])
        } else {
            None
        }
    }

    /// Database part of a three-part name.
    pub fn database(&self) -> Option<&str> {
        if self.parts.len() == 3 {
            Some(&self.parts[0])
        } else {
            None
        }
    }

    /// Bracket-quoted rendering, e.g. `[dbo].[PARTS]`.
    pub fn quoted(&self) -> String {
        self.parts
            .iter()
            .map(|p| format!("[{}]", p.replace(']', "]]")))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join("."))
    }
}

/// Keywords that never belong in a row filter.
const FORBIDDEN_FILTER_KEYWORDS: &[&str] = &[
    "alter",
    "backup",
    "bulk",
    "create",
    "dbcc",
    "declare",
    "delete",
    "deny",
    "drop",
    "exec",
    "execute",
    "grant",
    "insert",
    "into",
    "kill",
    "merge",
    "opendatasource",
    "openquery",
    "openrowset",
    "restore",
    "revoke",
    "select",
    "shutdown",
    "truncate",
    "union",
    "update",
    "waitfor",
];

/// Stored procedures that give OS, registry or dynamic SQL access.
const DANGEROUS_PROCEDURES: &[&str] = &[
    "xp_cmdshell",
    "xp_regread",
    "xp_regwrite",
    "xp_regdelete",
    "xp_dirtree",
    "xp_fileexist",
    "xp_subdirs",
    "sp_executesql",
    "sp_execute",
    "sp_oacreate",
    "sp_oamethod",
    "sp_addextendedproc",
    "sp_configure",
];

/// Validate a row filter (`WHERE` body) supplied by a caller.
///
/// # Rejected Patterns
///
/// - Semicolons and SQL comments (`--`, `/*`, `*/`)
/// - Statement keywords (DML, DDL, `EXEC`, `UNION`, `WAITFOR`, `OPENROWSET`, ...)
///   outside string literals
/// - Known dangerous stored procedures
/// - Unterminated string literals and unbalanced parentheses
///
/// ```ignore
/// validate_filter("STATUS = 'A' AND QTY > 0")?;
/// validate_filter("1=1; DROP TABLE users").is_err();
/// ```
pub fn validate_filter(fragment: &str) -> Result<()> {
    let reject = |reason: &str| {
        Err(TransferError::Config(format!(
            "SECURITY: Filter {} (possible injection): {:?}",
            reason, fragment
        )))
    };

    if fragment.trim().is_empty() {
        return reject("is empty");
    }
    if fragment.len() > MAX_FILTER_LENGTH {
        return reject("exceeds maximum length");
    }
    if fragment.contains('\0') {
        return reject("contains null byte");
    }

    // Blank out string literal contents so keywords inside data are allowed.
    let mut skeleton = String::with_capacity(fragment.len());
    let mut in_literal = false;
    let mut depth: i32 = 0;
    let mut chars = fragment.chars().peekable();
    while let Some(c) = chars.next() {
        if in_literal {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                } else {
                    in_literal = false;
                    skeleton.push('\'');
                }
            }
            continue;
        }
        match c {
            '\'' => {
                in_literal = true;
                skeleton.push('\'');
            }
            '(' => {
                depth += 1;
                skeleton.push(c);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return reject("has unbalanced parentheses");
                }
                skeleton.push(c);
            }
            _ => skeleton.push(c),
        }
    }
    if in_literal {
        return reject("has an unterminated string literal");
    }
    if depth != 0 {
        return reject("has unbalanced parentheses");
    }

    if skeleton.contains(';') {
        return reject("contains semicolon");
    }
    if skeleton.contains("--") || skeleton.contains("/*") || skeleton.contains("*/") {
        return reject("contains SQL comment markers");
    }

    let lower = skeleton.to_lowercase();
    for word in lower.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if FORBIDDEN_FILTER_KEYWORDS.contains(&word) {
            return reject(&format!("contains keyword '{}'", word.to_uppercase()));
        }
        if DANGEROUS_PROCEDURES.contains(&word) {
            return reject(&format!("references stored procedure '{}'", word));
        }
    }

    Ok(())
}

/// One `column [ASC|DESC]` term of an ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: String,
    pub descending: bool,
}

impl OrderTerm {
    /// Quoted rendering, e.g. `[ID] DESC`.
    pub fn render(&self) -> String {
        format!(
            "[{}] {}",
            self.column.replace(']', "]]"),
            if self.descending { "DESC" } else { "ASC" }
        )
    }
}

/// Parse an ordering fragment such as `"ID DESC, NAME"` into terms.
pub fn parse_order_by(fragment: &str) -> Result<Vec<OrderTerm>> {
    let mut terms = Vec::new();
    for raw_term in fragment.split(',') {
        let tokens: Vec<&str> = raw_term.split_whitespace().collect();
        let (column, descending) = match tokens.as_slice() {
            [column] => (*column, false),
            [column, dir] if dir.eq_ignore_ascii_case("asc") => (*column, false),
            [column, dir] if dir.eq_ignore_ascii_case("desc") => (*column, true),
            _ => {
                return Err(TransferError::Config(format!(
                    "Invalid order_by term {:?}: expected `column [ASC|DESC]`",
                    raw_term.trim()
                )))
            }
        };
        let column = unbracket(column);
        validate_identifier(column)?;
        terms.push(OrderTerm {
            column: column.to_string(),
            descending,
        });
    }
    Ok(terms)
}

/// Render parsed terms as an ORDER BY list.
pub fn render_order_by(terms: &[OrderTerm]) -> String {
    terms
        .iter()
        .map(OrderTerm::render)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("my_table").is_ok());
        assert!(validate_identifier("Table123").is_ok());
        assert!(validate_identifier("#staging").is_ok());
        assert!(validate_identifier("PRICE$USD").is_ok());
        assert!(validate_identifier("日本語").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        let result = validate_identifier("");
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        let result = validate_identifier("table\0name");
        assert!(result.unwrap_err().to_string().contains("null byte"));
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        let long_name = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        let result = validate_identifier(&long_name);
        assert!(result.unwrap_err().to_string().contains("maximum length"));
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH)).is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_injection() {
        assert!(validate_identifier("Robert'); DROP TABLE Students;--").is_err());
        assert!(validate_identifier("column with spaces").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("a]b").is_err());
    }

    #[test]
    fn test_validate_identifier_message_matches_rule() {
        assert!(validate_identifier("Größe").is_ok());

        let err = validate_identifier("1abc").unwrap_err().to_string();
        assert!(err.contains("must start with a letter"), "{}", err);

        let err = validate_identifier("a-b").unwrap_err().to_string();
        assert!(err.contains("letters, digits"), "{}", err);
        assert!(!err.contains("A-Za-z"), "{}", err);
    }

    // =========================================================================
    // Quoting tests
    // =========================================================================

    #[test]
    fn test_quote_mssql_normal() {
        assert_eq!(quote_mssql("users").unwrap(), "[users]");
        assert_eq!(quote_mssql("PART_NO").unwrap(), "[PART_NO]");
    }

    #[test]
    fn test_table_name_parse() {
        let t = TableName::parse("dbo.PARTS").unwrap();
        assert_eq!(t.quoted(), "[dbo].[PARTS]");
        assert_eq!(t.schema(), Some("dbo"));
        assert_eq!(t.object(), "PARTS");
        assert_eq!(t.to_string(), "dbo.PARTS");

        let t = TableName::parse("[sales].[dbo].[ORDERS]").unwrap();
        assert_eq!(t.quoted(), "[sales].[dbo].[ORDERS]");

        let t = TableName::parse("PARTS").unwrap();
        assert_eq!(t.schema(), None);
    }

    #[test]
    fn test_table_name_rejects_bad_parts() {
        assert!(TableName::parse("a.b.c.d").is_err());
        assert!(TableName::parse("dbo.").is_err());
        assert!(TableName::parse("dbo.PARTS; DROP TABLE x").is_err());
    }

    // =========================================================================
    // Filter tests
    // =========================================================================

    #[test]
    fn test_validate_filter_accepts_simple_predicates() {
        assert!(validate_filter("ACTIVE = 1").is_ok());
        assert!(validate_filter("STATUS IN ('A', 'B') AND QTY > 0").is_ok());
        assert!(validate_filter("NAME LIKE 'O''Brien%'").is_ok());
        assert!(validate_filter("(A = 1 OR B = 2) AND C IS NOT NULL").is_ok());
    }

    #[test]
    fn test_validate_filter_allows_keywords_in_literals() {
        assert!(validate_filter("NOTE = 'drop; update -- later'").is_ok());
    }

    #[test]
    fn test_validate_filter_rejects_statements() {
        assert!(validate_filter("1=1; DROP TABLE users").is_err());
        assert!(validate_filter("1=1 -- comment").is_err());
        assert!(validate_filter("1=1 /* x */").is_err());
        assert!(validate_filter("ID IN (SELECT ID FROM secrets)").is_err());
        assert!(validate_filter("1=1 UNION ALL SELECT 1").is_err());
        assert!(validate_filter("EXEC xp_cmdshell 'dir'").is_err());
        assert!(validate_filter("x = 1 WAITFOR DELAY '0:0:5'").is_err());
    }

    #[test]
    fn test_validate_filter_rejects_unbalanced() {
        assert!(validate_filter("NAME = 'abc").is_err());
        assert!(validate_filter("(A = 1").is_err());
        assert!(validate_filter("A = 1)").is_err());
        assert!(validate_filter("   ").is_err());
    }

    #[test]
    fn test_validate_filter_allows_similar_column_names() {
        assert!(validate_filter("sp_rate > 1 AND updated_at IS NULL").is_ok());
    }

    // =========================================================================
    // Ordering tests
    // =========================================================================

    #[test]
    fn test_parse_order_by() {
        let terms = parse_order_by("ID DESC, NAME").unwrap();
        assert_eq!(terms.len(), 2);
        assert!(terms[0].descending);
        assert!(!terms[1].descending);
        assert_eq!(render_order_by(&terms), "[ID] DESC, [NAME] ASC");

        let terms = parse_order_by("[PART_NO] asc").unwrap();
        assert_eq!(render_order_by(&terms), "[PART_NO] ASC");
    }

    #[test]
    fn test_parse_order_by_rejects_expressions() {
        assert!(parse_order_by("ID; DROP TABLE x").is_err());
        assert!(parse_order_by("LEN(NAME)").is_err());
        assert!(parse_order_by("ID DESC NULLS").is_err());
        assert!(parse_order_by("").is_err());
    }
}
