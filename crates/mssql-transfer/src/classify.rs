//! Classification of low-level database failures.
//!
//! [`classify`] turns any [`TransferError`] into a [`ClassifiedError`]: a
//! symbolic [`Diagnosis`], a human-readable explanation and, where one exists,
//! a remediation list. Rules are plain string/code matches evaluated in a fixed
//! priority order, most specific first. Classification never fails; if the
//! error text itself cannot be parsed the result is a
//! [`Diagnosis::ParseFailure`] carrying both messages.

use std::fmt;
use std::num::ParseIntError;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// SQL Server error number for a rejected login.
const LOGIN_FAILED_CODE: u32 = 18456;

/// SQL Server error number for a deadlock victim.
const DEADLOCK_CODE: u32 = 1205;

/// Symbolic diagnosis attached to every classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    AuthenticationFailed,
    Transient,
    ConnectivityTimeout,
    InvalidColumn,
    InvalidObject,
    SyntaxError,
    PermissionDenied,
    ServerUnavailable,
    LoginFailed,
    NetworkUnreachable,
    DriverError,
    InvalidConnectionString,
    Generic,
    ParseFailure,
}

impl Diagnosis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Diagnosis::AuthenticationFailed => "authentication_failed",
            Diagnosis::Transient => "transient",
            Diagnosis::ConnectivityTimeout => "connectivity_timeout",
            Diagnosis::InvalidColumn => "invalid_column",
            Diagnosis::InvalidObject => "invalid_object",
            Diagnosis::SyntaxError => "syntax_error",
            Diagnosis::PermissionDenied => "permission_denied",
            Diagnosis::ServerUnavailable => "server_unavailable",
            Diagnosis::LoginFailed => "login_failed",
            Diagnosis::NetworkUnreachable => "network_unreachable",
            Diagnosis::DriverError => "driver_error",
            Diagnosis::InvalidConnectionString => "invalid_connection_string",
            Diagnosis::Generic => "generic",
            Diagnosis::ParseFailure => "parse_failure",
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A database failure mapped to a diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Original error message.
    pub message: String,

    /// Error family label (e.g. `DatabaseError`, `ConnectionError`).
    pub error_type: String,

    pub diagnosis: Diagnosis,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,

    /// Remediation steps, most likely first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,

    /// Vendor error number, when the server reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Vendor error state, when the server reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl ClassifiedError {
    fn new(raw: &RawError<'_>, diagnosis: Diagnosis) -> Self {
        Self {
            message: raw.message.to_string(),
            error_type: raw.kind.to_string(),
            diagnosis,
            explanation: None,
            suggestions: Vec::new(),
            code: raw.code.map(|c| c.to_string()),
            state: raw.state.map(|s| s.to_string()),
        }
    }

    fn explain(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    fn suggest(mut self, suggestions: &[&str]) -> Self {
        self.suggestions = suggestions.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Whether a single query failing this way may succeed if re-issued.
    pub fn is_retryable(&self) -> bool {
        self.diagnosis == Diagnosis::Transient
    }

    /// Build a message-only classification for failures that did not come
    /// from the database (cancellation, configuration).
    pub fn plain(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            diagnosis: Diagnosis::Generic,
            explanation: None,
            suggestions: Vec::new(),
            code: None,
            state: None,
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.diagnosis, self.message)
    }
}

/// The parts of a failure the classifier looks at.
#[derive(Debug, Clone, Copy)]
pub struct RawError<'a> {
    pub message: &'a str,
    pub kind: &'a str,
    pub code: Option<u32>,
    pub state: Option<u8>,
}

impl<'a> RawError<'a> {
    pub fn new(message: &'a str, kind: &'a str) -> Self {
        Self {
            message,
            kind,
            code: None,
            state: None,
        }
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_state(mut self, state: u8) -> Self {
        self.state = Some(state);
        self
    }
}

/// Classify any transfer error.
pub fn classify(err: &TransferError) -> ClassifiedError {
    let message = err.to_string();
    let mut raw = RawError::new(&message, err.kind());
    if let Some(tiberius::error::Error::Server(token)) = err.driver_error() {
        raw = raw.with_code(token.code()).with_state(token.state());
    }
    classify_raw(&raw)
}

/// Classify a failure from its message, code and state.
pub fn classify_raw(raw: &RawError<'_>) -> ClassifiedError {
    match try_classify(raw) {
        Ok(classified) => classified,
        Err(parse_err) => ClassifiedError::new(raw, Diagnosis::ParseFailure)
            .explain(format!(
                "Original error: {}. Error while parsing: {}",
                raw.message, parse_err
            )),
    }
}

fn try_classify(raw: &RawError<'_>) -> std::result::Result<ClassifiedError, ParseIntError> {
    let lower = raw.message.to_lowercase();

    if raw.code == Some(LOGIN_FAILED_CODE) || lower.contains("18456") {
        let state = match raw.state {
            Some(s) => Some(u32::from(s)),
            None => embedded_state(&lower)?,
        };
        let mut explanation = String::from("Authentication failed: check user name and password");
        if let Some(state) = state {
            explanation.push_str(&format!(" (State: {})", state));
        }
        let mut classified = ClassifiedError::new(raw, Diagnosis::AuthenticationFailed)
            .explain(explanation)
            .suggest(&[
                "Verify the user name and password",
                "Confirm SQL Server authentication mode is enabled",
                "Check that the login has access to the requested database",
            ]);
        if classified.code.is_none() {
            classified.code = Some(LOGIN_FAILED_CODE.to_string());
        }
        if classified.state.is_none() {
            classified.state = state.map(|s| s.to_string());
        }
        return Ok(classified);
    }

    if lower.contains("function sequence error")
        || lower.contains("hy010")
        || raw.code == Some(DEADLOCK_CODE)
        || lower.contains("deadlock")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("connection was closed")
        || lower.contains("forcibly closed")
    {
        return Ok(ClassifiedError::new(raw, Diagnosis::Transient)
            .explain("Transient cursor/sequence or connection error; the query may be retried"));
    }

    if lower.contains("login timeout expired")
        || lower.contains("timeout expired")
        || lower.contains("timed out")
    {
        return Ok(ClassifiedError::new(raw, Diagnosis::ConnectivityTimeout)
            .explain("Timed out connecting to the server")
            .suggest(&[
                "Verify the SQL Server service is running",
                "Verify the host and port (default 1433)",
                "Check firewall rules between this host and the server",
                "Confirm TCP/IP is enabled in SQL Server Configuration Manager",
                "Check the instance name when using a named instance",
            ]));
    }

    let rules: &[(&[&str], Diagnosis, &str)] = &[
        (&["invalid column name"], Diagnosis::InvalidColumn, "A referenced column does not exist"),
        (&["invalid object name"], Diagnosis::InvalidObject, "A referenced table or view does not exist"),
        (&["incorrect syntax"], Diagnosis::SyntaxError, "The generated statement has a syntax error"),
        (
            &["permission denied", "permission was denied"],
            Diagnosis::PermissionDenied,
            "The login lacks permission for this operation",
        ),
    ];
    for (phrases, diagnosis, explanation) in rules {
        if phrases.iter().any(|p| lower.contains(p)) {
            return Ok(ClassifiedError::new(raw, *diagnosis).explain(*explanation));
        }
    }

    if lower.contains("adaptive server is unavailable") {
        return Ok(ClassifiedError::new(raw, Diagnosis::ServerUnavailable)
            .explain("The server is unavailable or does not exist")
            .suggest(&[
                "Verify the server name or address",
                "Confirm the server accepts remote connections",
            ]));
    }

    if lower.contains("login failed") {
        return Ok(ClassifiedError::new(raw, Diagnosis::LoginFailed)
            .explain("Login failed: check user name and password"));
    }

    if lower.contains("could not open a connection") {
        return Ok(ClassifiedError::new(raw, Diagnosis::NetworkUnreachable)
            .explain("Could not open a network connection to the server")
            .suggest(&[
                "Verify the server is reachable from this host",
                "Confirm remote connections are allowed on the server",
            ]));
    }

    if lower.contains("driver") {
        return Ok(ClassifiedError::new(raw, Diagnosis::DriverError)
            .explain("The database driver reported an error"));
    }

    if lower.contains("connection string") {
        return Ok(ClassifiedError::new(raw, Diagnosis::InvalidConnectionString)
            .explain("The connection settings are malformed"));
    }

    Ok(ClassifiedError::new(raw, Diagnosis::Generic))
}

/// Find a `state: N` fragment in an already-lowercased message.
fn embedded_state(lower: &str) -> std::result::Result<Option<u32>, ParseIntError> {
    let Some(pos) = lower.find("state:") else {
        return Ok(None);
    };
    let digits: String = lower[pos + "state:".len()..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Ok(None);
    }
    digits.parse::<u32>().map(Some)
}

/// Error payload returned to callers of every public operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl From<&TransferError> for ErrorResponse {
    fn from(err: &TransferError) -> Self {
        let classified = match err {
            TransferError::ProbeFailed { error, .. } => (**error).clone(),
            other => classify(other),
        };
        let diagnosis = match classified.diagnosis {
            Diagnosis::Generic => None,
            d => Some(d),
        };
        Self {
            success: false,
            message: err.to_string(),
            error_type: classified.error_type,
            diagnosis,
            explanation: classified.explanation,
            suggestions: classified.suggestions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(message: &str) -> RawError<'_> {
        RawError::new(message, "DatabaseError")
    }

    #[test]
    fn test_auth_code_with_embedded_state() {
        let c = classify_raw(&raw(
            "Login failed for user 'sa'. (18456) (SQLDriverConnect); State: 8",
        ));
        assert_eq!(c.diagnosis, Diagnosis::AuthenticationFailed);
        assert!(c.explanation.as_deref().unwrap().contains("State: 8"));
        assert_eq!(c.code.as_deref(), Some("18456"));
        assert_eq!(c.state.as_deref(), Some("8"));
        assert!(!c.suggestions.is_empty());
    }

    #[test]
    fn test_auth_code_from_server_token() {
        let c = classify_raw(&raw("Login failed for user 'etl'.").with_code(18456).with_state(1));
        assert_eq!(c.diagnosis, Diagnosis::AuthenticationFailed);
        assert_eq!(c.state.as_deref(), Some("1"));
        assert!(c.explanation.unwrap().contains("State: 1"));
    }

    #[test]
    fn test_auth_takes_priority_over_timeout() {
        let c = classify_raw(&raw("18456 login timeout expired"));
        assert_eq!(c.diagnosis, Diagnosis::AuthenticationFailed);
    }

    #[test]
    fn test_function_sequence_error_is_retryable() {
        let c = classify_raw(&raw("[HY010] [Microsoft][ODBC Driver 17] Function sequence error"));
        assert_eq!(c.diagnosis, Diagnosis::Transient);
        assert!(c.is_retryable());
    }

    #[test]
    fn test_deadlock_code_is_retryable() {
        let c = classify_raw(&raw("Transaction was chosen as victim").with_code(1205));
        assert!(c.is_retryable());
    }

    #[test]
    fn test_login_timeout_has_remediation() {
        let c = classify_raw(&raw("Login timeout expired"));
        assert_eq!(c.diagnosis, Diagnosis::ConnectivityTimeout);
        assert_eq!(c.suggestions.len(), 5);
        assert!(!c.is_retryable());
    }

    #[test]
    fn test_object_column_syntax_permission() {
        assert_eq!(
            classify_raw(&raw("Invalid column name 'FOO'.")).diagnosis,
            Diagnosis::InvalidColumn
        );
        assert_eq!(
            classify_raw(&raw("Invalid object name 'dbo.NOPE'.")).diagnosis,
            Diagnosis::InvalidObject
        );
        assert_eq!(
            classify_raw(&raw("Incorrect syntax near 'FROM'.")).diagnosis,
            Diagnosis::SyntaxError
        );
        assert_eq!(
            classify_raw(&raw("The SELECT permission was denied on the object")).diagnosis,
            Diagnosis::PermissionDenied
        );
    }

    #[test]
    fn test_secondary_connection_rules() {
        assert_eq!(
            classify_raw(&raw("Adaptive Server is unavailable or does not exist")).diagnosis,
            Diagnosis::ServerUnavailable
        );
        assert_eq!(
            classify_raw(&raw("Login failed for user 'x'")).diagnosis,
            Diagnosis::LoginFailed
        );
        assert_eq!(
            classify_raw(&raw("Could not open a connection to SQL Server")).diagnosis,
            Diagnosis::NetworkUnreachable
        );
    }

    #[test]
    fn test_unmatched_is_generic() {
        let c = classify_raw(&RawError::new("something odd happened", "IoError"));
        assert_eq!(c.diagnosis, Diagnosis::Generic);
        assert_eq!(c.message, "something odd happened");
        assert_eq!(c.error_type, "IoError");
        assert!(c.explanation.is_none());
        assert!(c.suggestions.is_empty());
    }

    #[test]
    fn test_unparseable_state_yields_parse_failure() {
        let c = classify_raw(&raw("Login failed (18456); State: 99999999999999999999"));
        assert_eq!(c.diagnosis, Diagnosis::ParseFailure);
        let explanation = c.explanation.unwrap();
        assert!(explanation.contains("Original error"));
        assert!(explanation.contains("number too large"));
    }

    #[test]
    fn test_classify_transfer_error() {
        let err = TransferError::Database(tiberius::error::Error::Io {
            kind: std::io::ErrorKind::ConnectionReset,
            message: "connection reset by peer".into(),
        });
        let c = classify(&err);
        assert_eq!(c.diagnosis, Diagnosis::Transient);
        assert_eq!(c.error_type, "DatabaseError");
    }

    #[test]
    fn test_error_response_from_probe_failure() {
        let classified = classify_raw(&raw("Login timeout expired"));
        let err = TransferError::ProbeFailed {
            endpoint: "db1:1433".into(),
            error: Box::new(classified),
        };
        let response = ErrorResponse::from(&err);
        assert!(!response.success);
        assert_eq!(response.diagnosis, Some(Diagnosis::ConnectivityTimeout));
        assert!(response.message.contains("db1:1433"));
        assert!(!response.suggestions.is_empty());
    }
}
