//! Scripted [`SqlExecutor`] for reader and writer tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::SqlExecutor;
use crate::core::SqlValue;
use crate::error::{Result, TransferError};
use crate::query::Statement;

/// Replays queued responses in order and records every statement it sees.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    scalars: Mutex<VecDeque<Option<i64>>>,
    column_names: Mutex<VecDeque<Vec<String>>>,
    strings: Mutex<VecDeque<Vec<String>>>,
    rows: Mutex<VecDeque<Result<Vec<Vec<SqlValue>>>>>,
    transaction_failures: Mutex<VecDeque<String>>,
    log: Mutex<Vec<String>>,
    transactions: Mutex<Vec<Vec<Statement>>>,
    closed: AtomicBool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_scalar(&self, value: Option<i64>) {
        self.scalars.lock().unwrap().push_back(value);
    }

    pub fn push_column_names(&self, names: &[&str]) {
        self.column_names
            .lock()
            .unwrap()
            .push_back(names.iter().map(|s| s.to_string()).collect());
    }

    pub fn push_strings(&self, values: &[&str]) {
        self.strings
            .lock()
            .unwrap()
            .push_back(values.iter().map(|s| s.to_string()).collect());
    }

    pub fn push_rows(&self, rows: Vec<Vec<SqlValue>>) {
        self.rows.lock().unwrap().push_back(Ok(rows));
    }

    pub fn push_row_error(&self, message: &str) {
        self.rows
            .lock()
            .unwrap()
            .push_back(Err(TransferError::Job(message.to_string())));
    }

    /// Fail the next transaction with `message`; it is recorded but not committed.
    pub fn fail_next_transaction(&self, message: &str) {
        self.transaction_failures
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    /// Every SQL text seen, in order.
    pub fn sql_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Committed transactions.
    pub fn transactions(&self) -> Vec<Vec<Statement>> {
        self.transactions.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, sql: &str) {
        self.log.lock().unwrap().push(sql.to_string());
    }
}

#[async_trait]
impl SqlExecutor for ScriptedExecutor {
    fn endpoint(&self) -> String {
        "scripted:1433".to_string()
    }

    async fn ping(&self) -> Result<()> {
        self.record("SELECT 1");
        Ok(())
    }

    async fn query_scalar(&self, sql: &str) -> Result<Option<i64>> {
        self.record(sql);
        Ok(self.scalars.lock().unwrap().pop_front().flatten())
    }

    async fn query_column_names(&self, sql: &str) -> Result<Vec<String>> {
        self.record(sql);
        Ok(self.column_names.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn query_strings(&self, statement: &Statement) -> Result<Vec<String>> {
        self.record(&statement.sql);
        Ok(self.strings.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn query_rows(&self, statement: &Statement) -> Result<Vec<Vec<SqlValue>>> {
        self.record(&statement.sql);
        self.rows.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
    }

    async fn execute(&self, statement: &Statement) -> Result<u64> {
        self.record(&statement.sql);
        Ok(0)
    }

    async fn execute_in_transaction(&self, statements: &[Statement]) -> Result<u64> {
        self.record("BEGIN TRANSACTION");
        for statement in statements {
            self.record(&statement.sql);
        }
        if let Some(message) = self.transaction_failures.lock().unwrap().pop_front() {
            self.record("ROLLBACK TRANSACTION");
            return Err(TransferError::Job(message));
        }
        self.record("COMMIT TRANSACTION");
        self.transactions.lock().unwrap().push(statements.to_vec());
        Ok(statements.len() as u64)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
