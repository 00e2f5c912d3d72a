//! In-memory source and sink for orchestration tests.

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{TableTransferSpec, WriteMode};
use crate::core::{Chunk, SqlValue};
use crate::error::{Result, TransferError};
use crate::query::WritePlan;
use crate::reader::RowSource;
use crate::writer::RowSink;

#[derive(Debug, Clone, Default)]
pub(crate) struct MemTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl MemTable {
    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }
}

/// `ID INT, NAME NVARCHAR` rows named `<prefix>-<id>`.
pub(crate) fn parts(ids: RangeInclusive<i32>, prefix: &str) -> MemTable {
    MemTable {
        columns: vec!["ID".into(), "NAME".into()],
        rows: ids
            .map(|id| vec![SqlValue::I32(id), SqlValue::Text(format!("{}-{}", prefix, id))])
            .collect(),
    }
}

#[derive(Default)]
pub(crate) struct MemoryDatabase {
    tables: Mutex<HashMap<String, MemTable>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemTable>> {
        self.tables.lock().unwrap()
    }

    pub fn create(&self, name: &str, table: MemTable) {
        self.lock().insert(name.to_string(), table);
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.lock().get(name).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn sorted_ids(&self, name: &str) -> Vec<i64> {
        let tables = self.lock();
        let Some(table) = tables.get(name) else {
            return Vec::new();
        };
        let idx = table.index_of("ID").unwrap();
        let mut ids: Vec<i64> = table.rows.iter().filter_map(|r| r[idx].as_i64()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn value(&self, name: &str, id: i64, column: &str) -> Option<SqlValue> {
        let tables = self.lock();
        let table = tables.get(name)?;
        let id_idx = table.index_of("ID")?;
        let col_idx = table.index_of(column)?;
        table
            .rows
            .iter()
            .find(|r| r[id_idx].as_i64() == Some(id))
            .map(|r| r[col_idx].clone())
    }
}

pub(crate) struct MemorySource {
    db: Arc<MemoryDatabase>,
    failing_reads: Mutex<HashSet<(String, u64)>>,
    reads: AtomicUsize,
    closed: AtomicBool,
}

impl MemorySource {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self {
            db,
            failing_reads: Mutex::new(HashSet::new()),
            reads: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Fail the chunk read of `table` starting at `offset`.
    pub fn fail_read(&self, table: &str, offset: u64) {
        self.failing_reads
            .lock()
            .unwrap()
            .insert((table.to_string(), offset));
    }

    /// Chunk reads attempted.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn table(&self, spec: &TableTransferSpec) -> Result<MemTable> {
        self.db.lock().get(&spec.source_table).cloned().ok_or_else(|| {
            TransferError::table(
                &spec.source_table,
                format!("Invalid object name '{}'.", spec.source_table),
            )
        })
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn count_rows(&self, spec: &TableTransferSpec) -> Result<u64> {
        let rows = self.table(spec)?.rows.len() as u64;
        Ok(spec.row_limit.map_or(rows, |limit| rows.min(limit)))
    }

    async fn resolve_columns(&self, spec: &TableTransferSpec) -> Result<Vec<String>> {
        match spec.selected_columns {
            Some(ref columns) => Ok(columns.clone()),
            None => Ok(self.table(spec)?.columns),
        }
    }

    async fn read_chunk(
        &self,
        spec: &TableTransferSpec,
        columns: &[String],
        offset: u64,
        size: usize,
    ) -> Result<Chunk> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_reads
            .lock()
            .unwrap()
            .contains(&(spec.source_table.clone(), offset))
        {
            return Err(TransferError::Job(
                "Transaction (Process ID 61) was deadlocked on lock resources".into(),
            ));
        }

        let table = self.table(spec)?;
        let end = spec
            .row_limit
            .map_or(table.rows.len(), |l| table.rows.len().min(l as usize));
        let start = (offset as usize).min(end);
        let stop = (start + size).min(end);
        let indexes: Vec<usize> = columns
            .iter()
            .map(|c| table.index_of(c).unwrap())
            .collect();
        let rows = table.rows[start..stop]
            .iter()
            .map(|row| indexes.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Chunk::new(columns.to_vec(), rows)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SinkState {
    attempts: HashMap<String, usize>,
    committed: HashMap<String, usize>,
    failing_writes: HashSet<(String, usize)>,
    total_committed: usize,
    truncates: usize,
    probe_error: Option<String>,
    cancel_after: Option<(usize, CancellationToken)>,
}

pub(crate) struct MemorySink {
    db: Arc<MemoryDatabase>,
    state: Mutex<SinkState>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self {
            db,
            state: Mutex::new(SinkState::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Fail the `attempt`-th (0-based) chunk write into `target`.
    pub fn fail_write(&self, target: &str, attempt: usize) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert((target.to_string(), attempt));
    }

    pub fn fail_probe(&self, message: &str) {
        self.state.lock().unwrap().probe_error = Some(message.to_string());
    }

    /// Cancel `token` once `writes` chunks have been committed.
    pub fn cancel_after_writes(&self, writes: usize, token: CancellationToken) {
        self.state.lock().unwrap().cancel_after = Some((writes, token));
    }

    /// Chunks committed into `target`.
    pub fn writes_for(&self, target: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    pub fn truncates(&self) -> usize {
        self.state.lock().unwrap().truncates
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RowSink for MemorySink {
    async fn probe(&self) -> Result<()> {
        match self.state.lock().unwrap().probe_error {
            Some(ref message) => Err(TransferError::Job(message.clone())),
            None => Ok(()),
        }
    }

    async fn clear_table(&self, spec: &TableTransferSpec) -> Result<()> {
        self.state.lock().unwrap().truncates += 1;
        if let Some(table) = self.db.lock().get_mut(spec.target_name()) {
            table.rows.clear();
        }
        Ok(())
    }

    async fn write_chunk(&self, plan: &WritePlan, chunk: Chunk) -> Result<u64> {
        let target = plan.target().to_string();
        let mut state = self.state.lock().unwrap();
        let attempt = {
            let n = state.attempts.entry(target.clone()).or_insert(0);
            *n += 1;
            *n - 1
        };
        if state.failing_writes.contains(&(target.clone(), attempt)) {
            // Nothing applied: the whole chunk rolls back.
            return Err(TransferError::Job(format!(
                "Violation of PRIMARY KEY constraint in chunk write {}",
                attempt
            )));
        }

        let written = chunk.len() as u64;
        {
            let mut tables = self.db.lock();
            let table = tables.entry(target.clone()).or_insert_with(|| MemTable {
                columns: plan.target_columns().to_vec(),
                rows: Vec::new(),
            });
            let layout: Vec<usize> = table
                .columns
                .iter()
                .map(|c| {
                    plan.target_columns()
                        .iter()
                        .position(|t| t.eq_ignore_ascii_case(c))
                        .unwrap()
                })
                .collect();
            let key = plan.key_column().and_then(|k| table.index_of(k));

            for row in chunk.rows {
                let stored: Vec<SqlValue> = layout.iter().map(|&i| row[i].clone()).collect();
                match (plan.mode(), key) {
                    (WriteMode::Upsert, Some(k)) => {
                        match table.rows.iter_mut().find(|r| r[k] == stored[k]) {
                            Some(existing) => *existing = stored,
                            None => table.rows.push(stored),
                        }
                    }
                    _ => table.rows.push(stored),
                }
            }
        }

        *state.committed.entry(target).or_insert(0) += 1;
        state.total_committed += 1;
        if let Some((after, ref token)) = state.cancel_after {
            if state.total_committed >= after {
                token.cancel();
            }
        }
        Ok(written)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
