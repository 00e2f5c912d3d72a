//! Transfer orchestrator - job state machine and table loop.

#[cfg(test)]
pub(crate) mod fixtures;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::{classify, ClassifiedError};
use crate::config::{TableTransferSpec, TransferRequest, WriteMode};
use crate::error::TransferError;
use crate::query::build_insert_or_upsert;
use crate::reader::RowSource;
use crate::stats::{
    ErrorEntry, JobStats, JobStatus, ProgressEvent, TableDetail, TableStatus, WarningEntry,
};
use crate::status::StatusReporter;
use crate::writer::RowSink;

/// Chunks between throughput log lines.
const LOG_EVERY_CHUNKS: usize = 5;

/// How one table ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableOutcome {
    Completed,
    /// Failed, but tolerated under `skip_errors`.
    Skipped,
    /// Failed and aborts the job.
    Failed,
    /// Stopped at a chunk boundary because the job was cancelled.
    Cancelled,
    /// Stopped at a chunk boundary because another table failed.
    Aborted,
}

/// Why `transfer_table` stopped early.
enum Interrupt {
    Error(TransferError),
    Cancelled,
    Aborted,
}

impl From<TransferError> for Interrupt {
    fn from(e: TransferError) -> Self {
        Interrupt::Error(e)
    }
}

/// State shared by every table task of one job.
struct JobContext {
    job_id: String,
    chunk_size: usize,
    skip_errors: bool,
    source: Arc<dyn RowSource>,
    sink: Arc<dyn RowSink>,
    stats: Mutex<JobStats>,
    reporter: Option<Arc<StatusReporter>>,
    progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    /// Cancelled by the caller.
    cancel: CancellationToken,
    /// Child of `cancel`; also cancelled when a table failure aborts the job.
    abort: CancellationToken,
}

impl JobContext {
    fn stats(&self) -> MutexGuard<'_, JobStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate the stats and return a snapshot. The lock is released before
    /// the caller awaits anything.
    fn update(&self, f: impl FnOnce(&mut JobStats)) -> JobStats {
        let mut stats = self.stats();
        f(&mut stats);
        stats.clone()
    }

    fn emit(&self, table: Option<&str>, snapshot: &JobStats) {
        if let Some(ref tx) = self.progress_tx {
            let event = ProgressEvent::from_stats(&self.job_id, table, snapshot);
            if tx.try_send(event).is_err() {
                debug!("Progress channel full or closed, dropping event");
            }
        }
    }

    async fn report(&self, snapshot: &JobStats, error: Option<String>) {
        if let Some(ref reporter) = self.reporter {
            reporter.report(snapshot, error).await;
        }
    }

    async fn publish(&self, table: Option<&str>, snapshot: JobStats) {
        self.emit(table, &snapshot);
        self.report(&snapshot, None).await;
    }
}

/// Runs one transfer job from STARTED to SUCCESS or FAILURE.
pub struct TransferOrchestrator {
    job_id: String,
    request: Arc<TransferRequest>,
    source: Arc<dyn RowSource>,
    sink: Arc<dyn RowSink>,
    reporter: Option<Arc<StatusReporter>>,
    progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    cancel: CancellationToken,
}

impl TransferOrchestrator {
    pub fn new(
        job_id: impl Into<String>,
        request: Arc<TransferRequest>,
        source: Arc<dyn RowSource>,
        sink: Arc<dyn RowSink>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            request,
            source,
            sink,
            reporter: None,
            progress_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Persist status through `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Send progress events to `tx`. Events are dropped when the channel is full.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Stop at the next chunk boundary when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Execute the job. Always returns the final statistics; failures are
    /// recorded in them rather than returned.
    pub async fn run(self) -> JobStats {
        let started = Instant::now();
        let ctx = Arc::new(JobContext {
            job_id: self.job_id.clone(),
            chunk_size: self.request.chunk_size.max(1),
            skip_errors: self.request.skip_errors,
            source: self.source.clone(),
            sink: self.sink.clone(),
            stats: Mutex::new(JobStats::new(self.request.tables.len())),
            reporter: self.reporter.clone(),
            progress_tx: self.progress_tx.clone(),
            abort: self.cancel.child_token(),
            cancel: self.cancel.clone(),
        });

        info!(
            "Starting transfer job {}: {} tables, chunk_size={}, workers={}",
            ctx.job_id,
            self.request.tables.len(),
            ctx.chunk_size,
            self.request.max_workers
        );

        let snapshot = ctx.update(|s| {
            s.status = JobStatus::Started;
            s.start_time = Some(Utc::now());
        });
        ctx.publish(None, snapshot).await;

        let (failure, interrupted) = match Self::probe(&ctx).await {
            Ok(()) => Self::transfer_tables(&ctx, &self.request).await,
            Err(message) => (Some(message), false),
        };

        // A cancel that lands after the last table finished changes nothing.
        let cancelled = interrupted && ctx.cancel.is_cancelled();
        let final_stats = ctx.update(|s| {
            if cancelled {
                s.cancelled = true;
                s.errors.push(ErrorEntry {
                    table: None,
                    error: ClassifiedError::plain("Cancelled", "Transfer cancelled"),
                });
            }
            s.status = if cancelled || failure.is_some() {
                JobStatus::Failure
            } else {
                JobStatus::Success
            };
            s.end_time = Some(Utc::now());
        });

        // Disposal runs regardless of outcome.
        ctx.source.close().await;
        ctx.sink.close().await;

        let error = if cancelled {
            Some("Transfer cancelled".to_string())
        } else {
            failure
        };
        ctx.emit(None, &final_stats);
        ctx.report(&final_stats, error.clone()).await;

        let elapsed = started.elapsed().as_secs_f64();
        match error {
            None => info!(
                "Job {} completed: {}/{} tables, {} rows in {:.1}s",
                ctx.job_id,
                final_stats.completed_tables,
                final_stats.total_tables,
                final_stats.transferred_rows,
                elapsed
            ),
            Some(ref e) => error!("Job {} failed after {:.1}s: {}", ctx.job_id, elapsed, e),
        }

        final_stats
    }

    /// Probe both sides. On failure the job-level error is recorded and its
    /// message returned.
    async fn probe(ctx: &JobContext) -> std::result::Result<(), String> {
        let result = match ctx.source.probe().await {
            Ok(()) => ctx.sink.probe().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let classified = classify(&e);
                let message = format!("Connection probe failed: {}", classified.message);
                ctx.update(|s| {
                    s.errors.push(ErrorEntry {
                        table: None,
                        error: classified,
                    })
                });
                Err(message)
            }
        }
    }

    /// Run every table through the worker pool. Returns the first
    /// job-aborting failure, if any, and whether some table was stopped or
    /// never started because the job was interrupted.
    async fn transfer_tables(
        ctx: &Arc<JobContext>,
        request: &TransferRequest,
    ) -> (Option<String>, bool) {
        let workers = request.max_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut interrupted = false;

        for spec in &request.tables {
            if ctx.abort.is_cancelled() {
                info!("Stopping before {}: job interrupted", spec.source_table);
                interrupted = true;
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // A sequential predecessor may have failed while we waited.
            if ctx.abort.is_cancelled() {
                info!("Stopping before {}: job interrupted", spec.source_table);
                interrupted = true;
                break;
            }

            let task_ctx = ctx.clone();
            let spec = spec.clone();
            tasks.spawn(async move {
                let outcome = Self::process_table(&task_ctx, &spec).await;
                drop(permit);
                (spec.source_table, outcome)
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((table, TableOutcome::Failed)) => {
                    failure.get_or_insert_with(|| format!("Table {} failed", table));
                }
                Ok((table, TableOutcome::Aborted)) => {
                    debug!("{}: stopped after another table failed", table);
                    interrupted = true;
                }
                Ok((_, TableOutcome::Cancelled)) => interrupted = true,
                Ok(_) => {}
                Err(e) => {
                    error!("Table task panicked: {}", e);
                    ctx.abort.cancel();
                    ctx.update(|s| {
                        s.errors.push(ErrorEntry {
                            table: None,
                            error: ClassifiedError::plain("JobFailure", e.to_string()),
                        })
                    });
                    failure.get_or_insert_with(|| format!("Table task panicked: {}", e));
                }
            }
        }
        (failure, interrupted)
    }

    /// One table from PROCESSING to COMPLETED or FAILED.
    async fn process_table(ctx: &JobContext, spec: &TableTransferSpec) -> TableOutcome {
        let table = spec.source_table.clone();
        info!("Processing table: {}", table);
        ctx.update(|s| {
            s.table_details
                .insert(table.clone(), TableDetail::processing());
        });

        let result = Self::transfer_table(ctx, spec).await;

        let (outcome, log_error) = match result {
            Ok(()) => (TableOutcome::Completed, None),
            Err(Interrupt::Cancelled) => (TableOutcome::Cancelled, None),
            Err(Interrupt::Aborted) => (TableOutcome::Aborted, None),
            Err(Interrupt::Error(e)) => {
                let outcome = if ctx.skip_errors {
                    TableOutcome::Skipped
                } else {
                    // Stop sibling tables at their next chunk boundary.
                    ctx.abort.cancel();
                    TableOutcome::Failed
                };
                (outcome, Some(e))
            }
        };

        let classified = log_error.as_ref().map(classify);
        let snapshot = ctx.update(|s| {
            let Some(detail) = s.table_details.get_mut(&table) else {
                return;
            };
            detail.end_time = Some(Utc::now());
            match outcome {
                TableOutcome::Completed => detail.status = TableStatus::Completed,
                TableOutcome::Cancelled => {
                    detail.status = TableStatus::Failed;
                    detail.error = Some(ClassifiedError::plain("Cancelled", "cancelled"));
                }
                TableOutcome::Aborted => {
                    detail.status = TableStatus::Failed;
                    detail.error = Some(ClassifiedError::plain(
                        "JobFailure",
                        "aborted after another table failed",
                    ));
                }
                TableOutcome::Skipped | TableOutcome::Failed => {
                    detail.status = TableStatus::Failed;
                    detail.error = classified.clone();
                }
            }
            if let Some(ref error) = classified {
                s.errors.push(ErrorEntry {
                    table: Some(table.clone()),
                    error: error.clone(),
                });
            }
            if matches!(outcome, TableOutcome::Completed | TableOutcome::Skipped) {
                s.completed_tables += 1;
            }
            if outcome == TableOutcome::Cancelled {
                s.cancelled = true;
            }
            s.status = JobStatus::Progress;
        });

        let detail = snapshot.table_details.get(&table);
        let transferred = detail.map(|d| d.transferred).unwrap_or(0);
        let total = detail.map(|d| d.total_rows).unwrap_or(0);
        match (outcome, log_error) {
            (TableOutcome::Completed, _) => {
                info!("Table {} completed: {}/{} rows", table, transferred, total)
            }
            (TableOutcome::Skipped, Some(e)) => {
                warn!("Table {} skipped due to errors: {}", table, e)
            }
            (TableOutcome::Failed, Some(e)) => error!("Table {} failed: {}", table, e),
            (TableOutcome::Cancelled, _) => warn!("Table {} cancelled", table),
            _ => warn!("Table {} stopped", table),
        }

        ctx.publish(Some(&table), snapshot).await;
        outcome
    }

    fn interrupted(ctx: &JobContext) -> Option<Interrupt> {
        if ctx.cancel.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if ctx.abort.is_cancelled() {
            Some(Interrupt::Aborted)
        } else {
            None
        }
    }

    async fn transfer_table(
        ctx: &JobContext,
        spec: &TableTransferSpec,
    ) -> std::result::Result<(), Interrupt> {
        let table = spec.source_table.as_str();
        if let Some(interrupt) = Self::interrupted(ctx) {
            return Err(interrupt);
        }

        let total = ctx.source.count_rows(spec).await?;
        ctx.update(|s| {
            s.total_rows += total;
            if let Some(detail) = s.table_mut(table) {
                detail.total_rows = total;
            }
        });
        info!("Table {}: {} rows to transfer", table, total);

        // Once per table, before any chunk and before the empty-table shortcut.
        if spec.write_mode == WriteMode::Truncate {
            ctx.sink.clear_table(spec).await?;
        }

        if total == 0 {
            info!("Table {} is empty, skipping transfer", table);
            return Ok(());
        }

        let columns = ctx.source.resolve_columns(spec).await?;
        debug!("{}: columns {:?}", table, columns);
        let plan = build_insert_or_upsert(spec, &columns)?;

        let chunk_size = ctx.chunk_size;
        let started = Instant::now();
        let mut transferred: u64 = 0;
        let mut offset: u64 = 0;
        let mut index: usize = 0;

        while offset < total {
            if let Some(interrupt) = Self::interrupted(ctx) {
                return Err(interrupt);
            }
            let expected = (total - offset).min(chunk_size as u64);

            let mut rows_read = None;
            let outcome = match ctx
                .source
                .read_chunk(spec, &columns, offset, chunk_size)
                .await
            {
                Ok(chunk) if chunk.is_empty() => {
                    info!("{}: no more data at offset {}", table, offset);
                    break;
                }
                Ok(chunk) => {
                    rows_read = Some(chunk.len() as u64);
                    ctx.sink.write_chunk(&plan, chunk).await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(written) => {
                    transferred += written;
                    let snapshot = ctx.update(|s| {
                        s.transferred_rows += written;
                        s.status = JobStatus::Progress;
                        if let Some(detail) = s.table_mut(table) {
                            detail.transferred += written;
                        }
                    });
                    if (index + 1) % LOG_EVERY_CHUNKS == 0 {
                        let elapsed = started.elapsed().as_secs_f64();
                        let rate = if elapsed > 0.0 {
                            transferred as f64 / elapsed
                        } else {
                            0.0
                        };
                        info!(
                            "{}: {}/{} rows ({:.1} rows/sec)",
                            table, transferred, total, rate
                        );
                    }
                    ctx.publish(Some(table), snapshot).await;
                }
                Err(e) if ctx.skip_errors => {
                    let failed_rows = rows_read.unwrap_or(expected);
                    let classified = classify(&e);
                    warn!("{}: error in chunk {}: {}", table, index, classified.message);
                    ctx.update(|s| {
                        if let Some(detail) = s.table_mut(table) {
                            detail.errors += failed_rows;
                        }
                        s.warnings.push(WarningEntry {
                            table: table.to_string(),
                            chunk: index,
                            error: classified,
                        });
                    });
                }
                Err(e) => return Err(TransferError::chunk(table, index, e).into()),
            }

            offset += chunk_size as u64;
            index += 1;
        }

        Ok(())
    }
}
