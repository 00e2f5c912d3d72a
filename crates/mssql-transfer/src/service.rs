//! Job submission, execution queue and status polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classify::{classify, ClassifiedError};
use crate::config::{DatabaseConfig, TransferRequest};
use crate::connection::{ConnectionFactory, ProbeResult};
use crate::error::{Result, TransferError};
use crate::orchestrator::TransferOrchestrator;
use crate::reader::{ChunkedReader, RowSource};
use crate::stats::{ErrorEntry, JobStats, JobStatus, ProgressEvent};
use crate::status::{JobStatusRecord, StatusReporter, StatusStore, StatusView};
use crate::writer::{ChunkWriter, RowSink};

/// Path prefix of the status URL handed back on submission.
pub const STATUS_URL_PREFIX: &str = "/api/v1/jobs";

/// Opens the two sides of a job.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connectivity check with a dedicated connection. Never errors.
    async fn probe(&self, config: &DatabaseConfig) -> ProbeResult;

    async fn open_source(&self, request: &TransferRequest) -> Result<Arc<dyn RowSource>>;

    async fn open_sink(&self, request: &TransferRequest) -> Result<Arc<dyn RowSink>>;
}

/// [`Connector`] backed by pooled tiberius connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlConnector;

#[async_trait]
impl Connector for MssqlConnector {
    async fn probe(&self, config: &DatabaseConfig) -> ProbeResult {
        ConnectionFactory::probe(config).await
    }

    async fn open_source(&self, request: &TransferRequest) -> Result<Arc<dyn RowSource>> {
        let factory = ConnectionFactory::open(&request.source, &request.engine).await?;
        Ok(Arc::new(ChunkedReader::new(Arc::new(factory))))
    }

    async fn open_sink(&self, request: &TransferRequest) -> Result<Arc<dyn RowSink>> {
        let factory = ConnectionFactory::open(&request.target, &request.engine).await?;
        Ok(Arc::new(ChunkWriter::new(Arc::new(factory))))
    }
}

/// Service-wide settings.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Jobs executing at the same time. Further jobs queue.
    pub concurrent_jobs: usize,
    /// Receives progress events from every job.
    pub progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            concurrent_jobs: 1,
            progress: None,
        }
    }
}

/// Summary of a submitted job's tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitDetails {
    pub tables_count: usize,
    pub tables: Vec<String>,
    pub chunk_size: usize,
}

/// Returned by [`TransferService::submit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub status_url: String,
    pub details: SubmitDetails,
}

struct JobHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<JobStatusRecord>>,
}

/// Everything a spawned job needs, detached from the service.
#[derive(Clone)]
struct Runtime {
    connector: Arc<dyn Connector>,
    store: Arc<dyn StatusStore>,
    queue: Arc<Semaphore>,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

/// Accepts transfer requests and runs them in the background.
pub struct TransferService {
    runtime: Runtime,
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl TransferService {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn StatusStore>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            runtime: Runtime {
                connector,
                store,
                queue: Arc::new(Semaphore::new(settings.concurrent_jobs.max(1))),
                progress: settings.progress,
            },
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobHandle>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job, dropping handles of submitted jobs that already
    /// finished without anyone waiting on them.
    fn track(&self, job_id: &str, handle: JobHandle) {
        let mut jobs = self.jobs();
        jobs.retain(|_, h| h.task.as_ref().map_or(true, |task| !task.is_finished()));
        jobs.insert(job_id.to_string(), handle);
    }

    /// Number of jobs the service still holds a handle for.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs().len()
    }

    /// Validate, probe, persist PENDING and queue the job.
    pub async fn submit(&self, request: TransferRequest) -> Result<SubmitReceipt> {
        let cancel = CancellationToken::new();
        let (receipt, task) = self.start(request, cancel.clone()).await?;
        self.track(
            &receipt.job_id,
            JobHandle {
                cancel,
                task: Some(task),
            },
        );
        Ok(receipt)
    }

    /// Submit and wait for the terminal record.
    pub async fn run(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
    ) -> Result<JobStatusRecord> {
        let (receipt, task) = self.start(request, cancel.clone()).await?;
        self.track(&receipt.job_id, JobHandle { cancel, task: None });
        let result = join(&receipt.job_id, task).await;
        self.jobs().remove(&receipt.job_id);
        result
    }

    /// Wait for a job submitted through [`submit`](Self::submit).
    pub async fn wait(&self, job_id: &str) -> Result<JobStatusRecord> {
        let task = self
            .jobs()
            .get_mut(job_id)
            .and_then(|handle| handle.task.take());
        match task {
            Some(task) => {
                let result = join(job_id, task).await;
                self.jobs().remove(job_id);
                result
            }
            None => self
                .runtime
                .store
                .load(job_id)
                .await?
                .ok_or_else(|| TransferError::JobNotFound(job_id.to_string())),
        }
    }

    /// Current status of a job.
    pub async fn status(&self, job_id: &str) -> Result<StatusView> {
        match self.runtime.store.load(job_id).await? {
            Some(record) => Ok(StatusView::from(&record)),
            None => Err(TransferError::JobNotFound(job_id.to_string())),
        }
    }

    /// Cancel a queued or running job. It stops at its next chunk boundary.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        match self.jobs().get(job_id) {
            Some(handle) => {
                info!("Cancelling job {}", job_id);
                handle.cancel.cancel();
                Ok(())
            }
            None => Err(TransferError::JobNotFound(job_id.to_string())),
        }
    }

    pub async fn probe(&self, config: &DatabaseConfig) -> ProbeResult {
        self.runtime.connector.probe(config).await
    }

    async fn start(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
    ) -> Result<(SubmitReceipt, JoinHandle<JobStatusRecord>)> {
        request.validate()?;

        // No job exists until both sides answer.
        self.probe(&request.source).await.into_result()?;
        self.probe(&request.target).await.into_result()?;

        let job_id = Uuid::new_v4().to_string();
        let record = JobStatusRecord::pending(&job_id, &request);
        self.runtime.store.save(&record).await?;

        let receipt = SubmitReceipt {
            job_id: job_id.clone(),
            status: JobStatus::Pending,
            status_url: format!("{}/{}", STATUS_URL_PREFIX, job_id),
            details: SubmitDetails {
                tables_count: request.tables.len(),
                tables: request
                    .tables
                    .iter()
                    .map(|t| t.source_table.clone())
                    .collect(),
                chunk_size: request.chunk_size,
            },
        };
        info!(
            "Job {} queued: {} tables, chunk_size={}",
            job_id, receipt.details.tables_count, request.chunk_size
        );

        let runtime = self.runtime.clone();
        let task = tokio::spawn(execute(runtime, Arc::new(request), record, cancel));
        Ok((receipt, task))
    }
}

async fn join(job_id: &str, task: JoinHandle<JobStatusRecord>) -> Result<JobStatusRecord> {
    task.await
        .map_err(|e| TransferError::Job(format!("job {} task failed: {}", job_id, e)))
}

/// Queue, open both sides and run the orchestrator.
async fn execute(
    runtime: Runtime,
    request: Arc<TransferRequest>,
    record: JobStatusRecord,
    cancel: CancellationToken,
) -> JobStatusRecord {
    let job_id = record.job_id.clone();
    let reporter = Arc::new(StatusReporter::new(
        runtime.store.clone(),
        record,
        Duration::from_millis(request.engine.status_interval_ms),
    ));

    let _permit = tokio::select! {
        permit = runtime.queue.clone().acquire_owned() => permit.ok(),
        _ = cancel.cancelled() => None,
    };
    if cancel.is_cancelled() {
        warn!("Job {} cancelled before it started", job_id);
        let mut stats = failed_stats(&request, ClassifiedError::plain("Cancelled", "Transfer cancelled"));
        stats.cancelled = true;
        reporter
            .report(&stats, Some("Transfer cancelled".to_string()))
            .await;
        return reporter.record().await;
    }

    let source = match runtime.connector.open_source(&request).await {
        Ok(source) => source,
        Err(e) => return fail_before_start(&reporter, &request, &job_id, e).await,
    };
    let sink = match runtime.connector.open_sink(&request).await {
        Ok(sink) => sink,
        Err(e) => {
            source.close().await;
            return fail_before_start(&reporter, &request, &job_id, e).await;
        }
    };

    let mut orchestrator = TransferOrchestrator::new(&job_id, request, source, sink)
        .with_reporter(reporter.clone())
        .with_cancellation(cancel);
    if let Some(tx) = runtime.progress {
        orchestrator = orchestrator.with_progress(tx);
    }
    orchestrator.run().await;

    reporter.record().await
}

fn failed_stats(request: &TransferRequest, error: ClassifiedError) -> JobStats {
    let now = Utc::now();
    let mut stats = JobStats::new(request.tables.len());
    stats.status = JobStatus::Failure;
    stats.start_time = Some(now);
    stats.end_time = Some(now);
    stats.errors.push(ErrorEntry { table: None, error });
    stats
}

async fn fail_before_start(
    reporter: &StatusReporter,
    request: &TransferRequest,
    job_id: &str,
    err: TransferError,
) -> JobStatusRecord {
    error!("Job {} could not open connections: {}", job_id, err);
    let classified = classify(&err);
    let message = classified.message.clone();
    reporter
        .report(&failed_stats(request, classified), Some(message))
        .await;
    reporter.record().await
}
