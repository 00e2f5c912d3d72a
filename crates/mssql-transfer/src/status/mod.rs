//! Job status persistence.
//!
//! The [`StatusStore`] trait defines where job status records live:
//!
//! - **Memory**: [`MemoryStatusStore`], for tests and embedded use
//! - **File**: [`FileStatusStore`], one JSON document per job
//! - **MSSQL**: [`MssqlStatusStore`], a `job_status` table on the target
//!
//! The orchestrator never talks to a store directly. It goes through a
//! [`StatusReporter`], which throttles progress writes and swallows store
//! failures so a broken status sink never fails a transfer.

mod file;
mod memory;
mod mssql;

pub use file::FileStatusStore;
pub use memory::MemoryStatusStore;
pub use mssql::MssqlStatusStore;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TransferRequest;
use crate::error::Result;
use crate::stats::{JobStats, JobStatus, TableDetail, WarningEntry};

/// Persistence backend for job status records.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Prepare the backing storage. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Insert or replace the record for `record.job_id`.
    async fn save(&self, record: &JobStatusRecord) -> Result<()>;

    /// Load a record by job id.
    async fn load(&self, job_id: &str) -> Result<Option<JobStatusRecord>>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// The persisted state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    /// Submitted request with passwords redacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<TransferRequest>,
    #[serde(default)]
    pub config_hash: String,
    pub stats: JobStats,
    /// Terminal failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusRecord {
    /// A new PENDING record for a submitted request.
    pub fn pending(job_id: impl Into<String>, request: &TransferRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            progress: 0.0,
            request: Some(request.redacted()),
            config_hash: request.hash(),
            stats: JobStats::new(request.tables.len()),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh from a stats snapshot.
    pub fn apply(&mut self, stats: &JobStats, error: Option<String>) {
        self.status = stats.status;
        self.progress = stats.progress();
        self.stats = stats.clone();
        if error.is_some() {
            self.error = error;
        }
        self.updated_at = Utc::now();
    }
}

/// Status poll output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub table_status: BTreeMap<String, TableDetail>,
    /// Full statistics once the job is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub warnings: Vec<WarningEntry>,
}

impl From<&JobStatusRecord> for StatusView {
    fn from(record: &JobStatusRecord) -> Self {
        let stats = &record.stats;
        Self {
            job_id: record.job_id.clone(),
            status: record.status,
            progress: record.progress,
            table_status: stats.table_details.clone(),
            result: record.status.is_terminal().then(|| stats.clone()),
            error: record.error.clone(),
            start_time: stats.start_time,
            end_time: stats.end_time,
            duration_seconds: stats.duration_seconds(),
            warnings: stats.warnings.clone(),
        }
    }
}

struct ReporterState {
    record: JobStatusRecord,
    last_progress_write: Option<Instant>,
}

/// Writes status records for one job on behalf of the orchestrator.
pub struct StatusReporter {
    store: Arc<dyn StatusStore>,
    interval: Duration,
    state: Mutex<ReporterState>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn StatusStore>, record: JobStatusRecord, interval: Duration) -> Self {
        Self {
            store,
            interval,
            state: Mutex::new(ReporterState {
                record,
                last_progress_write: None,
            }),
        }
    }

    /// Record a stats snapshot. PROGRESS snapshots inside the throttle
    /// window update the in-memory record only. Snapshots overtaken by a
    /// newer one are dropped, except terminal ones. Returns whether the
    /// store was written.
    pub async fn report(&self, stats: &JobStats, error: Option<String>) -> bool {
        let mut state = self.state.lock().await;
        if !stats.status.is_terminal()
            && (state.record.status.is_terminal() || stats.is_behind(&state.record.stats))
        {
            debug!(
                "Dropping stale status snapshot for job {}",
                state.record.job_id
            );
            return false;
        }
        state.record.apply(stats, error);

        let now = Instant::now();
        if stats.status == JobStatus::Progress {
            if let Some(last) = state.last_progress_write {
                if now.duration_since(last) < self.interval {
                    return false;
                }
            }
            state.last_progress_write = Some(now);
        }

        match self.store.save(&state.record).await {
            Ok(()) => {
                debug!(
                    "Saved status {} for job {} ({})",
                    state.record.status,
                    state.record.job_id,
                    self.store.backend_type()
                );
                true
            }
            Err(e) => {
                warn!(
                    "Failed to save status for job {}: {}",
                    state.record.job_id, e
                );
                false
            }
        }
    }

    /// Latest in-memory record, including throttled updates.
    pub async fn record(&self) -> JobStatusRecord {
        self.state.lock().await.record.clone()
    }
}
