//! Job and table statistics.
//!
//! [`JobStats`] is owned by the orchestrator while a job runs and is only ever
//! handed out as a cloned snapshot. Counters only grow until the job reaches a
//! terminal status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::ClassifiedError;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Started,
    Progress,
    Success,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Started => "STARTED",
            JobStatus::Progress => "PROGRESS",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "STARTED" => Some(JobStatus::Started),
            "PROGRESS" => Some(JobStatus::Progress),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILURE" => Some(JobStatus::Failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-table status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableStatus {
    Processing,
    Completed,
    Failed,
}

/// Per-table progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDetail {
    pub status: TableStatus,

    /// Rows the table's SELECT returns.
    pub total_rows: u64,

    /// Rows committed to the target.
    pub transferred: u64,

    /// Rows in chunks that failed and were skipped.
    pub errors: u64,

    pub start_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
}

impl TableDetail {
    pub fn processing() -> Self {
        Self {
            status: TableStatus::Processing,
            total_rows: 0,
            transferred: 0,
            errors: 0,
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }
}

/// A chunk failure tolerated under `skip_errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningEntry {
    pub table: String,
    pub chunk: usize,
    pub error: ClassifiedError,
}

/// A table-level or job-level failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Absent for job-level errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub error: ClassifiedError,
}

/// Statistics for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total_tables: usize,
    pub completed_tables: usize,
    pub total_rows: u64,
    pub transferred_rows: u64,
    pub errors: Vec<ErrorEntry>,
    pub warnings: Vec<WarningEntry>,
    /// Keyed by source table name.
    pub table_details: BTreeMap<String, TableDetail>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(default)]
    pub cancelled: bool,
}

impl JobStats {
    pub fn new(total_tables: usize) -> Self {
        Self {
            total_tables,
            completed_tables: 0,
            total_rows: 0,
            transferred_rows: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            table_details: BTreeMap::new(),
            start_time: None,
            end_time: None,
            status: JobStatus::Pending,
            cancelled: false,
        }
    }

    /// Percentage of tables finished. A job with no tables is complete once
    /// it reaches a terminal status.
    pub fn progress(&self) -> f64 {
        if self.total_tables == 0 {
            return if self.status.is_terminal() { 100.0 } else { 0.0 };
        }
        let pct = self.completed_tables as f64 / self.total_tables as f64 * 100.0;
        (pct * 100.0).round() / 100.0
    }

    /// Wall time between start and end, when both are set.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Whether this snapshot predates `other`. Every counter here only
    /// grows while a job runs, so a snapshot lower on any of them is stale.
    pub fn is_behind(&self, other: &JobStats) -> bool {
        self.transferred_rows < other.transferred_rows
            || self.completed_tables < other.completed_tables
            || self.total_rows < other.total_rows
            || self.table_details.len() < other.table_details.len()
            || self.errors.len() < other.errors.len()
            || self.warnings.len() < other.warnings.len()
    }

    pub fn table_mut(&mut self, table: &str) -> Option<&mut TableDetail> {
        self.table_details.get_mut(table)
    }

    /// Names of tables that ended FAILED.
    pub fn failed_tables(&self) -> Vec<String> {
        self.table_details
            .iter()
            .filter(|(_, d)| d.status == TableStatus::Failed)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Emitted after every committed chunk and at each table and job transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub progress: f64,
    pub completed_tables: usize,
    pub total_tables: usize,
    pub transferred_rows: u64,
    pub total_rows: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn from_stats(job_id: &str, table: Option<&str>, stats: &JobStats) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: stats.status,
            table: table.map(str::to_string),
            progress: stats.progress(),
            completed_tables: stats.completed_tables,
            total_tables: stats.total_tables,
            transferred_rows: stats.transferred_rows,
            total_rows: stats.total_rows,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let mut stats = JobStats::new(3);
        assert_eq!(stats.progress(), 0.0);
        stats.completed_tables = 1;
        assert_eq!(stats.progress(), 33.33);
        stats.completed_tables = 3;
        assert_eq!(stats.progress(), 100.0);
    }

    #[test]
    fn test_is_behind_compares_growing_counters() {
        let older = JobStats::new(2);
        let mut newer = older.clone();
        assert!(!older.is_behind(&newer));

        newer.transferred_rows = 500;
        assert!(older.is_behind(&newer));
        assert!(!newer.is_behind(&older));

        let mut finished = older.clone();
        finished.completed_tables = 1;
        assert!(finished.is_behind(&newer));
    }

    #[test]
    fn test_zero_tables_complete_when_terminal() {
        let mut stats = JobStats::new(0);
        assert_eq!(stats.progress(), 0.0);
        stats.status = JobStatus::Success;
        assert_eq!(stats.progress(), 100.0);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&JobStatus::Progress).unwrap(), "\"PROGRESS\"");
        assert_eq!(
            serde_json::to_string(&TableStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
        assert_eq!(JobStatus::parse("FAILURE"), Some(JobStatus::Failure));
        assert_eq!(JobStatus::parse("failure"), None);
    }

    #[test]
    fn test_duration_requires_both_ends() {
        let mut stats = JobStats::new(1);
        assert!(stats.duration_seconds().is_none());
        let start = Utc::now();
        stats.start_time = Some(start);
        stats.end_time = Some(start + chrono::Duration::milliseconds(2500));
        assert_eq!(stats.duration_seconds(), Some(2.5));
    }

    #[test]
    fn test_job_level_error_omits_table() {
        let entry = ErrorEntry {
            table: None,
            error: ClassifiedError::plain("JobFailure", "Transfer cancelled"),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("\"table\""));
    }
}
