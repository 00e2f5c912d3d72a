//! Directory of JSON status documents, one per job.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{JobStatusRecord, StatusStore};
use crate::error::{Result, TransferError};

/// Stores each record as `<dir>/<job_id>.json`.
pub struct FileStatusStore {
    dir: PathBuf,
}

impl FileStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for a job id, or `None` if the id could escape the directory.
    fn path_for(&self, job_id: &str) -> Option<PathBuf> {
        let safe = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.dir.join(format!("{}.json", job_id)))
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn save(&self, record: &JobStatusRecord) -> Result<()> {
        let path = self.path_for(&record.job_id).ok_or_else(|| {
            TransferError::Status(format!("Invalid job id: {}", record.job_id))
        })?;
        let content = serde_json::to_string_pretty(record)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<JobStatusRecord>> {
        let Some(path) = self.path_for(job_id) else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
