//! In-process status store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{JobStatusRecord, StatusStore};
use crate::error::Result;

/// Keeps records in a map for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<String, JobStatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, record: &JobStatusRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<JobStatusRecord>> {
        Ok(self.records.read().await.get(job_id).cloned())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
