//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate_table, MIN_CHUNK_SIZE};

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl TransferRequest {
    /// Load a request from a YAML (or JSON) file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a request from YAML. JSON input is accepted as well.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let request: TransferRequest = serde_yaml::from_str(yaml)?;
        request.validate()?;
        Ok(request)
    }

    /// Validate the request.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 over the redacted request, stored with each job record.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(&self.redacted()).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
