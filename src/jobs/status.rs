//! Read path for job status

use super::{Job, JobRegistry, JobStore};
use crate::{Result, ScanError};
use std::sync::Arc;

/// Answers status polls from the registry, falling back to the store.
/// Never writes to either.
#[derive(Clone)]
pub struct StatusService {
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
}

impl StatusService {
    pub fn new(registry: Arc<JobRegistry>, store: Arc<dyn JobStore>) -> Self {
        Self { registry, store }
    }

    pub async fn get_status(&self, token: &str) -> Result<Job> {
        if let Some(job) = self.registry.snapshot(token).await {
            return Ok(job);
        }
        self.store
            .load(token)
            .await?
            .ok_or_else(|| ScanError::NotFound(token.to_string()))
    }
}
