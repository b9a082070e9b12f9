//! Durable job storage
//!
//! Terminal jobs are written as one JSON document per token. Writes go to
//! a temporary file in the same directory and are renamed into place, so a
//! reader never sees a half-written job.

use super::{Job, JobSummary};
use crate::config::ScannerConfig;
use crate::{Result, ScanError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;

/// Persistence for finished jobs
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Write a job; saving the same token again overwrites it
    async fn save(&self, job: &Job) -> Result<()>;

    /// `Ok(None)` when the token was never stored
    async fn load(&self, token: &str) -> Result<Option<Job>>;
}

fn valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 64
        && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// JSON file per job under one directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store directory
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ScanError::Store(format!("cannot create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    /// Store at the configured directory, `~/.ipintel/jobs` by default
    pub fn open_default(config: &ScannerConfig) -> Result<Self> {
        Self::new(config.resolved_store_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{}.json", token))
    }

    fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Summaries of every stored job, newest first
    pub fn list(&self) -> Result<Vec<JobSummary>> {
        let mut summaries = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(ScanError::from)
                .and_then(|content| serde_json::from_str::<Job>(&content).map_err(ScanError::from));
            match parsed {
                Ok(job) => summaries.push(job.summary()),
                Err(e) => log::warn!("Skipping unreadable job file {}: {}", path.display(), e),
            }
        }

        summaries.sort_by(|a, b| {
            b.finished_at
                .unwrap_or(b.created_at)
                .cmp(&a.finished_at.unwrap_or(a.created_at))
        });
        Ok(summaries)
    }
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn save(&self, job: &Job) -> Result<()> {
        if !valid_token(&job.token) {
            return Err(ScanError::Store(format!("refusing to store invalid token '{}'", job.token)));
        }
        let bytes = serde_json::to_vec_pretty(job)?;
        let dir = self.dir.clone();
        let path = self.path_for(&job.token);

        tokio::task::spawn_blocking(move || Self::write_atomic(&dir, &path, &bytes))
            .await
            .map_err(|e| ScanError::Store(format!("write task failed: {}", e)))?
            .map_err(|e| ScanError::Store(format!("write failed: {}", e)))?;

        log::debug!("Stored job {} ({})", job.token, job.status);
        Ok(())
    }

    async fn load(&self, token: &str) -> Result<Option<Job>> {
        if !valid_token(token) {
            return Ok(None);
        }
        let content = match tokio::fs::read_to_string(self.path_for(token)).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ScanError::Store(format!("read failed for {}: {}", token, e))),
        };
        let job = serde_json::from_str(&content)
            .map_err(|e| ScanError::Store(format!("corrupt record for {}: {}", token, e)))?;
        Ok(Some(job))
    }
}

/// Process-local store, for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.token.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, token: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(token).cloned())
    }
}
