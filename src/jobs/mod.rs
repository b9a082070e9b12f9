//! Scan jobs: the record, its state machine, and the services around it

pub mod registry;
pub mod scheduler;
pub mod status;
pub mod store;

use crate::scanner::TargetResult;
use crate::tools::ExternalTool;
use crate::{Result, ScanError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use registry::JobRegistry;
pub use scheduler::{JobRequest, PoolSnapshot, Scheduler};
pub use status::StatusService;
pub use store::{JobStore, JsonFileStore, MemoryStore};

/// Job lifecycle: Queued -> Running -> Complete | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Whether the AI summary path is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScanMode {
    #[default]
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "ai")]
    AiEnhanced,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Standard => write!(f, "standard"),
            ScanMode::AiEnhanced => write!(f, "ai"),
        }
    }
}

impl FromStr for ScanMode {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(ScanMode::Standard),
            "ai" | "ai-enhanced" => Ok(ScanMode::AiEnhanced),
            other => Err(ScanError::Config(format!("unknown scan mode '{}'", other))),
        }
    }
}

/// One scan batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub token: String,
    pub status: JobStatus,
    pub mode: ScanMode,
    pub total_targets: usize,
    pub completed_targets: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Why a failed job failed
    pub error: Option<String>,
    #[serde(default)]
    pub tools: Vec<ExternalTool>,
    /// One slot per target, in submission order
    pub results: Vec<TargetResult>,
}

impl Job {
    /// New queued job with a placeholder per target
    pub fn new(token: impl Into<String>, targets: &[String], mode: ScanMode, tools: Vec<ExternalTool>) -> Self {
        Self {
            token: token.into(),
            status: JobStatus::Queued,
            mode,
            total_targets: targets.len(),
            completed_targets: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            tools,
            results: targets.iter().map(TargetResult::pending).collect(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued -> Running; a no-op in any other state
    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        if self.status == JobStatus::Queued {
            self.status = JobStatus::Running;
            self.started_at = Some(at);
        }
    }

    /// Fill slot `index`. Each slot accepts exactly one write.
    pub fn record_result(&mut self, index: usize, mut result: TargetResult) -> Result<()> {
        if self.is_terminal() {
            return Err(ScanError::Scheduler(format!("job {} is already {}", self.token, self.status)));
        }
        let slot = self
            .results
            .get_mut(index)
            .ok_or_else(|| ScanError::Scheduler(format!("slot {} out of range for job {}", index, self.token)))?;
        if !slot.pending {
            return Err(ScanError::Scheduler(format!("slot {} of job {} already written", index, self.token)));
        }
        if self.completed_targets >= self.total_targets {
            return Err(ScanError::Scheduler(format!("job {} has no outstanding targets", self.token)));
        }

        result.pending = false;
        *slot = result;
        self.completed_targets += 1;
        Ok(())
    }

    /// Move to a terminal state, stamping `finished_at` once
    pub fn finish(&mut self, status: JobStatus, error: Option<String>, at: DateTime<Utc>) -> Result<()> {
        if !status.is_terminal() {
            return Err(ScanError::Scheduler(format!("{} is not a terminal status", status)));
        }
        if self.is_terminal() {
            return Err(ScanError::Scheduler(format!("job {} already finished", self.token)));
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(at);
        Ok(())
    }

    pub fn pending_targets(&self) -> usize {
        self.results.iter().filter(|r| r.pending).count()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            token: self.token.clone(),
            status: self.status,
            mode: self.mode,
            total_targets: self.total_targets,
            completed_targets: self.completed_targets,
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Listing entry for stored jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub token: String,
    pub status: JobStatus,
    pub mode: ScanMode,
    pub total_targets: usize,
    pub completed_targets: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
