//! ipintel - reachability and exposure scanning with risk assessment
//!
//! Submit a batch of targets, poll the job by token, read back one
//! risk-annotated result per target.

pub mod config;
pub mod enrichment;
pub mod error;
pub mod jobs;
pub mod network;
pub mod output;
pub mod ports;
pub mod risk;
pub mod scanner;
pub mod tools;

// Re-export commonly used types
pub use config::ScannerConfig;
pub use error::{ScanError, ScanResult, SummarizerError};
pub use jobs::{Job, JobRequest, JobStatus, ScanMode, Scheduler, StatusService};
pub use risk::{RiskAssessment, RiskLevel};
pub use scanner::{TargetResult, TargetWorker};
pub use tools::ExternalTool;

pub type Result<T> = std::result::Result<T, ScanError>;
