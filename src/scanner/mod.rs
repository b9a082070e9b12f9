//! Per-target result model and the worker that produces it

pub mod worker;

use crate::enrichment::Metadata;
use crate::network::{AccessibilityTest, OpenPort};
use crate::risk::{Assessor, RiskAssessment, RiskLevel};
use crate::tools::ToolFinding;
use serde::{Deserialize, Serialize};

pub use worker::TargetWorker;

/// Sentinel address for targets that never resolved
pub const UNKNOWN_IP: &str = "unknown";

/// Everything learned about one submitted target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    /// Target exactly as submitted
    pub target: String,

    /// Resolved address, or "unknown"
    pub ip_address: String,

    /// Placeholder that no worker has written yet
    #[serde(default)]
    pub pending: bool,

    pub availability: bool,

    pub metadata: Option<Metadata>,

    pub publicly_exposed: bool,

    pub open_ports: Vec<OpenPort>,

    /// One entry per probed port, in catalog order
    pub accessibility_tests: Vec<AccessibilityTest>,

    pub risk_level: RiskLevel,

    pub risk_summary: Option<String>,

    pub recommendation: Option<String>,

    #[serde(default)]
    pub assessed_by: Assessor,

    #[serde(default)]
    pub testing_techniques: Vec<String>,

    #[serde(default)]
    pub tool_findings: Vec<ToolFinding>,

    /// Wall time spent on this target
    #[serde(default)]
    pub duration_ms: u64,
}

impl TargetResult {
    /// Placeholder created with the job
    pub fn pending(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ip_address: UNKNOWN_IP.to_string(),
            pending: true,
            availability: false,
            metadata: None,
            publicly_exposed: false,
            open_ports: Vec::new(),
            accessibility_tests: Vec::new(),
            risk_level: RiskLevel::Unknown,
            risk_summary: None,
            recommendation: None,
            assessed_by: Assessor::Rules,
            testing_techniques: Vec::new(),
            tool_findings: Vec::new(),
            duration_ms: 0,
        }
    }

    /// A target the pipeline gave up on, with the reason as its summary
    pub fn failed(target: impl Into<String>, reason: impl Into<String>) -> Self {
        let verdict = RiskAssessment::failed(reason);
        Self {
            pending: false,
            risk_level: verdict.risk_level,
            risk_summary: verdict.risk_summary,
            recommendation: verdict.recommendation,
            ..Self::pending(target)
        }
    }

    pub fn open_port_numbers(&self) -> Vec<u16> {
        self.open_ports.iter().map(|p| p.port).collect()
    }

    pub fn apply_assessment(&mut self, assessment: RiskAssessment, assessed_by: Assessor) {
        self.risk_level = assessment.risk_level;
        self.risk_summary = assessment.risk_summary;
        self.recommendation = assessment.recommendation;
        self.assessed_by = assessed_by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_carries_reason() {
        let result = TargetResult::failed("nope.invalid", "Failed to resolve nope.invalid: no such host");
        assert!(!result.pending);
        assert_eq!(result.ip_address, UNKNOWN_IP);
        assert!(!result.availability);
        assert_eq!(result.risk_level, RiskLevel::Unknown);
        assert!(result.risk_summary.unwrap().contains("no such host"));
    }

    #[test]
    fn placeholder_serializes_lowercase() {
        let json = serde_json::to_value(TargetResult::pending("8.8.8.8")).unwrap();
        assert_eq!(json["pending"], true);
        assert_eq!(json["risk_level"], "unknown");
        assert_eq!(json["assessed_by"], "rules");
    }
}
