//! Deterministic risk classification
//!
//! The classifier is a pure function of the open ports, the availability
//! signal and the enrichment metadata. The AI path may replace its verdict
//! but only through [`reconcile`], which never lets a failed or malformed
//! AI answer reach a result.

use crate::enrichment::{CloudHint, CloudProvider, Metadata};
use crate::error::SummarizerError;
use crate::network::OpenPort;
use crate::ports::{SensitivityTier, TierTable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse exposure rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Unknown,
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Unknown => "unknown",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// Which path produced the verdict on a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Assessor {
    #[default]
    Rules,
    Ai,
}

/// Risk verdict with its explanation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub risk_summary: Option<String>,
    pub recommendation: Option<String>,
}

impl RiskAssessment {
    pub fn new(level: RiskLevel, summary: impl Into<String>, recommendation: impl Into<String>) -> Self {
        Self {
            risk_level: level,
            risk_summary: Some(summary.into()),
            recommendation: Some(recommendation.into()),
        }
    }

    /// Verdict for a host that gave no signal at all
    pub fn unreachable() -> Self {
        Self {
            risk_level: RiskLevel::Unknown,
            risk_summary: Some("host not reachable.".to_string()),
            recommendation: None,
        }
    }

    /// Verdict for a target the pipeline could not assess
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            risk_level: RiskLevel::Unknown,
            risk_summary: Some(reason.into()),
            recommendation: None,
        }
    }
}

/// Rule-based classifier over a tier table
#[derive(Debug, Clone)]
pub struct RiskClassifier {
    tiers: TierTable,
    multi_service_threshold: usize,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self::new(TierTable::default())
    }
}

impl RiskClassifier {
    pub fn new(tiers: TierTable) -> Self {
        Self {
            tiers,
            multi_service_threshold: 2,
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// True when any open port sits in a sensitive tier
    pub fn publicly_exposed(&self, open_ports: &[OpenPort]) -> bool {
        open_ports.iter().any(|p| self.tiers.is_sensitive(p.port))
    }

    pub fn classify(&self, open_ports: &[OpenPort], availability: bool, metadata: Option<&Metadata>) -> RiskAssessment {
        if open_ports.is_empty() && !availability {
            return RiskAssessment::unreachable();
        }

        let cloud = metadata.and_then(|m| m.cloud.as_ref());

        let critical = self.ports_in(open_ports, SensitivityTier::Critical);
        if !critical.is_empty() {
            return critical_exposure(&critical, cloud);
        }

        let elevated = self.ports_in(open_ports, SensitivityTier::Elevated);
        if !elevated.is_empty() {
            return elevated_exposure(&elevated, cloud);
        }

        if open_ports.len() > self.multi_service_threshold {
            return multi_service_exposure(cloud);
        }

        limited_exposure(cloud)
    }

    fn ports_in(&self, open_ports: &[OpenPort], tier: SensitivityTier) -> Vec<u16> {
        let mut ports: Vec<u16> = open_ports
            .iter()
            .map(|p| p.port)
            .filter(|port| self.tiers.tier_of(*port) == tier)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

fn critical_exposure(ports: &[u16], cloud: Option<&CloudHint>) -> RiskAssessment {
    let level = RiskLevel::High;
    match cloud {
        Some(hint) if hint.provider == CloudProvider::Aws => match hint.service.as_str() {
            "S3" => RiskAssessment::new(
                level,
                format!("S3 bucket publicly accessible on ports {:?} - potential data exposure.", ports),
                "Review S3 bucket policies, enable access logging, and restrict public access.",
            ),
            "RDS" | "EC2" => RiskAssessment::new(
                level,
                format!("{} instance with critical ports {:?} exposed.", hint.service, ports),
                "Use security groups, NACLs, and VPN/private links for access control.",
            ),
            other => RiskAssessment::new(
                level,
                format!("AWS {} with critical ports {:?} exposed.", other, ports),
                "Review security group rules and implement AWS WAF/Shield where applicable.",
            ),
        },
        Some(hint) => {
            // Bare "Google Cloud" ranges are most often storage endpoints
            if hint.service.contains("Cloud Storage") || hint.service == "Google Cloud" {
                RiskAssessment::new(
                    level,
                    format!("GCP Cloud Storage publicly accessible on ports {:?} - potential data exposure.", ports),
                    "Review Cloud Storage IAM policies, enable uniform bucket-level access, and restrict public access.",
                )
            } else if hint.service.contains("Cloud SQL") {
                RiskAssessment::new(
                    level,
                    format!("GCP Cloud SQL database with critical ports {:?} exposed.", ports),
                    "Use authorized networks, Cloud SQL Proxy, and private IP connectivity.",
                )
            } else if hint.service.contains("Compute Engine") {
                RiskAssessment::new(
                    level,
                    format!("GCP Compute Engine instance with critical ports {:?} exposed.", ports),
                    "Use firewall rules, IAP (Identity-Aware Proxy), and VPC Service Controls for access control.",
                )
            } else {
                RiskAssessment::new(
                    level,
                    format!("GCP {} with critical ports {:?} exposed.", hint.service, ports),
                    "Review firewall rules, enable Cloud Armor, and implement IAP where applicable.",
                )
            }
        }
        None => RiskAssessment::new(
            level,
            format!("Critical services exposed on ports {:?}.", ports),
            "Restrict access, close management ports, and enforce firewall rules.",
        ),
    }
}

fn elevated_exposure(ports: &[u16], cloud: Option<&CloudHint>) -> RiskAssessment {
    let summary = format!("Sensitive services reachable on ports {:?}.", ports);
    let recommendation = match cloud.map(|h| h.provider) {
        Some(CloudProvider::Aws) => "Restrict these ports to trusted sources with security groups and private subnets.",
        Some(CloudProvider::Gcp) => "Restrict these ports with VPC firewall rules and prefer private IP connectivity.",
        None => "Limit these services to trusted networks or place them behind a VPN.",
    };
    RiskAssessment::new(RiskLevel::Medium, summary, recommendation)
}

fn multi_service_exposure(cloud: Option<&CloudHint>) -> RiskAssessment {
    match cloud.map(|h| h.provider) {
        Some(CloudProvider::Aws) => RiskAssessment::new(
            RiskLevel::Medium,
            "Multiple AWS services exposed - review security group configurations.",
            "Implement least-privilege security groups, enable VPC flow logs, and use AWS WAF.",
        ),
        Some(CloudProvider::Gcp) => RiskAssessment::new(
            RiskLevel::Medium,
            "Multiple GCP services exposed - review firewall configurations.",
            "Implement hierarchical firewall policies, enable VPC flow logs, and use Cloud Armor.",
        ),
        None => RiskAssessment::new(
            RiskLevel::Medium,
            "Multiple services exposed on the public internet.",
            "Harden exposed services, enable TLS, and whitelist trusted sources.",
        ),
    }
}

fn limited_exposure(cloud: Option<&CloudHint>) -> RiskAssessment {
    match cloud {
        Some(hint) if matches!(hint.service.as_str(), "S3" | "CLOUDFRONT") => RiskAssessment::new(
            RiskLevel::Low,
            format!("{} endpoint detected - standard AWS exposure.", hint.service),
            "Keep bucket and distribution policies under review.",
        ),
        Some(hint) if hint.service.contains("Cloud Storage") || hint.service.contains("Cloud CDN") => {
            RiskAssessment::new(
                RiskLevel::Low,
                format!("{} endpoint detected - standard GCP exposure.", hint.service),
                "Keep IAM bindings and bucket-level access under review.",
            )
        }
        _ => RiskAssessment::new(
            RiskLevel::Low,
            "Limited exposure detected.",
            "Keep exposed services patched and monitor access logs.",
        ),
    }
}

/// Pick the final verdict. A successful AI answer replaces the rules; any
/// AI error leaves the deterministic verdict in place.
pub fn reconcile(
    deterministic: RiskAssessment,
    ai: Option<Result<RiskAssessment, SummarizerError>>,
) -> (RiskAssessment, Assessor) {
    match ai {
        Some(Ok(assessment)) if assessment.risk_level != RiskLevel::Unknown => (assessment, Assessor::Ai),
        Some(Ok(_)) => (deterministic, Assessor::Rules),
        Some(Err(e)) => {
            log::debug!("Keeping rule-based verdict: {}", e);
            (deterministic, Assessor::Rules)
        }
        None => (deterministic, Assessor::Rules),
    }
}

fn aws_techniques(service: &str) -> &'static [&'static str] {
    match service.to_ascii_uppercase().as_str() {
        "S3" | "S3 BUCKETS" => &["PutObject", "GetObject", "ListBucket", "DeleteObject"],
        "EC2" | "EC2 INSTANCES" => &["SSH Connection", "RDP Connection", "Instance Metadata Access"],
        "RDS" | "RDS INSTANCES" | "AURORA" => &["MySQL Connection", "PostgreSQL Connection", "Snapshot Exposure Check"],
        "LAMBDA" => &["Function URL Invocation", "API Gateway Trigger"],
        "DYNAMODB" => &["GetItem", "Scan", "PutItem"],
        "CLOUDFRONT" | "CLOUDFRONT EDGE LOCATIONS" => &["Origin Access Check", "Cache Behavior Probe"],
        _ => &[],
    }
}

/// Suggested follow-up checks for the open ports and cloud placement
pub fn testing_techniques(open_ports: &[OpenPort], cloud: Option<&CloudHint>) -> Vec<String> {
    let has = |port: u16| open_ports.iter().any(|p| p.port == port);
    let mut techniques: Vec<&str> = Vec::new();

    if has(22) {
        techniques.push("SSH Authentication");
    }
    if has(80) || has(443) {
        techniques.extend(["HTTP/HTTPS Request", "SSL/TLS Handshake"]);
    }
    if has(3306) {
        techniques.push("MySQL Connection");
    }
    if has(5432) {
        techniques.push("PostgreSQL Connection");
    }
    if has(6379) {
        techniques.push("Redis Connection");
    }

    if let Some(hint) = cloud {
        match hint.provider {
            CloudProvider::Aws => {
                let mut found = if hint.service != "AMAZON" {
                    aws_techniques(&hint.service)
                } else {
                    &[]
                };
                if found.is_empty() {
                    found = hint
                        .possible_services
                        .iter()
                        .map(|s| aws_techniques(s))
                        .find(|t| !t.is_empty())
                        .unwrap_or(&[]);
                }
                techniques.extend(found);
            }
            CloudProvider::Gcp => {
                if hint.service.contains("Cloud Storage") {
                    techniques.extend(["UploadObject", "DownloadObject", "ListObjects", "DeleteObject"]);
                } else if hint.service.contains("Compute Engine") {
                    techniques.extend(["SSH Connection", "RDP Connection", "Serial Port Access"]);
                } else if hint.service.contains("Cloud SQL") {
                    techniques.extend(["MySQL Connection", "PostgreSQL Connection", "SQL Server Connection"]);
                }
            }
        }
    }

    let mut out: Vec<String> = Vec::with_capacity(techniques.len());
    for t in techniques {
        if !out.iter().any(|existing| existing == t) {
            out.push(t.to_string());
        }
    }
    out
}
