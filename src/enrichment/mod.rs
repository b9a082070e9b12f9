//! Enrichment gateway: best-effort lookups that augment a target result
//!
//! Every call here is optional for the worker. Geolocation and cloud range
//! lookups degrade to "no data"; the AI summary degrades to the
//! deterministic classifier.

pub mod ai;
pub mod cloud;
pub mod geo;

use crate::error::{CircuitBreaker, ScanError, SummarizerError};
use crate::network::OpenPort;
use crate::risk::RiskAssessment;
use crate::tools::ToolFinding;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub use ai::GeminiSummarizer;
pub use cloud::{CloudHint, CloudProvider, CloudRangeCatalog};
pub use geo::IpApiLookup;

/// Network classification flags reported by the geolocation provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFlags {
    pub proxy: bool,
    pub hosting: bool,
    pub mobile: bool,
}

/// Raw result of a geolocation/provider lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub location: Option<String>,
    pub country: Option<String>,
    pub provider: Option<String>,
    pub service_category: Option<String>,
    pub flags: NetworkFlags,
}

/// Enrichment bundle attached to a target result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub location: Option<String>,
    pub country: Option<String>,
    pub provider: Option<String>,
    pub service_category: Option<String>,
    #[serde(default)]
    pub flags: NetworkFlags,
    pub cloud: Option<CloudHint>,
}

impl Metadata {
    /// Merge a geolocation record with a cloud hint; the hint wins for
    /// provider and category.
    pub fn combine(geo: Option<GeoRecord>, cloud: Option<CloudHint>) -> Option<Self> {
        if geo.is_none() && cloud.is_none() {
            return None;
        }
        let geo = geo.unwrap_or_default();
        let mut metadata = Metadata {
            location: geo.location,
            country: geo.country,
            provider: geo.provider,
            service_category: geo.service_category,
            flags: geo.flags,
            cloud: None,
        };
        if let Some(hint) = cloud {
            metadata.provider = Some(hint.provider.label().to_string());
            metadata.service_category = Some(hint.service_category.clone());
            metadata.cloud = Some(hint);
        }
        Some(metadata)
    }
}

/// Everything the AI path gets to see about one target
#[derive(Debug, Clone, Serialize)]
pub struct Findings {
    pub target: String,
    pub ip_address: String,
    pub availability: bool,
    pub publicly_exposed: bool,
    pub open_ports: Vec<OpenPort>,
    pub metadata: Option<Metadata>,
    pub testing_techniques: Vec<String>,
    pub tool_findings: Vec<ToolFinding>,
    pub deterministic_assessment: RiskAssessment,
}

/// Geolocation/provider lookup for one address
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> crate::Result<GeoRecord>;
}

/// Cloud provider range matching for one address
#[async_trait]
pub trait CloudHints: Send + Sync {
    async fn hint_for(&self, ip: IpAddr) -> Option<CloudHint>;
}

/// Structured AI risk assessment
#[async_trait]
pub trait RiskSummarizer: Send + Sync {
    async fn summarize(&self, findings: &Findings) -> Result<RiskAssessment, SummarizerError>;
}

/// Front door for all enrichment calls, applying timeouts and the AI
/// circuit breaker.
#[derive(Clone)]
pub struct EnrichmentGateway {
    geo: Option<Arc<dyn GeoLookup>>,
    cloud: Option<Arc<dyn CloudHints>>,
    summarizer: Option<Arc<dyn RiskSummarizer>>,
    breaker: CircuitBreaker,
    geo_timeout: Duration,
    ai_timeout: Duration,
}

impl EnrichmentGateway {
    pub fn new(geo_timeout: Duration, ai_timeout: Duration) -> Self {
        Self {
            geo: None,
            cloud: None,
            summarizer: None,
            breaker: CircuitBreaker::new(3, Duration::from_secs(60), 1),
            geo_timeout,
            ai_timeout,
        }
    }

    /// Gateway with every lookup disabled
    pub fn disabled() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(1))
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn CloudHints>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn RiskSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn has_summarizer(&self) -> bool {
        self.summarizer.is_some()
    }

    /// Geolocation plus cloud hint. `None` when neither produced anything.
    pub async fn metadata(&self, ip: IpAddr) -> Option<Metadata> {
        let geo = match &self.geo {
            Some(geo) => {
                let outcome = match tokio::time::timeout(self.geo_timeout, geo.lookup(ip)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ScanError::Timeout(self.geo_timeout)),
                };
                match outcome {
                    Ok(record) => Some(record),
                    Err(e) => {
                        log::warn!("Geolocation lookup failed for {}: {}", ip, e);
                        None
                    }
                }
            }
            None => None,
        };

        // A range download can stall; the hint shares the geolocation budget
        let cloud = match &self.cloud {
            Some(cloud) => match tokio::time::timeout(self.geo_timeout, cloud.hint_for(ip)).await {
                Ok(hint) => hint,
                Err(_) => {
                    log::warn!("Cloud range lookup for {} timed out after {:?}", ip, self.geo_timeout);
                    None
                }
            },
            None => None,
        };

        Metadata::combine(geo, cloud)
    }

    /// AI assessment, or the reason it is unavailable
    pub async fn summarize(&self, findings: &Findings) -> Result<RiskAssessment, SummarizerError> {
        let summarizer = self
            .summarizer
            .as_ref()
            .ok_or(SummarizerError::MissingCredentials)?;

        if !self.breaker.can_execute().await {
            return Err(SummarizerError::CircuitOpen);
        }

        let outcome = match tokio::time::timeout(self.ai_timeout, summarizer.summarize(findings)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SummarizerError::Request(format!("timed out after {:?}", self.ai_timeout))),
        };

        match &outcome {
            Ok(_) => self.breaker.record_success().await,
            // No key is a configuration state, not an upstream failure
            Err(SummarizerError::MissingCredentials) => {}
            Err(e) => {
                log::warn!("AI summary failed for {}: {}", findings.target, e);
                self.breaker.record_failure().await;
            }
        }
        outcome
    }
}
