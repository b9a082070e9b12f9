//! Target worker: resolve, probe, enrich, classify

use super::TargetResult;
use crate::config::ScannerConfig;
use crate::enrichment::{
    CloudRangeCatalog, EnrichmentGateway, Findings, GeminiSummarizer, IpApiLookup,
};
use crate::error::CircuitBreaker;
use crate::jobs::ScanMode;
use crate::network::{OpenPort, Prober, Resolver, SystemResolver, TcpProber};
use crate::ports::PortCatalog;
use crate::risk::{reconcile, testing_techniques, RiskClassifier, RiskLevel};
use crate::tools::{nikto_applies, ExternalTool, SubprocessTools, ToolFinding, ToolRunner};
use crate::Result;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs the whole pipeline for one target. `run` never fails; every
/// failure is folded into the returned result.
#[derive(Clone)]
pub struct TargetWorker {
    resolver: Arc<dyn Resolver>,
    prober: Arc<dyn Prober>,
    gateway: EnrichmentGateway,
    tools: Option<Arc<dyn ToolRunner>>,
    catalog: Arc<PortCatalog>,
    classifier: RiskClassifier,
}

impl TargetWorker {
    /// Worker wired to the real network, ip-api, cloud ranges and Gemini
    pub fn from_config(config: &ScannerConfig) -> Result<Self> {
        let resolver = Arc::new(SystemResolver::new(config.resolve_timeout()));
        let prober = Arc::new(TcpProber::new(config.probe_timeout(), config.port_concurrency));

        let breaker = CircuitBreaker::new(
            config.ai.breaker_failure_threshold,
            Duration::from_secs(config.ai.breaker_recovery_secs),
            1,
        );
        let mut gateway = EnrichmentGateway::new(config.enrichment_timeout(), config.ai_timeout())
            .with_geo(Arc::new(IpApiLookup::new(
                config.geo_endpoint.clone(),
                config.enrichment_timeout(),
            )?))
            .with_breaker(breaker);
        let summarizer = GeminiSummarizer::from_config(&config.ai, config.ai_timeout())?;
        if summarizer.has_credentials() {
            gateway = gateway.with_summarizer(Arc::new(summarizer));
        } else {
            log::info!("{} is not set, AI summaries will fall back to rules", config.ai.api_key_env);
        }
        if config.cloud_ranges.enabled {
            gateway = gateway.with_cloud(Arc::new(CloudRangeCatalog::new(config.cloud_ranges.clone())?));
        }

        Ok(Self::new(config, resolver, prober, gateway)
            .with_tools(Arc::new(SubprocessTools::new(config.tool_timeout()))))
    }

    pub fn new(
        config: &ScannerConfig,
        resolver: Arc<dyn Resolver>,
        prober: Arc<dyn Prober>,
        gateway: EnrichmentGateway,
    ) -> Self {
        Self {
            resolver,
            prober,
            gateway,
            tools: None,
            catalog: Arc::new(PortCatalog::new(config.ports.clone())),
            classifier: RiskClassifier::new(config.risk_tiers.clone()),
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRunner>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn catalog(&self) -> &PortCatalog {
        &self.catalog
    }

    pub async fn run(&self, target: &str, mode: ScanMode, tools: &[ExternalTool]) -> TargetResult {
        let start = Instant::now();

        let ip = match self.resolver.resolve(target).await {
            Ok(ip) => ip,
            Err(e) => {
                log::info!("{}: {}", target, e);
                let mut result = TargetResult::failed(target, e.to_string());
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };
        log::debug!("{} resolved to {}", target, ip);

        let accessibility_tests = self.prober.probe(ip, &self.catalog).await;
        let open_ports: Vec<OpenPort> = accessibility_tests
            .iter()
            .filter(|t| t.is_open())
            .map(OpenPort::from)
            .collect();

        let metadata = self.gateway.metadata(ip).await;
        let tool_findings = self.run_tools(target, ip, &open_ports, tools).await;

        // An open port seen only by nmap still counts as a response
        let availability = !open_ports.is_empty() || tool_findings.iter().any(|f| !f.ports.is_empty());

        let cloud = metadata.as_ref().and_then(|m| m.cloud.as_ref());
        let publicly_exposed = self.classifier.publicly_exposed(&open_ports);
        let techniques = testing_techniques(&open_ports, cloud);
        let deterministic = self.classifier.classify(&open_ports, availability, metadata.as_ref());

        let ai = if mode == ScanMode::AiEnhanced && deterministic.risk_level != RiskLevel::Unknown {
            let findings = Findings {
                target: target.to_string(),
                ip_address: ip.to_string(),
                availability,
                publicly_exposed,
                open_ports: open_ports.clone(),
                metadata: metadata.clone(),
                testing_techniques: techniques.clone(),
                tool_findings: tool_findings.clone(),
                deterministic_assessment: deterministic.clone(),
            };
            Some(self.gateway.summarize(&findings).await)
        } else {
            None
        };
        let (verdict, assessed_by) = reconcile(deterministic, ai);

        let mut result = TargetResult {
            target: target.to_string(),
            ip_address: ip.to_string(),
            pending: false,
            availability,
            metadata,
            publicly_exposed,
            open_ports,
            accessibility_tests,
            testing_techniques: techniques,
            tool_findings,
            duration_ms: start.elapsed().as_millis() as u64,
            ..TargetResult::pending(target)
        };
        result.apply_assessment(verdict, assessed_by);

        log::info!(
            "{} ({}): {} open, risk {} via {:?} in {}ms",
            target,
            ip,
            result.open_ports.len(),
            result.risk_level,
            result.assessed_by,
            result.duration_ms
        );
        result
    }

    async fn run_tools(
        &self,
        target: &str,
        ip: IpAddr,
        open_ports: &[OpenPort],
        requested: &[ExternalTool],
    ) -> Vec<ToolFinding> {
        let mut findings = Vec::new();
        for tool in requested {
            if *tool == ExternalTool::Nikto && !nikto_applies(target, open_ports) {
                log::debug!("Skipping nikto for {}: no web surface", target);
                continue;
            }
            let finding = match &self.tools {
                Some(runner) => runner.run(*tool, target, ip).await,
                None => ToolFinding::failed(*tool, "external tools are not configured", Duration::ZERO),
            };
            findings.push(finding);
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::RiskSummarizer;
    use crate::error::SummarizerError;
    use crate::network::{AccessibilityTest, PortStatus};
    use crate::risk::{Assessor, RiskAssessment};
    use crate::ScanError;
    use async_trait::async_trait;

    struct FixedResolver(Option<IpAddr>);

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, target: &str) -> Result<IpAddr> {
            self.0.ok_or_else(|| ScanError::Resolution {
                target: target.to_string(),
                reason: "no such host".to_string(),
            })
        }
    }

    struct OpenOn(Vec<u16>);

    #[async_trait]
    impl Prober for OpenOn {
        async fn probe(&self, _ip: IpAddr, catalog: &PortCatalog) -> Vec<AccessibilityTest> {
            catalog
                .entries()
                .iter()
                .map(|e| {
                    let status = if self.0.contains(&e.port) {
                        PortStatus::Open
                    } else {
                        PortStatus::Closed
                    };
                    AccessibilityTest::new(e.port, e.service.clone(), status)
                })
                .collect()
        }
    }

    struct Verdict(std::result::Result<RiskAssessment, SummarizerError>);

    #[async_trait]
    impl RiskSummarizer for Verdict {
        async fn summarize(&self, _findings: &Findings) -> std::result::Result<RiskAssessment, SummarizerError> {
            self.0.clone()
        }
    }

    struct RecordingTools;

    #[async_trait]
    impl ToolRunner for RecordingTools {
        async fn run(&self, tool: ExternalTool, _target: &str, _ip: IpAddr) -> ToolFinding {
            ToolFinding::empty(tool)
        }
    }

    fn worker(ip: Option<&str>, open: &[u16], gateway: EnrichmentGateway) -> TargetWorker {
        TargetWorker::new(
            &ScannerConfig::default(),
            Arc::new(FixedResolver(ip.map(|s| s.parse().unwrap()))),
            Arc::new(OpenOn(open.to_vec())),
            gateway,
        )
    }

    #[test]
    fn summarizer_is_left_out_without_a_key() {
        let mut config = ScannerConfig::default();
        config.ai.api_key_env = "IPINTEL_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        config.cloud_ranges.enabled = false;

        let worker = TargetWorker::from_config(&config).unwrap();
        assert!(!worker.gateway.has_summarizer());
    }

    #[tokio::test]
    async fn resolution_failure_short_circuits() {
        let result = worker(None, &[], EnrichmentGateway::disabled())
            .run("nope.invalid", ScanMode::Standard, &[])
            .await;
        assert_eq!(result.ip_address, "unknown");
        assert!(result.accessibility_tests.is_empty());
        assert!(result.risk_summary.unwrap().contains("no such host"));
    }

    #[tokio::test]
    async fn every_catalog_port_is_reported() {
        let worker = worker(Some("203.0.113.9"), &[22, 443], EnrichmentGateway::disabled());
        let result = worker.run("203.0.113.9", ScanMode::Standard, &[]).await;
        assert_eq!(result.accessibility_tests.len(), worker.catalog().len());
        assert_eq!(result.open_port_numbers(), vec![22, 443]);
        assert!(result.availability);
        assert!(result.publicly_exposed);
        assert_eq!(result.risk_level, RiskLevel::High);
        assert!(result.testing_techniques.contains(&"SSH Authentication".to_string()));
    }

    #[tokio::test]
    async fn ai_verdict_replaces_rules_when_it_succeeds() {
        let ai = RiskAssessment::new(RiskLevel::Medium, "AI view", "AI advice");
        let gateway = EnrichmentGateway::disabled().with_summarizer(Arc::new(Verdict(Ok(ai.clone()))));
        let result = worker(Some("203.0.113.9"), &[443], gateway)
            .run("203.0.113.9", ScanMode::AiEnhanced, &[])
            .await;
        assert_eq!(result.risk_level, RiskLevel::Medium);
        assert_eq!(result.risk_summary.as_deref(), Some("AI view"));
        assert_eq!(result.assessed_by, Assessor::Ai);
    }

    #[tokio::test]
    async fn standard_mode_never_calls_ai() {
        let ai = RiskAssessment::new(RiskLevel::High, "AI view", "AI advice");
        let gateway = EnrichmentGateway::disabled().with_summarizer(Arc::new(Verdict(Ok(ai))));
        let result = worker(Some("203.0.113.9"), &[443], gateway)
            .run("203.0.113.9", ScanMode::Standard, &[])
            .await;
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.assessed_by, Assessor::Rules);
    }

    #[tokio::test]
    async fn nikto_skipped_without_web_port() {
        let worker = worker(Some("203.0.113.9"), &[22], EnrichmentGateway::disabled())
            .with_tools(Arc::new(RecordingTools));
        let result = worker
            .run("203.0.113.9", ScanMode::Standard, &[ExternalTool::Nmap, ExternalTool::Nikto])
            .await;
        assert_eq!(result.tool_findings.len(), 1);
        assert_eq!(result.tool_findings[0].tool, ExternalTool::Nmap);
    }
}
