//! Cloud provider range detection (AWS and GCP published ranges)
//!
//! Range documents are fetched lazily, cached for a TTL, and refreshed by a
//! single caller at a time. A failed refresh keeps serving the stale copy
//! and is not retried until the backoff window has passed.

use super::CloudHints;
use crate::config::CloudRangeConfig;
use crate::{Result, ScanError};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Cloud provider owning a matched range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Gcp,
}

impl CloudProvider {
    /// Provider name as reported in metadata
    pub fn label(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "AMAZON",
            CloudProvider::Gcp => "GOOGLE",
        }
    }
}

/// What is known about an address that sits in a published cloud range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudHint {
    pub provider: CloudProvider,
    pub service: String,
    pub region: Option<String>,
    pub prefix: String,
    pub service_category: String,
    #[serde(default)]
    pub possible_services: Vec<String>,
}

/// One published prefix
#[derive(Debug, Clone)]
pub struct RangeEntry {
    pub network: IpNetwork,
    pub service: String,
    pub region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AwsDocument {
    #[serde(default)]
    prefixes: Vec<AwsPrefix>,
    #[serde(default)]
    ipv6_prefixes: Vec<AwsPrefix>,
}

#[derive(Debug, Deserialize)]
struct AwsPrefix {
    #[serde(alias = "ipv6_prefix")]
    ip_prefix: String,
    region: Option<String>,
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcpDocument {
    #[serde(default)]
    prefixes: Vec<GcpPrefix>,
}

#[derive(Debug, Deserialize)]
struct GcpPrefix {
    #[serde(rename = "ipv4Prefix")]
    ipv4_prefix: Option<String>,
    #[serde(rename = "ipv6Prefix")]
    ipv6_prefix: Option<String>,
    service: Option<String>,
    scope: Option<String>,
}

/// Parse the AWS `ip-ranges.json` document, skipping unparseable prefixes
pub fn parse_aws_ranges(json: &str) -> Result<Vec<RangeEntry>> {
    let doc: AwsDocument = serde_json::from_str(json)?;
    Ok(doc
        .prefixes
        .into_iter()
        .chain(doc.ipv6_prefixes)
        .filter_map(|p| {
            let network = p.ip_prefix.parse::<IpNetwork>().ok()?;
            Some(RangeEntry {
                network,
                service: p.service.unwrap_or_else(|| "AMAZON".to_string()),
                region: p.region,
            })
        })
        .collect())
}

/// Parse the GCP `cloud.json` document, skipping unparseable prefixes
pub fn parse_gcp_ranges(json: &str) -> Result<Vec<RangeEntry>> {
    let doc: GcpDocument = serde_json::from_str(json)?;
    Ok(doc
        .prefixes
        .into_iter()
        .filter_map(|p| {
            let network = p.ipv4_prefix.or(p.ipv6_prefix)?.parse::<IpNetwork>().ok()?;
            Some(RangeEntry {
                network,
                service: p.service.unwrap_or_else(|| "Google Cloud".to_string()),
                region: p.scope.filter(|s| s != "global"),
            })
        })
        .collect())
}

fn aws_service_priority(service: &str) -> i32 {
    match service {
        "S3" => 10,
        "EC2" => 9,
        "RDS" => 8,
        "LAMBDA" => 7,
        "CLOUDFRONT" => 6,
        "API_GATEWAY" => 5,
        "ROUTE53" => 4,
        "DYNAMODB" => 3,
        "ECS" => 2,
        "EKS" => 1,
        "AMAZON" => -1,
        _ => 0,
    }
}

fn aws_service_category(service: &str) -> &'static str {
    match service {
        "AMAZON" => "Cloud Infrastructure",
        "S3" | "RDS" | "DYNAMODB" | "REDSHIFT" | "DOCUMENTDB" | "NEPTUNE" => "Storage & Databases",
        "EC2" | "LAMBDA" | "ECS" | "EKS" | "BATCH" | "AUTO_SCALING" | "ELASTIC_BEANSTALK" => "Compute Services",
        "CLOUDFRONT" => "CDN & Content Delivery",
        "API_GATEWAY" | "ROUTE53" | "VPC" | "ELASTICLOADBALANCING" | "GLOBALACCELERATOR" => {
            "Networking & Content Delivery"
        }
        "CLOUDWATCH" | "CLOUDFORMATION" | "CLOUDTRAIL" | "CONFIG" => "Management & Governance",
        "IAM" | "KMS" | "SHIELD" | "WAF" | "GUARDDUTY" => "Security & Identity",
        "SNS" | "SQS" | "SES" => "Messaging & Communication",
        "WORKSPACES" | "APPSTREAM" | "CHIME" => "End User Computing",
        "ATHENA" | "EMR" | "GLUE" | "KINESIS" => "Analytics",
        "SAGEMAKER" => "Artificial Intelligence",
        _ => "Other AWS Services",
    }
}

fn aws_possible_services(service: &str) -> Vec<String> {
    let list: &[&str] = match service {
        "AMAZON" => &["EC2", "ELB", "NAT Gateway", "VPC Endpoints"],
        "EC2" => &["EC2 Instances", "ECS/EKS Nodes", "Batch Compute"],
        "S3" => &["S3 Buckets", "S3 Transfer Acceleration"],
        "RDS" => &["RDS Instances", "Aurora", "DocumentDB"],
        "ELASTICLOADBALANCING" => &["Application Load Balancer", "Network Load Balancer", "Gateway Load Balancer"],
        "CLOUDFRONT" => &["CloudFront Edge Locations"],
        "ROUTE53" => &["Route53 Resolver", "Route53 Health Checks"],
        _ => &[],
    };
    list.iter().map(|s| s.to_string()).collect()
}

fn gcp_service_category(service: &str) -> &'static str {
    match service {
        "Google Cloud" => "Cloud Infrastructure",
        "Google Cloud Storage" | "Google Cloud SQL" => "Storage & Databases",
        "Google Compute Engine" => "Compute Services",
        "Google Kubernetes Engine" => "Container Orchestration",
        "Google Cloud Run" => "Serverless Computing",
        "Google Cloud Functions" => "Serverless Functions",
        "Google App Engine" => "Platform as a Service",
        "Google Cloud CDN" => "CDN & Content Delivery",
        "Google Cloud Load Balancing" | "Google Cloud VPC" | "Google Cloud DNS" => "Networking & Content Delivery",
        "Google BigQuery" => "Analytics & Big Data",
        _ => "Other Google Services",
    }
}

fn gcp_possible_services(service: &str, scope: Option<&str>) -> Vec<String> {
    let scope = scope.unwrap_or("").to_lowercase();
    let list: &[&str] = if service == "Google Cloud" {
        &["Compute Engine", "Cloud Storage", "Cloud Load Balancer", "Cloud CDN", "VPC Network"]
    } else if service == "Google Cloud Storage" {
        &["Cloud Storage Buckets", "Cloud Storage Object Versioning", "Cloud Storage Lifecycle Management"]
    } else if scope.contains("sql") {
        &["Cloud SQL MySQL", "Cloud SQL PostgreSQL", "Cloud SQL SQL Server"]
    } else if scope.contains("compute") {
        &["Compute Engine VMs", "Compute Engine Instance Templates", "Compute Engine Managed Instance Groups"]
    } else if scope.contains("gke") {
        &["GKE Clusters", "GKE Autopilot", "GKE Gateway", "GKE Service Mesh"]
    } else {
        &[]
    };
    list.iter().map(|s| s.to_string()).collect()
}

/// Best AWS match: specific services beat the generic AMAZON range
pub fn match_aws(ip: IpAddr, ranges: &[RangeEntry]) -> Option<CloudHint> {
    let matches: Vec<&RangeEntry> = ranges.iter().filter(|r| r.network.contains(ip)).collect();
    let best = matches
        .iter()
        .max_by_key(|r| (aws_service_priority(&r.service), r.network.prefix()))?;

    let mut possible: Vec<String> = matches
        .iter()
        .map(|r| r.service.clone())
        .filter(|s| s != "AMAZON")
        .collect();
    possible.sort();
    possible.dedup();
    if possible.is_empty() {
        possible = aws_possible_services(&best.service);
    }

    Some(CloudHint {
        provider: CloudProvider::Aws,
        service: best.service.clone(),
        region: best.region.clone(),
        prefix: best.network.to_string(),
        service_category: aws_service_category(&best.service).to_string(),
        possible_services: possible,
    })
}

/// First GCP range containing the address
pub fn match_gcp(ip: IpAddr, ranges: &[RangeEntry]) -> Option<CloudHint> {
    let hit = ranges.iter().find(|r| r.network.contains(ip))?;
    Some(CloudHint {
        provider: CloudProvider::Gcp,
        service: hit.service.clone(),
        region: hit.region.clone(),
        prefix: hit.network.to_string(),
        service_category: gcp_service_category(&hit.service).to_string(),
        possible_services: gcp_possible_services(&hit.service, hit.region.as_deref()),
    })
}

#[derive(Debug)]
struct CachedRanges {
    entries: Arc<Vec<RangeEntry>>,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct RangeCache {
    ranges: RwLock<Option<CachedRanges>>,
    failed_at: RwLock<Option<Instant>>,
    refresh: Mutex<()>,
}

impl RangeCache {
    async fn fresh(&self, ttl: Duration) -> Option<Arc<Vec<RangeEntry>>> {
        self.ranges
            .read()
            .await
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < ttl)
            .map(|cached| cached.entries.clone())
    }

    async fn stale(&self) -> Option<Arc<Vec<RangeEntry>>> {
        self.ranges.read().await.as_ref().map(|cached| cached.entries.clone())
    }

    async fn backing_off(&self, backoff: Duration) -> bool {
        let failed_at = *self.failed_at.read().await;
        failed_at.map(|at| at.elapsed() < backoff).unwrap_or(false)
    }
}

/// Live AWS/GCP range catalog
#[derive(Debug)]
pub struct CloudRangeCatalog {
    client: reqwest::Client,
    config: CloudRangeConfig,
    aws: RangeCache,
    gcp: RangeCache,
}

impl CloudRangeCatalog {
    pub fn new(config: CloudRangeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| ScanError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            aws: RangeCache::default(),
            gcp: RangeCache::default(),
        })
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl_secs)
    }

    fn backoff(&self) -> Duration {
        Duration::from_secs(self.config.retry_backoff_secs)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        self.client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ScanError::Enrichment(e.to_string()))?
            .text()
            .await
            .map_err(|e| ScanError::Enrichment(e.to_string()))
    }

    async fn ranges(
        &self,
        cache: &RangeCache,
        url: &str,
        parse: fn(&str) -> Result<Vec<RangeEntry>>,
    ) -> Option<Arc<Vec<RangeEntry>>> {
        let ttl = self.ttl();
        let backoff = self.backoff();
        if let Some(entries) = cache.fresh(ttl).await {
            return Some(entries);
        }
        if cache.backing_off(backoff).await {
            return cache.stale().await;
        }

        let _guard = cache.refresh.lock().await;
        // Another caller may have refreshed, or failed to, while we waited
        if let Some(entries) = cache.fresh(ttl).await {
            return Some(entries);
        }
        if cache.backing_off(backoff).await {
            return cache.stale().await;
        }

        match self.fetch(url).await.and_then(|body| parse(&body)) {
            Ok(entries) => {
                log::info!("Loaded {} cloud ranges from {}", entries.len(), url);
                let entries = Arc::new(entries);
                *cache.ranges.write().await = Some(CachedRanges {
                    entries: entries.clone(),
                    fetched_at: Instant::now(),
                });
                *cache.failed_at.write().await = None;
                Some(entries)
            }
            Err(e) => {
                log::warn!("Cloud range refresh from {} failed, next attempt in {:?}: {}", url, backoff, e);
                *cache.failed_at.write().await = Some(Instant::now());
                cache.stale().await
            }
        }
    }
}

#[async_trait]
impl CloudHints for CloudRangeCatalog {
    async fn hint_for(&self, ip: IpAddr) -> Option<CloudHint> {
        if !self.config.enabled {
            return None;
        }

        if let Some(aws) = self.ranges(&self.aws, &self.config.aws_url, parse_aws_ranges).await {
            if let Some(hint) = match_aws(ip, &aws) {
                return Some(hint);
            }
        }

        let gcp = self.ranges(&self.gcp, &self.config.gcp_url, parse_gcp_ranges).await?;
        match_gcp(ip, &gcp)
    }
}
