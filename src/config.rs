//! Configuration module for the ipintel scanner

use crate::error::RetryPolicy;
use crate::ports::{default_port_catalog, PortEntry, TierTable};
use crate::ScanError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the scanner service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Global number of targets scanned concurrently, across all jobs
    pub worker_pool_size: usize,

    /// Concurrent port probes per target
    pub port_concurrency: usize,

    /// Timeout for each port connection attempt in milliseconds
    pub probe_timeout_ms: u64,

    /// Timeout for hostname resolution in milliseconds
    pub resolve_timeout_ms: u64,

    /// Timeout for the geolocation lookup in milliseconds
    pub enrichment_timeout_ms: u64,

    /// Timeout for the AI summary call in milliseconds
    pub ai_timeout_ms: u64,

    /// Timeout for external tools (nmap, nikto) in seconds
    pub tool_timeout_secs: u64,

    /// Longest a job waits for a worker slot before it is failed, in milliseconds
    pub slot_wait_ceiling_ms: u64,

    /// Directory holding persisted job records
    pub store_dir: Option<PathBuf>,

    /// Attempts for the terminal job write
    pub store_retry_attempts: usize,

    /// Base backoff between terminal write attempts in milliseconds
    pub store_retry_delay_ms: u64,

    /// How long a stored terminal job stays in the live registry, in seconds
    pub registry_retention_secs: u64,

    /// Geolocation endpoint; `{ip}` is replaced with the address
    pub geo_endpoint: String,

    /// Cloud provider range sources
    pub cloud_ranges: CloudRangeConfig,

    /// AI summary settings
    pub ai: AiConfig,

    /// Ports probed on every target, in probe order
    pub ports: Vec<PortEntry>,

    /// Sensitivity tiers used by the risk classifier
    pub risk_tiers: TierTable,
}

/// Where cloud range documents come from and how long they are trusted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudRangeConfig {
    pub enabled: bool,
    pub aws_url: String,
    pub gcp_url: String,
    pub cache_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
    /// After a failed download, skip refetching for this long
    pub retry_backoff_secs: u64,
}

impl Default for CloudRangeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            aws_url: "https://ip-ranges.amazonaws.com/ip-ranges.json".to_string(),
            gcp_url: "https://www.gstatic.com/ipranges/cloud.json".to_string(),
            cache_ttl_secs: 6 * 3600,
            fetch_timeout_secs: 30,
            retry_backoff_secs: 300,
        }
    }
}

/// AI summary provider settings. The key itself only ever comes from the
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub model_env: String,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-pro".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            model_env: "GEMINI_MODEL".to_string(),
            breaker_failure_threshold: 3,
            breaker_recovery_secs: 60,
        }
    }
}

impl AiConfig {
    /// API key from the configured environment variable, if set and non-empty
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    /// Model name, letting the environment override the file
    pub fn resolved_model(&self) -> String {
        std::env::var(&self.model_env)
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.model.clone())
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: num_cpus::get().max(4),
            port_concurrency: 8,
            probe_timeout_ms: 1000,
            resolve_timeout_ms: 10_000,
            enrichment_timeout_ms: 10_000,
            ai_timeout_ms: 20_000,
            tool_timeout_secs: 300,
            slot_wait_ceiling_ms: 1_800_000,
            store_dir: None,
            store_retry_attempts: 3,
            store_retry_delay_ms: 200,
            registry_retention_secs: 3600,
            geo_endpoint: "http://ip-api.com/json/{ip}?fields=status,message,country,regionName,city,isp,org,proxy,hosting,mobile".to_string(),
            cloud_ranges: CloudRangeConfig::default(),
            ai: AiConfig::default(),
            ports: default_port_catalog(),
            risk_tiers: TierTable::default(),
        }
    }
}

impl ScannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker pool size
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set the per-target port concurrency
    pub fn with_port_concurrency(mut self, concurrency: usize) -> Self {
        self.port_concurrency = concurrency;
        self
    }

    /// Set the per-port probe timeout
    pub fn with_probe_timeout(mut self, timeout_ms: u64) -> Self {
        self.probe_timeout_ms = timeout_ms;
        self
    }

    /// Set the probed ports
    pub fn with_ports(mut self, ports: Vec<PortEntry>) -> Self {
        self.ports = ports;
        self
    }

    /// Set the store directory
    pub fn with_store_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Set how long a job may wait for a worker slot
    pub fn with_slot_wait_ceiling(mut self, ceiling_ms: u64) -> Self {
        self.slot_wait_ceiling_ms = ceiling_ms;
        self
    }

    /// Set how long stored terminal jobs stay in the registry
    pub fn with_registry_retention(mut self, retention_secs: u64) -> Self {
        self.registry_retention_secs = retention_secs;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn enrichment_timeout(&self) -> Duration {
        Duration::from_millis(self.enrichment_timeout_ms)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_millis(self.ai_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn slot_wait_ceiling(&self) -> Duration {
        Duration::from_millis(self.slot_wait_ceiling_ms)
    }

    pub fn registry_retention(&self) -> Duration {
        Duration::from_secs(self.registry_retention_secs)
    }

    pub fn store_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.store_retry_attempts, self.store_retry_delay_ms)
    }

    /// Store directory, defaulting to `~/.ipintel/jobs`
    pub fn resolved_store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ipintel")
                .join("jobs")
        })
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ScanError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: ScannerConfig = toml::from_str(content)
            .map_err(|e| ScanError::Config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `~/.ipintel.toml`, falling back to defaults
    pub fn load_default_config() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let path = home_dir.join(".ipintel.toml");

        if path.exists() {
            match Self::from_toml_file(&path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    return config;
                }
                Err(e) => log::warn!("Ignoring {}: {}", path.display(), e),
            }
        }

        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker_pool_size == 0 {
            return Err(ScanError::Config("worker_pool_size must be greater than 0".to_string()));
        }

        if self.port_concurrency == 0 {
            return Err(ScanError::Config("port_concurrency must be greater than 0".to_string()));
        }

        let timeouts = [
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("resolve_timeout_ms", self.resolve_timeout_ms),
            ("enrichment_timeout_ms", self.enrichment_timeout_ms),
            ("ai_timeout_ms", self.ai_timeout_ms),
            ("tool_timeout_secs", self.tool_timeout_secs),
            ("slot_wait_ceiling_ms", self.slot_wait_ceiling_ms),
            ("cloud_ranges.fetch_timeout_secs", self.cloud_ranges.fetch_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ScanError::Config(format!("{} must be greater than 0", name)));
        }

        if self.store_retry_attempts == 0 {
            return Err(ScanError::Config("store_retry_attempts must be at least 1".to_string()));
        }

        if self.ports.is_empty() {
            return Err(ScanError::Config("port catalog cannot be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for entry in &self.ports {
            if entry.port == 0 {
                return Err(ScanError::Config("port 0 cannot be probed".to_string()));
            }
            if !seen.insert(entry.port) {
                return Err(ScanError::Config(format!("duplicate port {} in catalog", entry.port)));
            }
        }

        if !self.geo_endpoint.contains("{ip}") {
            return Err(ScanError::Config("geo_endpoint must contain an {ip} placeholder".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ScannerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_pool_is_rejected() {
        let config = ScannerConfig::default().with_worker_pool_size(0);
        assert!(matches!(config.validate(), Err(ScanError::Config(_))));
    }

    fn rejection_names(config: ScannerConfig, field: &str) {
        match config.validate() {
            Err(ScanError::Config(message)) => assert!(message.contains(field), "{}", message),
            other => panic!("expected {} to be rejected, got {:?}", field, other),
        }
    }

    #[test]
    fn zero_slot_wait_ceiling_is_rejected() {
        rejection_names(ScannerConfig::default().with_slot_wait_ceiling(0), "slot_wait_ceiling_ms");
    }

    #[test]
    fn zero_ai_timeout_is_rejected() {
        let mut config = ScannerConfig::default();
        config.ai_timeout_ms = 0;
        rejection_names(config, "ai_timeout_ms");
    }

    #[test]
    fn zero_tool_timeout_is_rejected() {
        let mut config = ScannerConfig::default();
        config.tool_timeout_secs = 0;
        rejection_names(config, "tool_timeout_secs");
    }

    #[test]
    fn zero_cloud_fetch_timeout_is_rejected() {
        let mut config = ScannerConfig::default();
        config.cloud_ranges.fetch_timeout_secs = 0;
        rejection_names(config, "fetch_timeout_secs");
    }

    #[test]
    fn zero_store_attempts_are_rejected() {
        let mut config = ScannerConfig::default();
        config.store_retry_attempts = 0;
        rejection_names(config, "store_retry_attempts");
    }

    #[test]
    fn duplicate_ports_are_rejected() {
        let config = ScannerConfig::default()
            .with_ports(vec![PortEntry::new(22, "SSH"), PortEntry::new(22, "SSH")]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ScannerConfig::from_toml_str(
            r#"
            worker_pool_size = 5
            probe_timeout_ms = 250

            [risk_tiers]
            critical = [22]
            elevated = [6379]

            [[ports]]
            port = 22
            service = "SSH"

            [[ports]]
            port = 6379
            service = "Redis"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_pool_size, 5);
        assert_eq!(config.probe_timeout(), Duration::from_millis(250));
        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.risk_tiers.critical, vec![22]);
        assert_eq!(config.port_concurrency, 8);
        assert_eq!(config.ai.api_key_env, "GEMINI_API_KEY");
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = ScannerConfig::from_toml_str("worker_pool_size = \"many\"").unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
    }
}
