//! Target normalization and resolution
//!
//! A target is an IP literal, a hostname, or an endpoint URL. The host part
//! is pulled out of URLs before resolution; the submitted string is kept
//! untouched for reporting.

use crate::{Result, ScanError};
use async_trait::async_trait;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Maximum length of a DNS name
const MAX_HOSTNAME_LEN: usize = 253;

/// Reject input that can never name a host. Runs synchronously at submit
/// time; resolvability is not checked here.
pub fn validate_target(raw: &str) -> Result<()> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ScanError::InvalidTarget("target cannot be empty".to_string()));
    }
    if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ScanError::InvalidTarget(format!(
            "'{}' contains whitespace or control characters",
            trimmed
        )));
    }

    let host = normalize_target(trimmed)?;
    if IpAddr::from_str(&host).is_ok() {
        return Ok(());
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(ScanError::InvalidTarget(format!("hostname '{}' is too long", host)));
    }
    let labels_ok = host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });
    if !labels_ok {
        return Err(ScanError::InvalidTarget(format!("'{}' is not a valid hostname", host)));
    }
    Ok(())
}

/// Extract the host part of a target string
pub fn normalize_target(raw: &str) -> Result<String> {
    let trimmed = raw.trim();

    if trimmed.contains("://") {
        let url = Url::parse(trimmed)
            .map_err(|e| ScanError::InvalidTarget(format!("'{}' is not a valid URL: {}", trimmed, e)))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ScanError::InvalidTarget(format!("unable to parse hostname from '{}'", trimmed)))?;
        // IPv6 hosts come back bracketed
        return Ok(host.trim_start_matches('[').trim_end_matches(']').to_string());
    }

    if trimmed.is_empty() {
        return Err(ScanError::InvalidTarget("target cannot be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Turns a target string into one address
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, target: &str) -> Result<IpAddr>;
}

/// Resolver backed by the system resolver (`getaddrinfo` via tokio)
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, target: &str) -> Result<IpAddr> {
        let host = normalize_target(target)?;
        if let Ok(ip) = IpAddr::from_str(&host) {
            return Ok(ip);
        }

        let outcome = tokio::time::timeout(self.timeout, tokio::net::lookup_host(format!("{}:0", host))).await;
        let addrs = match outcome {
            Ok(Ok(addrs)) => addrs.map(|a| a.ip()).collect::<Vec<_>>(),
            Ok(Err(e)) => {
                return Err(ScanError::Resolution {
                    target: host,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ScanError::Resolution {
                    target: host,
                    reason: format!("lookup timed out after {:?}", self.timeout),
                })
            }
        };

        // Prefer IPv4, matching what most probing paths can reach
        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ScanError::Resolution {
                target: host,
                reason: "no addresses returned".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_reduced_to_host() {
        assert_eq!(normalize_target("https://service.example.com/api").unwrap(), "service.example.com");
        assert_eq!(normalize_target("http://10.0.0.1:8080/x").unwrap(), "10.0.0.1");
        assert_eq!(normalize_target("https://[2001:db8::1]/").unwrap(), "2001:db8::1");
        assert_eq!(normalize_target("  8.8.8.8 ").unwrap(), "8.8.8.8");
    }

    #[test]
    fn validation_rejects_garbage() {
        assert!(validate_target("").is_err());
        assert!(validate_target("   ").is_err());
        assert!(validate_target("two words").is_err());
        assert!(validate_target("bad..host").is_err());
        assert!(validate_target("-leading.example").is_err());
        assert!(validate_target("file:///etc/passwd").is_err());
    }

    #[test]
    fn validation_accepts_unresolvable_names() {
        assert!(validate_target("not-a-real-hostname.invalid").is_ok());
        assert!(validate_target("8.8.8.8").is_ok());
        assert!(validate_target("::1").is_ok());
        assert!(validate_target("https://example.com/login").is_ok());
    }

    #[tokio::test]
    async fn literals_skip_dns() {
        let resolver = SystemResolver::new(Duration::from_millis(10));
        let ip = resolver.resolve("192.0.2.7").await.unwrap();
        assert_eq!(ip, "192.0.2.7".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn invalid_tld_fails_resolution() {
        let resolver = SystemResolver::new(Duration::from_secs(5));
        let err = resolver.resolve("https://not-a-real-hostname.invalid/path").await.unwrap_err();
        match err {
            ScanError::Resolution { target, .. } => assert_eq!(target, "not-a-real-hostname.invalid"),
            other => panic!("expected a resolution error, got {:?}", other),
        }
    }
}
