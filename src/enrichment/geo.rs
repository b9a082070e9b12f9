//! ip-api.com geolocation/provider lookup

use super::{GeoLookup, GeoRecord, NetworkFlags};
use crate::{Result, ScanError};
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    message: Option<String>,
    country: Option<String>,
    #[serde(rename = "regionName")]
    region_name: Option<String>,
    city: Option<String>,
    isp: Option<String>,
    org: Option<String>,
    #[serde(default)]
    proxy: bool,
    #[serde(default)]
    hosting: bool,
    #[serde(default)]
    mobile: bool,
}

impl IpApiResponse {
    fn into_record(self) -> Result<GeoRecord> {
        if self.status != "success" {
            return Err(ScanError::Enrichment(
                self.message.unwrap_or_else(|| "IP lookup failed".to_string()),
            ));
        }

        let location = [self.city.as_deref(), self.region_name.as_deref()]
            .iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(", ");

        let service_category = if self.proxy {
            Some("Proxy / VPN")
        } else if self.mobile {
            Some("Mobile Network")
        } else if self.hosting {
            Some("Hosting Provider")
        } else {
            None
        };

        Ok(GeoRecord {
            location: (!location.is_empty()).then_some(location),
            country: self.country.filter(|c| !c.is_empty()),
            provider: self.isp.filter(|p| !p.is_empty()).or(self.org.filter(|o| !o.is_empty())),
            service_category: service_category.map(str::to_string),
            flags: NetworkFlags {
                proxy: self.proxy,
                hosting: self.hosting,
                mobile: self.mobile,
            },
        })
    }
}

/// True for addresses a public geolocation service knows nothing about
pub fn is_non_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
        }
    }
}

/// Lookup against an ip-api.com compatible endpoint
#[derive(Debug, Clone)]
pub struct IpApiLookup {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl IpApiLookup {
    /// `endpoint` must contain an `{ip}` placeholder
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    fn request_error(&self, e: reqwest::Error) -> ScanError {
        if e.is_timeout() {
            ScanError::Timeout(self.timeout)
        } else if e.is_connect() {
            ScanError::Network(e.to_string())
        } else {
            ScanError::Enrichment(e.to_string())
        }
    }
}

#[async_trait]
impl GeoLookup for IpApiLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoRecord> {
        if is_non_public(ip) {
            return Err(ScanError::Enrichment(format!("{} is a private address", ip)));
        }

        let url = self.endpoint.replace("{ip}", &ip.to_string());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.request_error(e))?;

        let body: IpApiResponse = response
            .json()
            .await
            .map_err(|e| ScanError::Enrichment(format!("unreadable lookup response: {}", e)))?;

        body.into_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<GeoRecord> {
        serde_json::from_str::<IpApiResponse>(json).unwrap().into_record()
    }

    #[test]
    fn success_response_maps_fields() {
        let record = parse(
            r#"{"status":"success","country":"United States","regionName":"Virginia",
                "city":"Ashburn","isp":"Google LLC","org":"Google Public DNS",
                "proxy":false,"hosting":true,"mobile":false}"#,
        )
        .unwrap();

        assert_eq!(record.location.as_deref(), Some("Ashburn, Virginia"));
        assert_eq!(record.provider.as_deref(), Some("Google LLC"));
        assert_eq!(record.service_category.as_deref(), Some("Hosting Provider"));
        assert!(record.flags.hosting);
    }

    #[test]
    fn proxy_outranks_hosting() {
        let record = parse(r#"{"status":"success","org":"VPN Co","proxy":true,"hosting":true}"#).unwrap();
        assert_eq!(record.service_category.as_deref(), Some("Proxy / VPN"));
        assert_eq!(record.provider.as_deref(), Some("VPN Co"));
        assert!(record.location.is_none());
    }

    #[test]
    fn fail_status_is_error() {
        let err = parse(r#"{"status":"fail","message":"reserved range"}"#).unwrap_err();
        assert!(err.to_string().contains("reserved range"));
    }

    #[test]
    fn private_ranges_are_detected() {
        assert!(is_non_public("10.1.2.3".parse().unwrap()));
        assert!(is_non_public("127.0.0.1".parse().unwrap()));
        assert!(is_non_public("fd00::1".parse().unwrap()));
        assert!(!is_non_public("8.8.8.8".parse().unwrap()));
        assert!(!is_non_public("2001:4860:4860::8888".parse().unwrap()));
    }

    #[tokio::test]
    async fn unanswered_request_is_a_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let timeout = Duration::from_millis(200);
        let lookup = IpApiLookup::new(format!("http://{}/json/{{ip}}", addr), timeout).unwrap();
        let err = lookup.lookup("8.8.8.8".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, ScanError::Timeout(t) if t == timeout), "got {:?}", err);
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let lookup = IpApiLookup::new(format!("http://{}/json/{{ip}}", addr), Duration::from_secs(2)).unwrap();
        let err = lookup.lookup("8.8.8.8".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, ScanError::Network(_)), "got {:?}", err);
    }
}
