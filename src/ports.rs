//! Curated port catalog and sensitivity tiers
//!
//! The catalog is the fixed set of TCP ports every target is probed on.
//! The tier table decides which of those ports count as sensitive when
//! they are found open. Both are plain data so they can be overridden from
//! the configuration file.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One probed port and the service label reported for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
    pub port: u16,
    pub service: String,
}

impl PortEntry {
    pub fn new(port: u16, service: &str) -> Self {
        Self {
            port,
            service: service.to_string(),
        }
    }
}

/// How alarming an open port is on a public address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityTier {
    /// Services that are normally public (DNS, HTTP(S), mail)
    Expected,
    /// Databases, file shares and tunnels that rarely belong on the internet
    Elevated,
    /// Remote administration and unauthenticated control planes
    Critical,
}

const DEFAULT_CATALOG: &[(u16, &str)] = &[
    (21, "FTP"),
    (22, "SSH"),
    (25, "SMTP"),
    (53, "DNS"),
    (80, "HTTP"),
    (110, "POP3"),
    (143, "IMAP"),
    (443, "HTTPS"),
    (465, "SMTPS"),
    (587, "Submission"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (1433, "MSSQL"),
    (1521, "Oracle"),
    (1723, "PPTP"),
    (2049, "NFS"),
    (2375, "Docker"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "PostgreSQL"),
    (5900, "VNC"),
    (6379, "Redis"),
    (8080, "HTTP-Alt"),
    (8443, "HTTPS-Alt"),
];

const DEFAULT_CRITICAL: &[u16] = &[22, 2375, 3306, 3389, 5900];
const DEFAULT_ELEVATED: &[u16] = &[21, 23, 1433, 1521, 1723, 2049, 5432, 6379];

/// Ports commonly serving HTTP; used to decide whether web tooling applies
pub const WEB_PORTS: &[u16] = &[80, 443, 8080, 8443];

static DEFAULT_ENTRIES: Lazy<Vec<PortEntry>> = Lazy::new(|| {
    DEFAULT_CATALOG
        .iter()
        .map(|(port, service)| PortEntry::new(*port, service))
        .collect()
});

/// The built-in port catalog, in probe order
pub fn default_port_catalog() -> Vec<PortEntry> {
    DEFAULT_ENTRIES.clone()
}

/// Port -> tier table. Ports not listed are `Expected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default)]
    pub critical: Vec<u16>,
    #[serde(default)]
    pub elevated: Vec<u16>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            critical: DEFAULT_CRITICAL.to_vec(),
            elevated: DEFAULT_ELEVATED.to_vec(),
        }
    }
}

impl TierTable {
    /// Tier for a port; critical wins if a port is listed twice
    pub fn tier_of(&self, port: u16) -> SensitivityTier {
        if self.critical.contains(&port) {
            SensitivityTier::Critical
        } else if self.elevated.contains(&port) {
            SensitivityTier::Elevated
        } else {
            SensitivityTier::Expected
        }
    }

    pub fn is_sensitive(&self, port: u16) -> bool {
        self.tier_of(port) != SensitivityTier::Expected
    }
}

/// Indexed view over the configured port list
#[derive(Debug, Clone)]
pub struct PortCatalog {
    entries: Vec<PortEntry>,
    by_port: HashMap<u16, usize>,
}

impl PortCatalog {
    pub fn new(entries: Vec<PortEntry>) -> Self {
        let by_port = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.port, idx))
            .collect();
        Self { entries, by_port }
    }

    pub fn entries(&self) -> &[PortEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Service label for a port, "unknown" when the port is not catalogued
    pub fn service_for(&self, port: u16) -> &str {
        self.by_port
            .get(&port)
            .map(|idx| self.entries[*idx].service.as_str())
            .unwrap_or("unknown")
    }
}

impl Default for PortCatalog {
    fn default() -> Self {
        Self::new(default_port_catalog())
    }
}
