//! Network module: target resolution and TCP reachability probing

pub mod probe;
pub mod resolver;

use serde::{Deserialize, Serialize};

pub use probe::{Prober, TcpProber};
pub use resolver::{normalize_target, validate_target, Resolver, SystemResolver};

/// Port state as reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PortStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortStatus::Open => write!(f, "open"),
            PortStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Outcome of probing a single catalogued port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilityTest {
    pub port: u16,
    pub service: String,
    pub status: PortStatus,
}

impl AccessibilityTest {
    pub fn new(port: u16, service: impl Into<String>, status: PortStatus) -> Self {
        Self {
            port,
            service: service.into(),
            status,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PortStatus::Open
    }
}

/// An open port with its service label ("unknown" when uncatalogued)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpenPort {
    pub port: u16,
    pub service: String,
}

impl From<&AccessibilityTest> for OpenPort {
    fn from(test: &AccessibilityTest) -> Self {
        Self {
            port: test.port,
            service: test.service.clone(),
        }
    }
}
