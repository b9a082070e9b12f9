//! External tool wrappers (Nmap, Nikto)
//!
//! Tools are an opt-in, alternate enrichment source. A tool run never fails
//! the target: a missing binary, a timeout, or unparseable output is
//! recorded in [`ToolFinding::error`].

pub mod nikto;
pub mod nmap;

use crate::network::OpenPort;
use crate::ports::WEB_PORTS;
use crate::ScanError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::process::Stdio;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Selectable external tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalTool {
    Nmap,
    Nikto,
}

impl ExternalTool {
    pub fn binary(&self) -> &'static str {
        match self {
            ExternalTool::Nmap => "nmap",
            ExternalTool::Nikto => "nikto",
        }
    }
}

impl fmt::Display for ExternalTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary())
    }
}

impl FromStr for ExternalTool {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nmap" => Ok(ExternalTool::Nmap),
            "nikto" => Ok(ExternalTool::Nikto),
            other => Err(ScanError::Config(format!("unknown tool '{}'", other))),
        }
    }
}

/// Severity assigned to a tool-reported issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

/// Keyword-based severity for free-text findings
pub fn classify_severity(description: &str) -> Severity {
    let text = description.to_lowercase();
    let any = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

    if any(&["critical", "remote code execution", "privilege escalation"]) {
        Severity::High
    } else if any(&["xss", "sql injection", "csrf", "directory traversal"]) {
        Severity::Medium
    } else if any(&["info", "banner", "version"]) {
        Severity::Low
    } else {
        Severity::Info
    }
}

/// A service a tool saw listening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFinding {
    pub port: u16,
    pub protocol: String,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

/// A single issue reported by a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolIssue {
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub url: Option<String>,
}

/// Outcome of one tool run against one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFinding {
    pub tool: ExternalTool,
    pub error: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServiceFinding>,
    #[serde(default)]
    pub issues: Vec<ToolIssue>,
    pub duration_ms: u64,
}

impl ToolFinding {
    pub fn empty(tool: ExternalTool) -> Self {
        Self {
            tool,
            error: None,
            ports: Vec::new(),
            issues: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn failed(tool: ExternalTool, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            error: Some(error.into()),
            duration_ms: elapsed.as_millis() as u64,
            ..Self::empty(tool)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Nikto only makes sense against something speaking HTTP
pub fn nikto_applies(target: &str, open_ports: &[OpenPort]) -> bool {
    let lowered = target.trim().to_lowercase();
    lowered.starts_with("http://")
        || lowered.starts_with("https://")
        || open_ports.iter().any(|p| WEB_PORTS.contains(&p.port))
}

/// Runs one external tool against one target
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, tool: ExternalTool, target: &str, ip: IpAddr) -> ToolFinding;
}

/// Runs the real binaries as subprocesses
#[derive(Debug, Clone)]
pub struct SubprocessTools {
    timeout: Duration,
    nmap_path: String,
    nikto_path: String,
}

impl SubprocessTools {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            nmap_path: "nmap".to_string(),
            nikto_path: "nikto".to_string(),
        }
    }

    pub fn with_paths(mut self, nmap_path: impl Into<String>, nikto_path: impl Into<String>) -> Self {
        self.nmap_path = nmap_path.into();
        self.nikto_path = nikto_path.into();
        self
    }

    fn command_for(&self, tool: ExternalTool, target: &str, ip: IpAddr) -> (String, Vec<String>) {
        match tool {
            ExternalTool::Nmap => (self.nmap_path.clone(), nmap::arguments(ip)),
            ExternalTool::Nikto => (self.nikto_path.clone(), nikto::arguments(target)),
        }
    }

    async fn execute(&self, program: &str, args: &[String]) -> Result<(bool, String, String), String> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                format!("{} not found in PATH", program)
            } else {
                format!("failed to start {}: {}", program, e)
            }
        })?;

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok((
                output.status.success(),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )),
            Ok(Err(e)) => Err(format!("{} failed: {}", program, e)),
            Err(_) => Err(format!("{} timed out after {:?}", program, self.timeout)),
        }
    }
}

#[async_trait]
impl ToolRunner for SubprocessTools {
    async fn run(&self, tool: ExternalTool, target: &str, ip: IpAddr) -> ToolFinding {
        let start = Instant::now();
        let (program, args) = self.command_for(tool, target, ip);
        log::debug!("Running {} {}", program, args.join(" "));

        let (success, stdout, stderr) = match self.execute(&program, &args).await {
            Ok(output) => output,
            Err(e) => {
                log::warn!("{} against {} failed: {}", tool, target, e);
                return ToolFinding::failed(tool, e, start.elapsed());
            }
        };

        let mut finding = match tool {
            ExternalTool::Nmap if !success => {
                ToolFinding::failed(tool, format!("nmap exited with error: {}", stderr.trim()), start.elapsed())
            }
            ExternalTool::Nmap => match nmap::parse_xml(&stdout) {
                Ok(ports) => ToolFinding {
                    ports,
                    ..ToolFinding::empty(tool)
                },
                Err(e) => ToolFinding::failed(tool, e.to_string(), start.elapsed()),
            },
            // Nikto exits non-zero whenever it reports anything
            ExternalTool::Nikto => ToolFinding {
                issues: nikto::parse_output(&stdout),
                ..ToolFinding::empty(tool)
            },
        };
        finding.duration_ms = start.elapsed().as_millis() as u64;
        finding
    }
}
