//! Report rendering for finished (or in-flight) jobs

use crate::jobs::{Job, JobStatus, JobSummary};
use crate::risk::RiskLevel;
use crate::scanner::TargetResult;
use crate::{Result, ScanError};
use colored::*;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub file: Option<PathBuf>,
    pub colored: bool,
    /// Also list closed ports in text reports
    pub show_closed: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            file: None,
            colored: true,
            show_closed: false,
        }
    }
}

/// Main output manager
pub struct OutputManager {
    config: OutputConfig,
}

impl OutputManager {
    pub fn new(config: OutputConfig) -> Self {
        if !config.colored {
            colored::control::set_override(false);
        }
        Self { config }
    }

    /// Render a job and write it to the configured file or stdout
    pub fn write_job(&self, job: &Job) -> Result<()> {
        let rendered = self.render(job)?;
        self.emit(&rendered)
    }

    pub fn render(&self, job: &Job) -> Result<String> {
        match self.config.format {
            OutputFormat::Text => Ok(self.format_text(job)),
            OutputFormat::Json => Ok(serde_json::to_string_pretty(job)? + "\n"),
            OutputFormat::Csv => format_csv(job),
        }
    }

    fn emit(&self, rendered: &str) -> Result<()> {
        match &self.config.file {
            Some(path) => {
                let mut file = File::create(path)?;
                file.write_all(rendered.as_bytes())?;
                log::info!("Report written to {}", path.display());
            }
            None => print!("{}", rendered),
        }
        Ok(())
    }

    fn format_text(&self, job: &Job) -> String {
        let mut out = String::new();

        let status = match job.status {
            JobStatus::Complete => job.status.to_string().bright_green().bold(),
            JobStatus::Failed => job.status.to_string().bright_red().bold(),
            _ => job.status.to_string().yellow().bold(),
        };
        out.push_str(&format!("{} {}\n", "Job:".bright_white().bold(), job.token.bright_yellow()));
        out.push_str(&format!(
            "  Status: {}  Mode: {}  Targets: {}/{}\n",
            status, job.mode, job.completed_targets, job.total_targets
        ));
        if let Some(finished) = job.finished_at {
            out.push_str(&format!("  Finished: {}\n", finished.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        if let Some(error) = &job.error {
            out.push_str(&format!("  Error: {}\n", error.red()));
        }
        out.push('\n');

        for result in &job.results {
            self.format_target(&mut out, result);
        }
        out
    }

    fn format_target(&self, out: &mut String, result: &TargetResult) {
        out.push_str(&format!(
            "{} {} ({})\n",
            "Target:".bright_white().bold(),
            result.target.bright_cyan(),
            result.ip_address
        ));
        if result.pending {
            out.push_str(&format!("  {}\n\n", "not scanned".dimmed()));
            return;
        }

        let risk = result.risk_level.to_string().to_uppercase();
        let risk = match result.risk_level {
            RiskLevel::High => risk.bright_red().bold(),
            RiskLevel::Medium => risk.yellow().bold(),
            RiskLevel::Low => risk.bright_green().bold(),
            RiskLevel::Unknown => risk.dimmed(),
        };
        out.push_str(&format!(
            "  Risk: {} ({:?})  Reachable: {}  Exposed: {}\n",
            risk, result.assessed_by, result.availability, result.publicly_exposed
        ));
        if let Some(summary) = &result.risk_summary {
            out.push_str(&format!("  Summary: {}\n", summary));
        }
        if let Some(recommendation) = &result.recommendation {
            out.push_str(&format!("  Recommendation: {}\n", recommendation.italic()));
        }

        if let Some(metadata) = &result.metadata {
            let parts: Vec<&str> = [
                metadata.location.as_deref(),
                metadata.country.as_deref(),
                metadata.provider.as_deref(),
                metadata.service_category.as_deref(),
            ]
            .into_iter()
            .flatten()
            .collect();
            if !parts.is_empty() {
                out.push_str(&format!("  Network: {}\n", parts.join(" | ")));
            }
            if let Some(cloud) = &metadata.cloud {
                out.push_str(&format!(
                    "  Cloud: {} {} {} ({})\n",
                    cloud.provider.label(),
                    cloud.service,
                    cloud.region.as_deref().unwrap_or("global"),
                    cloud.prefix
                ));
            }
        }

        if !result.open_ports.is_empty() {
            out.push_str(&format!("  {}\n", "Open ports:".bright_green()));
            for port in &result.open_ports {
                out.push_str(&format!("    {:>5}/tcp  {}\n", port.port, port.service));
            }
        }
        if self.config.show_closed {
            for test in result.accessibility_tests.iter().filter(|t| !t.is_open()) {
                out.push_str(&format!("    {:>5}/tcp  {}  {}\n", test.port, test.service, "closed".dimmed()));
            }
        }

        if !result.testing_techniques.is_empty() {
            out.push_str(&format!("  Suggested checks: {}\n", result.testing_techniques.join(", ")));
        }
        for finding in &result.tool_findings {
            match &finding.error {
                Some(error) => out.push_str(&format!("  {}: {}\n", finding.tool, error.red())),
                None => out.push_str(&format!(
                    "  {}: {} services, {} issues in {}ms\n",
                    finding.tool,
                    finding.ports.len(),
                    finding.issues.len(),
                    finding.duration_ms
                )),
            }
        }
        out.push('\n');
    }

    /// Render a job listing
    pub fn write_history(&self, summaries: &[JobSummary]) -> Result<()> {
        let rendered = match self.config.format {
            OutputFormat::Json => serde_json::to_string_pretty(summaries)? + "\n",
            OutputFormat::Csv => history_csv(summaries)?,
            OutputFormat::Text => {
                if summaries.is_empty() {
                    format!("{}\n", "No stored jobs found.".yellow())
                } else {
                    let mut out = format!("{}\n\n", "Stored jobs:".bright_cyan().bold());
                    for s in summaries {
                        out.push_str(&format!("{} {}\n", "Token:".bright_white().bold(), s.token.bright_yellow()));
                        out.push_str(&format!(
                            "  Status: {}  Mode: {}  Targets: {}/{}\n",
                            s.status, s.mode, s.completed_targets, s.total_targets
                        ));
                        out.push_str(&format!("  Created: {}\n\n", s.created_at.format("%Y-%m-%d %H:%M:%S UTC")));
                    }
                    out
                }
            }
        };
        self.emit(&rendered)
    }
}

fn csv_error(e: impl std::fmt::Display) -> ScanError {
    ScanError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// One row per target
pub fn format_csv(job: &Job) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "token",
            "target",
            "ip_address",
            "availability",
            "publicly_exposed",
            "open_ports",
            "risk_level",
            "risk_summary",
            "recommendation",
            "provider",
            "country",
        ])
        .map_err(csv_error)?;

    for result in &job.results {
        let ports = result
            .open_port_numbers()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(";");
        let provider = result.metadata.as_ref().and_then(|m| m.provider.clone()).unwrap_or_default();
        let country = result.metadata.as_ref().and_then(|m| m.country.clone()).unwrap_or_default();
        let risk = result.risk_level.to_string();
        writer
            .write_record([
                job.token.as_str(),
                result.target.as_str(),
                result.ip_address.as_str(),
                if result.availability { "true" } else { "false" },
                if result.publicly_exposed { "true" } else { "false" },
                ports.as_str(),
                risk.as_str(),
                result.risk_summary.as_deref().unwrap_or(""),
                result.recommendation.as_deref().unwrap_or(""),
                provider.as_str(),
                country.as_str(),
            ])
            .map_err(csv_error)?;
    }

    let bytes = writer.into_inner().map_err(csv_error)?;
    String::from_utf8(bytes).map_err(csv_error)
}

fn history_csv(summaries: &[JobSummary]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for summary in summaries {
        writer.serialize(summary).map_err(csv_error)?;
    }
    let bytes = writer.into_inner().map_err(csv_error)?;
    String::from_utf8(bytes).map_err(csv_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ScanMode;
    use crate::network::OpenPort;
    use crate::risk::RiskAssessment;
    use chrono::Utc;

    fn sample_job() -> Job {
        let targets = vec!["db.example".to_string(), "nope.invalid".to_string()];
        let mut job = Job::new("feedface", &targets, ScanMode::Standard, vec![]);
        job.mark_running(Utc::now());

        let mut db = TargetResult::pending("db.example");
        db.ip_address = "203.0.113.20".to_string();
        db.availability = true;
        db.publicly_exposed = true;
        db.open_ports = vec![OpenPort {
            port: 5432,
            service: "PostgreSQL".to_string(),
        }];
        db.apply_assessment(
            RiskAssessment::new(RiskLevel::Medium, "Sensitive services reachable, on 5432.", "Limit access."),
            Default::default(),
        );
        job.record_result(0, db).unwrap();
        job.record_result(1, TargetResult::failed("nope.invalid", "Failed to resolve nope.invalid"))
            .unwrap();
        job.finish(JobStatus::Complete, None, Utc::now()).unwrap();
        job
    }

    #[test]
    fn csv_has_one_row_per_target() {
        let csv = format_csv(&sample_job()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("token,target,ip_address"));
        assert!(lines[1].contains("5432"));
        // Embedded comma is quoted
        assert!(lines[1].contains("\"Sensitive services reachable, on 5432.\""));
        assert!(lines[2].contains("unknown"));
    }

    #[test]
    fn text_report_mentions_every_target() {
        let manager = OutputManager::new(OutputConfig {
            colored: false,
            ..Default::default()
        });
        let text = manager.render(&sample_job()).unwrap();
        assert!(text.contains("feedface"));
        assert!(text.contains("db.example"));
        assert!(text.contains("MEDIUM"));
        assert!(text.contains("nope.invalid"));
    }

    #[test]
    fn json_report_is_the_job() {
        let manager = OutputManager::new(OutputConfig {
            format: OutputFormat::Json,
            ..Default::default()
        });
        let job = sample_job();
        let parsed: Job = serde_json::from_str(&manager.render(&job).unwrap()).unwrap();
        assert_eq!(parsed, job);
    }

    #[test]
    fn formats_parse() {
        assert_eq!("CSV".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
