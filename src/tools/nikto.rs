//! Nikto invocation and report parsing (JSON first, text lines otherwise)

use super::{classify_severity, ToolIssue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FINDING_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+\s*(.+?):\s*(.+)$").expect("nikto line pattern"));

/// Web target for Nikto; bare hosts default to HTTPS
pub fn web_target(target: &str) -> String {
    let trimmed = target.trim();
    let lowered = trimmed.to_lowercase();
    if lowered.starts_with("http://") || lowered.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

pub fn arguments(target: &str) -> Vec<String> {
    vec![
        "-h".to_string(),
        web_target(target),
        "-Tuning".to_string(),
        "9".to_string(),
        "-maxtime".to_string(),
        "300s".to_string(),
        "-nointeractive".to_string(),
        "-Format".to_string(),
        "json".to_string(),
    ]
}

fn issues_from_json(value: &Value) -> Option<Vec<ToolIssue>> {
    let reports: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![value],
        _ => return None,
    };

    let mut issues = Vec::new();
    for report in reports {
        let Some(vulns) = report.get("vulnerabilities").and_then(Value::as_array) else {
            continue;
        };
        for vuln in vulns {
            let field = |key: &str| vuln.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
            let message = match field("message") {
                m if m.is_empty() => field("msg"),
                m => m,
            };
            let id = match vuln.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let url = field("url");
            issues.push(ToolIssue {
                name: if id.is_empty() { "nikto".to_string() } else { id },
                severity: classify_severity(&message),
                description: message,
                url: (!url.is_empty()).then_some(url),
            });
        }
    }
    Some(issues)
}

/// Issues from Nikto stdout
pub fn parse_output(output: &str) -> Vec<ToolIssue> {
    let trimmed = output.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Some(issues) = serde_json::from_str::<Value>(trimmed).ok().as_ref().and_then(issues_from_json) {
            return issues;
        }
    }

    output
        .lines()
        .filter_map(|line| FINDING_LINE.captures(line.trim_end()))
        .map(|caps| {
            let description = caps[2].trim().to_string();
            ToolIssue {
                name: caps[1].trim().to_string(),
                severity: classify_severity(&description),
                description,
                url: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Severity;

    #[test]
    fn json_report_is_parsed() {
        let issues = parse_output(
            r#"[{"host":"example.com","port":"443","vulnerabilities":[
                {"id":"999100","method":"GET","url":"/admin/","msg":"Directory traversal possible in /admin/"},
                {"id":"999101","method":"GET","url":"/","msg":"Server banner reveals Apache"}
            ]}]"#,
        );
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].name, "999100");
        assert_eq!(issues[0].severity, Severity::Medium);
        assert_eq!(issues[0].url.as_deref(), Some("/admin/"));
        assert_eq!(issues[1].severity, Severity::Low);
    }

    #[test]
    fn text_lines_are_parsed() {
        let output = "- Nikto v2.5.0\n+ Target IP: 192.0.2.10\n+ /login.php: Possible SQL injection in id parameter\nnoise line\n";
        let issues = parse_output(output);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].name, "Target IP");
        assert_eq!(issues[1].name, "/login.php");
        assert_eq!(issues[1].severity, Severity::Medium);
    }

    #[test]
    fn bare_hosts_default_to_https() {
        assert_eq!(web_target("example.com"), "https://example.com");
        assert_eq!(web_target("http://example.com/x"), "http://example.com/x");
    }
}
