//! Gemini-backed risk summary
//!
//! The model is asked for a compact JSON verdict. Anything that does not
//! match the expected shape is rejected as malformed so the caller falls
//! back to the rule-based classifier.

use super::{Findings, RiskSummarizer};
use crate::config::AiConfig;
use crate::error::SummarizerError;
use crate::risk::{RiskAssessment, RiskLevel};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("code fence pattern"));

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Build the instruction sent to the model
pub fn build_prompt(findings: &Findings) -> String {
    let serialized = serde_json::to_string(findings).unwrap_or_else(|_| "{}".to_string());
    format!(
        "You are a security risk assessor. Given the following scan result JSON, respond ONLY with a \
         compact JSON object containing the keys: \"risk_level\" (one of: no risk, low, medium, high), \
         \"risk_summary\" (1-2 sentences), and \"recommendation\" (a short remediation statement). \
         Keep it concise.\nScan Result: {}",
        serialized
    )
}

fn non_empty_str<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Parse the model's text into a verdict
pub fn parse_assessment(text: &str) -> Result<RiskAssessment, SummarizerError> {
    let body = match CODE_FENCE.captures(text) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or_default(),
        None => text.trim(),
    };

    let value: Value =
        serde_json::from_str(body).map_err(|e| SummarizerError::Malformed(format!("not JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| SummarizerError::Malformed("expected a JSON object".to_string()))?;

    let level = match non_empty_str(object, &["risk_level"]).map(str::to_ascii_lowercase).as_deref() {
        Some("no risk") | Some("low") => RiskLevel::Low,
        Some("medium") => RiskLevel::Medium,
        Some("high") => RiskLevel::High,
        Some(other) => return Err(SummarizerError::Malformed(format!("unexpected risk_level '{}'", other))),
        None => return Err(SummarizerError::Malformed("missing risk_level".to_string())),
    };

    let summary = non_empty_str(object, &["risk_summary", "summary"])
        .ok_or_else(|| SummarizerError::Malformed("missing risk_summary".to_string()))?;
    let recommendation = non_empty_str(object, &["recommendation", "recommendations"])
        .ok_or_else(|| SummarizerError::Malformed("missing recommendation".to_string()))?;

    Ok(RiskAssessment::new(level, summary, recommendation))
}

fn looks_rate_limited(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED")
}

/// Client for the Gemini `generateContent` REST endpoint
#[derive(Debug, Clone)]
pub struct GeminiSummarizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl GeminiSummarizer {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SummarizerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SummarizerError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }

    /// Key and model come from the environment named in the config
    pub fn from_config(config: &AiConfig, timeout: Duration) -> Result<Self, SummarizerError> {
        Self::new(
            config.endpoint.clone(),
            config.resolved_model(),
            config.api_key(),
            timeout,
        )
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, key: &str, prompt: String) -> Result<String, SummarizerError> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseMimeType": "application/json" }
        });

        let response = self
            .client
            .post(&url)
            .query(&[("key", key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| SummarizerError::Request(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SummarizerError::Request(e.to_string()))?;

        if looks_rate_limited(status, &text) {
            return Err(SummarizerError::RateLimited);
        }
        if !status.is_success() {
            return Err(SummarizerError::Request(format!("HTTP {}", status)));
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| SummarizerError::Malformed(e.to_string()))?;
        let combined = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        if combined.trim().is_empty() {
            return Err(SummarizerError::Malformed("response carried no text".to_string()));
        }
        Ok(combined)
    }
}

#[async_trait]
impl RiskSummarizer for GeminiSummarizer {
    async fn summarize(&self, findings: &Findings) -> Result<RiskAssessment, SummarizerError> {
        let key = self.api_key.as_deref().ok_or(SummarizerError::MissingCredentials)?;
        let text = self.generate(key, build_prompt(findings)).await?;
        parse_assessment(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_is_accepted() {
        let verdict = parse_assessment(
            r#"{"risk_level":"medium","risk_summary":"Redis is open.","recommendation":"Bind Redis to localhost."}"#,
        )
        .unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::Medium);
        assert_eq!(verdict.recommendation.as_deref(), Some("Bind Redis to localhost."));
    }

    #[test]
    fn fenced_json_and_no_risk_are_tolerated() {
        let verdict = parse_assessment(
            "```json\n{\"risk_level\": \"No Risk\", \"summary\": \"Nothing exposed.\", \"recommendation\": \"None needed.\"}\n```",
        )
        .unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::Low);
        assert_eq!(verdict.risk_summary.as_deref(), Some("Nothing exposed."));
    }

    #[test]
    fn shape_deviations_are_malformed() {
        for bad in [
            "The host looks fine.",
            "[1, 2, 3]",
            r#"{"risk_level":"catastrophic","risk_summary":"x","recommendation":"y"}"#,
            r#"{"risk_level":"high","risk_summary":"","recommendation":"y"}"#,
            r#"{"risk_level":"high","risk_summary":"x"}"#,
        ] {
            assert!(matches!(parse_assessment(bad), Err(SummarizerError::Malformed(_))), "{}", bad);
        }
    }

    #[test]
    fn rate_limit_detection() {
        assert!(looks_rate_limited(reqwest::StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(looks_rate_limited(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#
        ));
        assert!(!looks_rate_limited(reqwest::StatusCode::OK, "{}"));
    }

    #[tokio::test]
    async fn no_key_is_missing_credentials() {
        let summarizer = GeminiSummarizer::new("http://127.0.0.1:9", "gemini-pro", None, Duration::from_secs(1)).unwrap();
        let findings = Findings {
            target: "example.com".into(),
            ip_address: "93.184.216.34".into(),
            availability: true,
            publicly_exposed: false,
            open_ports: vec![],
            metadata: None,
            testing_techniques: vec![],
            tool_findings: vec![],
            deterministic_assessment: RiskAssessment::unreachable(),
        };
        assert!(build_prompt(&findings).contains("93.184.216.34"));
        assert_eq!(
            summarizer.summarize(&findings).await.unwrap_err(),
            SummarizerError::MissingCredentials
        );
    }
}
