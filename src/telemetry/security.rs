use super::{line_of, score_after, Severity};
use crate::permissions::{FrameCapability, FramePermissions};
use crate::policy::Policy;
use crate::sanitizer::SanitizationReport;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static CREDENTIAL_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api key",
            Regex::new(r#"(?i)(?:api[_-]?key|apikey|secret[_-]?key|client[_-]?secret)\s*[:=]\s*['"`][A-Za-z0-9_\-]{16,}['"`]"#)
                .unwrap(),
        ),
        (
            "password",
            Regex::new(r#"(?i)\bpassword\s*[:=]\s*['"`][^'"`\s]{4,}['"`]"#).unwrap(),
        ),
        (
            "bearer token",
            Regex::new(r#"(?i)['"`]bearer\s+[A-Za-z0-9._\-]{16,}"#).unwrap(),
        ),
        ("aws access key", Regex::new(r"\bAKIA[0-9A-Z]{16}\b").unwrap()),
        (
            "private key",
            Regex::new(r"-----BEGIN (?:RSA |EC )?PRIVATE KEY-----").unwrap(),
        ),
    ]
});

static PLAIN_HTTP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"['"`]http://(?P<host>[^/'"`\s:]+)"#).unwrap()
});

static STORAGE_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)localStorage\.setItem\(\s*['"`][^'"`]*(?:token|secret|password)[^'"`]*['"`]"#).unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityCategory {
    BlockedConstruct,
    Policy,
    Embedding,
    InsecureTransport,
    Credential,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFinding {
    pub category: SecurityCategory,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl SecurityFinding {
    fn new(category: SecurityCategory, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            line: None,
        }
    }

    fn at(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    pub score: u8,
    pub findings: Vec<SecurityFinding>,
    pub blocked_constructs: usize,
    pub policy: String,
    pub sandbox_attribute: String,
    pub audited_at: DateTime<Utc>,
}

impl SecurityReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }
}

/// Audit sanitized source together with the policy and frame it runs under.
///
/// `isolated_origin` says whether the document is served from an origin other
/// than the control API's.
pub fn audit(
    sanitization: &SanitizationReport,
    policy: &Policy,
    permissions: &FramePermissions,
    isolated_origin: bool,
) -> SecurityReport {
    let source = &sanitization.text;
    let mut findings = Vec::new();

    for finding in &sanitization.findings {
        findings.push(SecurityFinding::new(
            SecurityCategory::BlockedConstruct,
            Severity::Medium,
            format!("Neutralised {} occurrence(s) of {}", finding.count, finding.rule),
        ));
    }

    if policy.allows_eval() {
        findings.push(SecurityFinding::new(
            SecurityCategory::Policy,
            Severity::Low,
            "Policy allows 'unsafe-eval' for the in-browser transpiler",
        ));
    }

    for capability in [
        FrameCapability::AllowTopNavigation,
        FrameCapability::AllowTopNavigationByUserActivation,
        FrameCapability::AllowPopupsToEscapeSandbox,
    ] {
        if permissions.allows(capability) {
            findings.push(SecurityFinding::new(
                SecurityCategory::Embedding,
                Severity::High,
                format!("Frame grants {}", capability),
            ));
        }
    }
    if !isolated_origin
        && permissions.allows(FrameCapability::AllowScripts)
        && permissions.allows(FrameCapability::AllowSameOrigin)
    {
        findings.push(SecurityFinding::new(
            SecurityCategory::Embedding,
            Severity::High,
            "Frame runs scripts with allow-same-origin on the control API origin",
        ));
    }
    if !permissions.allows(FrameCapability::AllowScripts) {
        findings.push(SecurityFinding::new(
            SecurityCategory::Embedding,
            Severity::Low,
            "Frame does not allow scripts; the preview cannot run",
        ));
    }

    for caps in PLAIN_HTTP.captures_iter(source) {
        let host = &caps["host"];
        if host == "localhost" || host == "127.0.0.1" {
            continue;
        }
        let start = caps.get(0).map_or(0, |m| m.start());
        findings.push(
            SecurityFinding::new(
                SecurityCategory::InsecureTransport,
                Severity::Medium,
                format!("Plain http URL to {}", host),
            )
            .at(line_of(source, start)),
        );
    }

    for (label, pattern) in CREDENTIAL_PATTERNS.iter() {
        for m in pattern.find_iter(source) {
            findings.push(
                SecurityFinding::new(
                    SecurityCategory::Credential,
                    Severity::High,
                    format!("Hard-coded {} in source", label),
                )
                .at(line_of(source, m.start())),
            );
        }
    }

    for m in STORAGE_SECRET.find_iter(source) {
        findings.push(
            SecurityFinding::new(
                SecurityCategory::Storage,
                Severity::Low,
                "Sensitive value written to localStorage",
            )
            .at(line_of(source, m.start())),
        );
    }

    let penalty = findings
        .iter()
        .map(|f| match f.severity {
            Severity::High => 25,
            Severity::Medium => 10,
            Severity::Low => 2,
        })
        .sum();

    SecurityReport {
        score: score_after(penalty),
        findings,
        blocked_constructs: sanitization.total_blocked(),
        policy: policy.render(),
        sandbox_attribute: permissions.attribute(),
        audited_at: Utc::now(),
    }
}
