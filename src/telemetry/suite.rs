use super::{AccessibilityReport, SecurityReport};
use crate::channel::ConsoleLevel;
use crate::registry::{SandboxEnvironment, SandboxStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum audit score for the suite to pass
pub const PASSING_SCORE: u8 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub outcome: TestOutcome,
    pub detail: String,
}

impl TestCase {
    fn check(name: &str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            outcome: if passed {
                TestOutcome::Passed
            } else {
                TestOutcome::Failed
            },
            detail: detail.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == TestOutcome::Passed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub sandbox_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub cases: Vec<TestCase>,
    pub ran_at: DateTime<Utc>,
}

impl TestReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Evaluate the fixed smoke suite against an environment and fresh audits.
pub fn run(
    environment: &SandboxEnvironment,
    accessibility: &AccessibilityReport,
    security: &SecurityReport,
) -> TestReport {
    let console_errors = environment
        .console
        .iter()
        .filter(|e| e.level == ConsoleLevel::Error)
        .count();
    let failed_requests: Vec<&str> = environment
        .network
        .iter()
        .filter(|e| !e.request.ok)
        .map(|e| e.request.url.as_str())
        .collect();
    let missing_required: Vec<&str> = environment
        .degraded
        .iter()
        .filter(|d| d.required)
        .map(|d| d.name.as_str())
        .collect();

    let cases = vec![
        TestCase::check(
            "document-hosted",
            environment.document.byte_len > 0,
            format!("{} bytes at {}", environment.document.byte_len, environment.document.url),
        ),
        TestCase::check(
            "sandbox-ready",
            environment.status == SandboxStatus::Ready,
            format!("status is {:?}", environment.status),
        ),
        TestCase::check(
            "no-runtime-errors",
            environment.last_error.is_none(),
            environment
                .last_error
                .clone()
                .unwrap_or_else(|| "no errors reported".to_string()),
        ),
        TestCase::check(
            "no-console-errors",
            console_errors == 0,
            format!("{} console error(s)", console_errors),
        ),
        TestCase::check(
            "no-failed-requests",
            failed_requests.is_empty(),
            if failed_requests.is_empty() {
                "all requests succeeded".to_string()
            } else {
                format!("failed: {}", failed_requests.join(", "))
            },
        ),
        TestCase::check(
            "required-dependencies-loaded",
            missing_required.is_empty(),
            if missing_required.is_empty() {
                "all required dependencies loaded".to_string()
            } else {
                format!("unavailable: {}", missing_required.join(", "))
            },
        ),
        TestCase::check(
            "accessibility-score",
            accessibility.score >= PASSING_SCORE,
            format!("score {} (minimum {})", accessibility.score, PASSING_SCORE),
        ),
        TestCase::check(
            "security-score",
            security.score >= PASSING_SCORE,
            format!("score {} (minimum {})", security.score, PASSING_SCORE),
        ),
    ];

    let passed = cases.iter().filter(|c| c.passed()).count();
    TestReport {
        sandbox_id: environment.id.clone(),
        total: cases.len(),
        passed,
        failed: cases.len() - passed,
        cases,
        ran_at: Utc::now(),
    }
}
