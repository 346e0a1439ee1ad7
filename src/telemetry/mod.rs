//! Point-in-time audits of a sandbox environment.
//!
//! Each collector is a pure function of its inputs; the engine decides when
//! to run one and merges the result only if the environment still exists.

pub mod accessibility;
pub mod performance;
pub mod security;
pub mod suite;

pub use accessibility::{AccessibilityIssue, AccessibilityReport};
pub use performance::{LiveMetrics, PerformanceMetrics};
pub use security::{SecurityFinding, SecurityReport};
pub use suite::{TestCase, TestOutcome, TestReport};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// 1-based line of a byte offset
pub(crate) fn line_of(text: &str, offset: usize) -> usize {
    text[..offset.min(text.len())].matches('\n').count() + 1
}

/// Score out of 100 after subtracting `penalty`
pub(crate) fn score_after(penalty: u32) -> u8 {
    100u32.saturating_sub(penalty) as u8
}
