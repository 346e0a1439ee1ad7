//! Static accessibility audit over component markup.
//!
//! Works on JSX/HTML text, so it only sees what is written literally;
//! attributes spread from props are invisible to it.

use super::{line_of, score_after, Severity};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static IMG_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<img\b[^>]*>").unwrap());
static EMPTY_BUTTON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<button\b(?P<attrs>[^>]*)>\s*</button>").unwrap());
static INPUT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<(?:input|select|textarea)\b[^>]*>").unwrap());
static ANCHOR_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<a\b[^>]*>").unwrap());
static CLICKABLE_STATIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<(?:div|span|li|p|section|article|img)\b[^>]*\bonClick\s*=[^>]*>").unwrap()
});
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"<h(?P<level>[1-6])\b").unwrap());
static POSITIVE_TABINDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)tabIndex\s*=\s*\{?\s*["']?[1-9]"#).unwrap());
static INTERACTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(?:a|button|input|select|textarea)\b").unwrap());

const RULES: &[&str] = &[
    "img-alt",
    "button-name",
    "form-label",
    "anchor-href",
    "click-events-have-role",
    "heading-order",
    "tabindex-positive",
];

/// One accessibility problem found in the markup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityIssue {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityReport {
    pub score: u8,
    pub issues: Vec<AccessibilityIssue>,
    pub passed_rules: Vec<String>,
    pub interactive_elements: usize,
    pub audited_at: DateTime<Utc>,
}

fn has_attr(tag: &str, names: &[&str]) -> bool {
    names.iter().any(|name| {
        tag.match_indices(name).any(|(idx, _)| {
            let before = tag[..idx].chars().last();
            let after = tag[idx + name.len()..].trim_start().chars().next();
            matches!(before, Some(c) if c.is_whitespace()) && after == Some('=')
        })
    })
}

fn issue(rule: &str, severity: Severity, message: &str, source: &str, offset: usize) -> AccessibilityIssue {
    AccessibilityIssue {
        rule: rule.to_string(),
        severity,
        message: message.to_string(),
        line: line_of(source, offset),
    }
}

pub fn audit(source: &str) -> AccessibilityReport {
    let mut issues = Vec::new();

    for m in IMG_TAG.find_iter(source) {
        if !has_attr(m.as_str(), &["alt"]) {
            issues.push(issue("img-alt", Severity::High, "Image is missing alt text", source, m.start()));
        }
    }

    for caps in EMPTY_BUTTON.captures_iter(source) {
        let attrs = caps.name("attrs").map_or("", |a| a.as_str());
        if !has_attr(attrs, &["aria-label", "aria-labelledby", "title"]) {
            let start = caps.get(0).map_or(0, |m| m.start());
            issues.push(issue("button-name", Severity::High, "Button has no accessible name", source, start));
        }
    }

    for m in INPUT_TAG.find_iter(source) {
        let tag = m.as_str();
        if tag.contains("\"hidden\"") || tag.contains("\"submit\"") || tag.contains("'hidden'") {
            continue;
        }
        if !has_attr(tag, &["aria-label", "aria-labelledby", "id"]) {
            issues.push(issue(
                "form-label",
                Severity::Medium,
                "Form control has no label or aria-label",
                source,
                m.start(),
            ));
        }
    }

    for m in ANCHOR_TAG.find_iter(source) {
        if !has_attr(m.as_str(), &["href", "to"]) {
            issues.push(issue("anchor-href", Severity::Medium, "Link has no href", source, m.start()));
        }
    }

    for m in CLICKABLE_STATIC.find_iter(source) {
        if !has_attr(m.as_str(), &["role"]) {
            issues.push(issue(
                "click-events-have-role",
                Severity::Medium,
                "Click handler on a non-interactive element without a role",
                source,
                m.start(),
            ));
        }
    }

    let mut previous: Option<u32> = None;
    for caps in HEADING.captures_iter(source) {
        let level: u32 = caps["level"].parse().unwrap_or(1);
        if let Some(prev) = previous {
            if level > prev + 1 {
                let start = caps.get(0).map_or(0, |m| m.start());
                issues.push(issue(
                    "heading-order",
                    Severity::Low,
                    &format!("Heading level jumps from h{} to h{}", prev, level),
                    source,
                    start,
                ));
            }
        }
        previous = Some(level);
    }

    for m in POSITIVE_TABINDEX.find_iter(source) {
        issues.push(issue(
            "tabindex-positive",
            Severity::Low,
            "Positive tabIndex overrides natural focus order",
            source,
            m.start(),
        ));
    }

    let penalty = issues
        .iter()
        .map(|i| match i.severity {
            Severity::High => 10,
            Severity::Medium => 5,
            Severity::Low => 2,
        })
        .sum();
    let passed_rules = RULES
        .iter()
        .filter(|rule| !issues.iter().any(|i| i.rule == **rule))
        .map(|rule| rule.to_string())
        .collect();

    AccessibilityReport {
        score: score_after(penalty),
        issues,
        passed_rules,
        interactive_elements: INTERACTIVE.find_iter(source).count(),
        audited_at: Utc::now(),
    }
}
