//! Text-level neutralisation of dangerous constructs in generated source.
//!
//! This is a best-effort, defense-in-depth filter. It works on raw text with
//! regular expressions, not on a parse tree, so determined obfuscation
//! (`window["ev" + "al"]`, encoded payloads, aliasing) gets through. The real
//! isolation boundary is the sandboxed, origin-separated document described in
//! [`crate::host`]; never treat a clean sanitizer pass as proof of safety.
//!
//! Rules run in a fixed order. Every replacement is a non-empty marker that
//! matches no rule, so a later rule can never re-expose text an earlier one
//! removed, and running the sanitizer on its own output changes nothing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Passes over the text before giving up on reaching a fixpoint.
const MAX_PASSES: usize = 4;

/// One pattern → marker replacement
pub struct SanitizationRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub replacement: &'static str,
}

impl SanitizationRule {
    fn new(name: &'static str, pattern: &str, replacement: &'static str) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).unwrap(),
            replacement,
        }
    }
}

static RULES: Lazy<Vec<SanitizationRule>> = Lazy::new(|| {
    vec![
        SanitizationRule::new(
            "inline-script",
            r"(?is)<script\b[^>]*>.*?</script\s*>",
            "/* sandbox-blocked:inline-script */",
        ),
        SanitizationRule::new(
            "script-tag",
            r"(?i)</?script\b[^>]*>?",
            "/* sandbox-blocked:script-tag */",
        ),
        SanitizationRule::new(
            "javascript-uri",
            r"(?i)\bjavascript\s*:",
            "about:blank#sandbox-blocked-uri,",
        ),
        SanitizationRule::new(
            "vbscript-uri",
            r"(?i)\bvbscript\s*:",
            "about:blank#sandbox-blocked-uri,",
        ),
        SanitizationRule::new(
            "data-html-uri",
            r"(?i)\bdata\s*:\s*text/html",
            "about:blank#sandbox-blocked-uri,",
        ),
        SanitizationRule::new(
            "event-handler-attribute",
            r#"(?i)(?P<lead>[\s"'/])on(?:click|dblclick|load|unload|beforeunload|error|abort|mouse[a-z]*|key[a-z]*|focus[a-z]*|blur|change|input|submit|reset|select|scroll|resize|wheel|drag[a-z]*|drop|pointer[a-z]*|touch[a-z]*|animation[a-z]*|transition[a-z]*|toggle|contextmenu|copy|cut|paste|hashchange|message|pageshow|popstate|storage)\s*=\s*(?P<q>["'])"#,
            "${lead}data-sandbox-blocked-handler=${q}",
        ),
        SanitizationRule::new(
            "eval",
            r"\beval\s*\(",
            r#"__sandboxBlocked("eval")("#,
        ),
        SanitizationRule::new(
            "function-constructor",
            r"(?:\bnew\s+)?\bFunction\s*\(",
            r#"__sandboxBlocked("Function")("#,
        ),
        SanitizationRule::new(
            "document-write",
            r"\bdocument\s*\.\s*write(?:ln)?\s*\(",
            r#"__sandboxBlocked("document.write")("#,
        ),
        SanitizationRule::new(
            "html-assignment",
            r"\.\s*(?:inner|outer)HTML\s*(?P<op>\+?=)(?P<next>[^=]|$)",
            ".sandboxBlockedHTML ${op}${next}",
        ),
        SanitizationRule::new(
            "insert-adjacent-html",
            r"\.\s*insertAdjacentHTML\s*\(",
            ".sandboxBlockedInsert(",
        ),
        SanitizationRule::new(
            "dangerously-set-inner-html",
            r"\bdangerouslySetInnerHTML(?P<sep>\s*[=:])",
            "sandboxBlockedHtml${sep}",
        ),
        SanitizationRule::new(
            "string-timer",
            r#"\b(?P<timer>setTimeout|setInterval)\s*\(\s*(?P<q>["'`])"#,
            r#"${timer}(__sandboxBlocked("string-timer"), ${q}"#,
        ),
    ]
});

/// The ordered rule list
pub fn rules() -> &'static [SanitizationRule] {
    &RULES
}

/// How often one rule fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizationFinding {
    pub rule: String,
    pub count: usize,
}

/// Sanitized text plus what was neutralised
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SanitizationReport {
    pub text: String,
    pub findings: Vec<SanitizationFinding>,
}

impl SanitizationReport {
    pub fn changed(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn total_blocked(&self) -> usize {
        self.findings.iter().map(|f| f.count).sum()
    }
}

/// Neutralise dangerous constructs. Never fails; returns the input unchanged
/// when nothing matches.
pub fn sanitize(source: &str) -> String {
    sanitize_with_report(source).text
}

pub fn sanitize_with_report(source: &str) -> SanitizationReport {
    let mut text = source.to_string();
    let mut counts: Vec<usize> = vec![0; RULES.len()];

    for _ in 0..MAX_PASSES {
        let mut changed = false;
        for (idx, rule) in RULES.iter().enumerate() {
            let hits = rule.pattern.find_iter(&text).count();
            if hits == 0 {
                continue;
            }
            text = rule
                .pattern
                .replace_all(&text, rule.replacement)
                .into_owned();
            counts[idx] += hits;
            changed = true;
        }
        if !changed {
            break;
        }
    }

    let findings = RULES
        .iter()
        .zip(counts)
        .filter(|(_, count)| *count > 0)
        .map(|(rule, count)| SanitizationFinding {
            rule: rule.name.to_string(),
            count,
        })
        .collect();

    SanitizationReport { text, findings }
}
