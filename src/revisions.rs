use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};
use std::collections::BTreeMap;

/// Line counts between two revisions of a component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    pub fn between(old: &str, new: &str) -> Self {
        let diff = TextDiff::from_lines(old, new);
        let mut summary = DiffSummary::default();
        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Delete => summary.deleted += 1,
                ChangeTag::Insert => summary.added += 1,
                ChangeTag::Equal => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.deleted > 0
    }
}

/// One hot-reloaded version of a component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRevision {
    pub component_id: String,
    pub revision: u32,
    pub code_hash: String,
    #[serde(skip_serializing)]
    pub code: String,
    pub summary: DiffSummary,
    pub applied_at: DateTime<Utc>,
}

/// Per-component revision history for one sandbox
#[derive(Debug, Clone, Default)]
pub struct RevisionLog {
    components: BTreeMap<String, Vec<ComponentRevision>>,
}

impl RevisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `code` as the next revision of `component_id`.
    pub fn record(&mut self, component_id: &str, code: &str) -> &ComponentRevision {
        let history = self.components.entry(component_id.to_string()).or_default();
        let previous = history.last().map(|r| r.code.as_str()).unwrap_or("");
        let revision = ComponentRevision {
            component_id: component_id.to_string(),
            revision: history.len() as u32 + 1,
            code_hash: hash(code),
            code: code.to_string(),
            summary: DiffSummary::between(previous, code),
            applied_at: Utc::now(),
        };
        history.push(revision);
        &history[history.len() - 1]
    }

    pub fn latest(&self, component_id: &str) -> Option<&ComponentRevision> {
        self.components.get(component_id).and_then(|h| h.last())
    }

    pub fn history(&self, component_id: &str) -> &[ComponentRevision] {
        self.components
            .get(component_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.components.values().map(Vec::len).sum()
    }

    /// Unified diff between the two most recent revisions of a component
    pub fn last_change(&self, component_id: &str) -> Option<String> {
        let history = self.components.get(component_id)?;
        let new = history.last()?;
        let old = if history.len() > 1 {
            history[history.len() - 2].code.as_str()
        } else {
            ""
        };
        let diff = TextDiff::from_lines(old, new.code.as_str());
        Some(
            diff.unified_diff()
                .context_radius(3)
                .header(
                    &format!("{}@{}", component_id, new.revision.saturating_sub(1)),
                    &format!("{}@{}", component_id, new.revision),
                )
                .to_string(),
        )
    }
}

fn hash(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}
