//! Process-wide table of live sandboxes.
//!
//! Entries exist only between an explicit [`EnvironmentRegistry::create`] and
//! [`EnvironmentRegistry::cleanup`]; lookups never create anything. Ids come
//! from [`EnvironmentRegistry::allocate_id`] and are never handed out twice,
//! even after the entry is gone.

use crate::channel::{ConsoleLevel, MessageChannel, NetworkConditions, NetworkRequest};
use crate::dependencies::DependencyDescriptor;
use crate::error::{SandboxError, SandboxResult};
use crate::host::HostedDocument;
use crate::permissions::FramePermissions;
use crate::policy::Policy;
use crate::revisions::RevisionLog;
use crate::sanitizer::SanitizationReport;
use crate::telemetry::{AccessibilityReport, LiveMetrics, PerformanceMetrics, SecurityReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Lifecycle of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Initializing,
    Ready,
    Error,
    Updating,
}

/// Append-only log that forgets its oldest entries past `capacity`
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
    dropped: usize,
}

impl<T> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries evicted so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl<T: Clone> BoundedLog<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
    /// Sandbox clock, milliseconds since the epoch
    pub timestamp: Option<i64>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntry {
    #[serde(flatten)]
    pub request: NetworkRequest,
    pub received_at: DateTime<Utc>,
}

/// A dependency whose whole fallback chain failed inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedDependency {
    pub name: String,
    pub required: bool,
}

/// Everything the engine knows about one sandbox
#[derive(Debug)]
pub struct SandboxEnvironment {
    pub id: String,
    pub document: HostedDocument,
    pub status: SandboxStatus,
    pub performance: Option<PerformanceMetrics>,
    pub accessibility: Option<AccessibilityReport>,
    pub security: Option<SecurityReport>,
    pub live_metrics: LiveMetrics,
    pub metric_samples: u32,
    pub console: BoundedLog<ConsoleEntry>,
    pub network: BoundedLog<NetworkEntry>,
    pub channel: MessageChannel,
    pub last_error: Option<String>,
    pub hot_reload_enabled: bool,
    pub network_conditions: NetworkConditions,
    pub dependencies: Vec<DependencyDescriptor>,
    pub sanitization: SanitizationReport,
    pub policy: Policy,
    pub permissions: FramePermissions,
    pub entry: Option<String>,
    pub components: Vec<String>,
    pub revisions: RevisionLog,
    pub degraded: Vec<DegradedDependency>,
    pub regenerate_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxEnvironment {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            id: self.id.clone(),
            url: self.document.url.clone(),
            status: self.status,
            dependencies: self.dependencies.iter().map(|d| d.name.clone()).collect(),
            entry: self.entry.clone(),
            components: self.components.clone(),
            connected: self.channel.is_attached(),
            hot_reload_enabled: self.hot_reload_enabled,
            network_conditions: self.network_conditions,
            last_error: self.last_error.clone(),
            console_entries: self.console.len(),
            network_entries: self.network.len(),
            revisions: self.revisions.total(),
            degraded: self.degraded.clone(),
            regenerate_requested: self.regenerate_requested,
            performance: self.performance.clone(),
            accessibility: self.accessibility.clone(),
            security: self.security.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Serializable view of an environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSnapshot {
    pub id: String,
    pub url: String,
    pub status: SandboxStatus,
    pub dependencies: Vec<String>,
    pub entry: Option<String>,
    pub components: Vec<String>,
    pub connected: bool,
    pub hot_reload_enabled: bool,
    pub network_conditions: NetworkConditions,
    pub last_error: Option<String>,
    pub console_entries: usize,
    pub network_entries: usize,
    pub revisions: usize,
    pub degraded: Vec<DegradedDependency>,
    pub regenerate_requested: bool,
    pub performance: Option<PerformanceMetrics>,
    pub accessibility: Option<AccessibilityReport>,
    pub security: Option<SecurityReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    environments: HashMap<String, SandboxEnvironment>,
    issued: u64,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id: a process-monotonic counter plus a random suffix.
    pub fn allocate_id(&mut self) -> String {
        self.issued += 1;
        let suffix = Uuid::new_v4().simple().to_string();
        format!("sbx-{}-{}", self.issued, &suffix[..8])
    }

    pub fn create(&mut self, environment: SandboxEnvironment) -> SandboxResult<&mut SandboxEnvironment> {
        use std::collections::hash_map::Entry;
        match self.environments.entry(environment.id.clone()) {
            Entry::Occupied(_) => Err(SandboxError::Config(format!(
                "Sandbox {} is already registered",
                environment.id
            ))),
            Entry::Vacant(slot) => Ok(slot.insert(environment)),
        }
    }

    pub fn get(&self, id: &str) -> Option<&SandboxEnvironment> {
        self.environments.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SandboxEnvironment> {
        self.environments.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.environments.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.environments.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    /// Close the channel and remove the entry. Unknown ids are a no-op.
    pub fn cleanup(&mut self, id: &str) -> Option<SandboxEnvironment> {
        let mut environment = self.environments.remove(id)?;
        environment.channel.close();
        Some(environment)
    }
}
