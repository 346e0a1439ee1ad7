//! The preview engine: generation pipeline plus every sandbox-addressed operation.
//!
//! Generation runs detect → sanitize → assemble → host synchronously and
//! registers the environment. Everything after that is driven either by the
//! caller (hot reload, audits, inspection) or by messages the sandbox sends
//! back through [`PreviewEngine::dispatch`].

use crate::bundle::SourceBundle;
use crate::channel::{
    Delivery, ElementInfo, HostMessage, MessageChannel, NetworkConditions, SandboxMessage,
};
use crate::config::EngineConfig;
use crate::dependencies::{baseline_runtime, detect, DependencyDescriptor};
use crate::document::{assemble, error_document, AssemblyOptions};
use crate::error::{SandboxError, SandboxResult};
use crate::host::{data_url, DocumentStore, ServedDocument};
use crate::module_shim::shim_component;
use crate::permissions::FramePermissions;
use crate::policy::build_policy;
use crate::registry::{
    BoundedLog, ConsoleEntry, DegradedDependency, EnvironmentRegistry, EnvironmentSnapshot,
    NetworkEntry, SandboxEnvironment, SandboxStatus,
};
use crate::revisions::{DiffSummary, RevisionLog};
use crate::sanitizer::{sanitize, sanitize_with_report};
use crate::telemetry::{
    accessibility, performance, security, suite, AccessibilityReport, LiveMetrics,
    PerformanceMetrics, SecurityReport, TestReport,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Whether generation produced a runnable document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    Ready,
    Error,
}

/// Returned once per generation call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    /// Absent when generation failed before a sandbox was registered
    pub sandbox_id: Option<String>,
    /// Hosted document URL, or a `data:` URL of the error document
    pub url: String,
    pub sandbox_attribute: String,
    pub status: PreviewStatus,
    pub error: Option<String>,
    pub dependencies: Vec<String>,
    /// Script files in the bundle other than the entry; they are not embedded
    #[serde(default)]
    pub omitted_files: Vec<String>,
    /// SHA-256 over the bundle's paths and contents
    pub bundle_digest: Option<String>,
    pub performance: Option<PerformanceMetrics>,
    pub accessibility: Option<AccessibilityReport>,
    pub security: Option<SecurityReport>,
}

impl PreviewResult {
    fn failed(error: &SandboxError) -> Self {
        let message = error.to_string();
        Self {
            sandbox_id: None,
            url: data_url(&error_document(&message, None)),
            sandbox_attribute: FramePermissions::preview_defaults().attribute(),
            status: PreviewStatus::Error,
            error: Some(message),
            dependencies: Vec::new(),
            omitted_files: Vec::new(),
            bundle_digest: None,
            performance: None,
            accessibility: None,
            security: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == PreviewStatus::Ready
    }
}

/// Result of pushing one component update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentUpdate {
    pub component_id: String,
    pub revision: u32,
    pub summary: DiffSummary,
    pub delivery: Delivery,
}

/// Cheap to clone; clones share the registry and document store.
#[derive(Debug, Clone)]
pub struct PreviewEngine {
    config: Arc<EngineConfig>,
    registry: Arc<Mutex<EnvironmentRegistry>>,
    documents: DocumentStore,
}

impl Default for PreviewEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl PreviewEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(EnvironmentRegistry::new())),
            documents: DocumentStore::new(),
        }
    }

    /// Validate `config` before building the engine.
    pub fn with_config(config: EngineConfig) -> SandboxResult<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, EnvironmentRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against a live environment or fail with `NotFound`.
    fn with_environment<T, F>(&self, id: &str, f: F) -> SandboxResult<T>
    where
        F: FnOnce(&mut SandboxEnvironment) -> SandboxResult<T>,
    {
        let mut registry = self.lock();
        let environment = registry
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("sandbox {}", id)))?;
        f(environment)
    }

    /// Generate a preview. Never fails: problems come back as an error result
    /// carrying an escaped error document.
    pub fn generate_preview(&self, bundle: &SourceBundle) -> PreviewResult {
        match self.build_preview(bundle) {
            Ok(result) => result,
            Err(e) => {
                warn!("Preview generation failed: {}", e);
                PreviewResult::failed(&e)
            }
        }
    }

    /// Generate from a new bundle and release the previous sandbox.
    pub fn regenerate_preview(&self, previous_id: &str, bundle: &SourceBundle) -> PreviewResult {
        let result = self.generate_preview(bundle);
        self.cleanup_preview_environment(previous_id);
        result
    }

    fn build_preview(&self, bundle: &SourceBundle) -> SandboxResult<PreviewResult> {
        if bundle.is_empty() {
            return Err(SandboxError::InvalidBundle("Source bundle is empty".to_string()));
        }
        if bundle.total_bytes() > self.config.max_source_bytes {
            return Err(SandboxError::InvalidBundle(format!(
                "Source bundle is {} bytes, limit is {}",
                bundle.total_bytes(),
                self.config.max_source_bytes
            )));
        }
        let entry = bundle.entry().ok_or_else(|| {
            SandboxError::InvalidBundle("Source bundle has no script entry".to_string())
        })?;
        if entry.content.trim().is_empty() {
            return Err(SandboxError::InvalidBundle(format!(
                "Entry file {} is empty",
                entry.path
            )));
        }

        // Only the entry is embedded, so only the entry decides what loads.
        let dependencies = detect(&entry.content);
        let omitted_files: Vec<String> = bundle
            .files()
            .filter(|f| f.is_script() && f.path != entry.path)
            .map(|f| f.path.clone())
            .collect();
        if !omitted_files.is_empty() {
            warn!(
                "Only {} is previewed; not embedding {}",
                entry.path,
                omitted_files.join(", ")
            );
        }
        let sanitization = sanitize_with_report(&entry.content);
        if sanitization.changed() {
            debug!(
                "Neutralised {} construct(s) in {}",
                sanitization.total_blocked(),
                entry.path
            );
        }

        let id = self.lock().allocate_id();
        let mut policy = build_policy(&dependencies);
        let channel = MessageChannel::new(self.config.outbound_backlog_capacity);
        let channel_url = self.config.channel_url(&id, channel.token())?;
        policy.allow_connect(&channel_url);

        let options = AssemblyOptions {
            channel_url: Some(channel_url),
            stylesheets: bundle.stylesheets().map(|s| sanitize(&s.content)).collect(),
            title: Some(format!("Preview {}", id)),
            hot_reload: self.config.hot_reload,
        };
        let assembled = assemble(&sanitization.text, &dependencies, &policy, &id, &options)?;
        if !assembled.module.unresolved_imports.is_empty() {
            warn!(
                "Sandbox {}: no runtime global for {}",
                id,
                assembled.module.unresolved_imports.join(", ")
            );
        }

        let permissions = FramePermissions::preview_defaults();
        let document =
            self.documents
                .host(assembled.html, policy.render(), &permissions, &self.config)?;

        let all_dependencies: Vec<&DependencyDescriptor> =
            baseline_runtime().iter().chain(&dependencies).collect();
        let performance = performance::profile(
            &LiveMetrics::default(),
            0,
            document.byte_len,
            &all_dependencies,
        );
        let accessibility = accessibility::audit(&sanitization.text);
        let security = security::audit(
            &sanitization,
            &policy,
            &permissions,
            self.config.isolates_previews(),
        );

        let result = PreviewResult {
            sandbox_id: Some(id.clone()),
            url: document.url.clone(),
            sandbox_attribute: document.sandbox_attribute.clone(),
            status: PreviewStatus::Ready,
            error: None,
            dependencies: dependencies.iter().map(|d| d.name.clone()).collect(),
            omitted_files,
            bundle_digest: Some(bundle.digest()),
            performance: Some(performance.clone()),
            accessibility: Some(accessibility.clone()),
            security: Some(security.clone()),
        };

        let now = Utc::now();
        let environment = SandboxEnvironment {
            id: id.clone(),
            document,
            status: SandboxStatus::Initializing,
            performance: Some(performance),
            accessibility: Some(accessibility),
            security: Some(security),
            live_metrics: LiveMetrics::default(),
            metric_samples: 0,
            console: BoundedLog::new(self.config.console_log_capacity),
            network: BoundedLog::new(self.config.network_log_capacity),
            channel,
            last_error: None,
            hot_reload_enabled: false,
            network_conditions: NetworkConditions::default(),
            dependencies,
            sanitization,
            policy,
            permissions,
            entry: assembled.module.entry,
            components: assembled.module.components,
            revisions: RevisionLog::new(),
            degraded: Vec::new(),
            regenerate_requested: false,
            created_at: now,
            updated_at: now,
        };
        self.lock().create(environment)?;

        info!(
            "Generated preview {} ({} dependencies) at {}",
            id,
            result.dependencies.len(),
            result.url
        );
        Ok(result)
    }

    pub fn environment(&self, id: &str) -> Option<EnvironmentSnapshot> {
        self.lock().get(id).map(SandboxEnvironment::snapshot)
    }

    pub fn sandbox_ids(&self) -> Vec<String> {
        self.lock().ids()
    }

    /// Hosted document for the preview origin
    pub fn document(&self, handle: &str) -> Option<ServedDocument> {
        self.documents.fetch(handle)
    }

    /// Check the token a connecting transport presented for `id`.
    pub fn authorize_channel(&self, id: &str, token: &str) -> SandboxResult<()> {
        self.with_environment(id, |env| {
            if env.channel.authorizes(token) {
                Ok(())
            } else {
                warn!("Rejected channel connection for {}: bad token", id);
                Err(SandboxError::Unauthorized(format!("channel token for sandbox {}", id)))
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn channel_token(&self, id: &str) -> Option<String> {
        self.lock().get(id).map(|env| env.channel.token().to_string())
    }

    /// Open a new channel session for a connecting transport.
    pub fn attach_channel(
        &self,
        id: &str,
    ) -> SandboxResult<(u64, mpsc::UnboundedReceiver<HostMessage>)> {
        self.with_environment(id, |env| env.channel.attach())
    }

    pub fn detach_channel(&self, id: &str, session: u64) {
        if let Some(env) = self.lock().get_mut(id) {
            env.channel.detach(session);
        }
    }

    /// Apply one raw message received from the sandbox on `session`.
    ///
    /// Messages from superseded sessions are dropped. Fails with
    /// `ChannelClosed` once the sandbox has been released so the transport
    /// can hang up.
    pub fn dispatch(&self, id: &str, session: u64, raw: &str) -> SandboxResult<()> {
        let message = SandboxMessage::parse(raw)?;
        let mut registry = self.lock();
        let Some(env) = registry.get_mut(id) else {
            return Err(SandboxError::ChannelClosed(format!("sandbox {} released", id)));
        };
        if !env.channel.is_current(session) {
            debug!("Ignoring {} from stale session {} of {}", message.kind(), session, id);
            return Ok(());
        }
        apply_message(env, message);
        Ok(())
    }

    pub fn enable_hot_reloading(&self, id: &str) -> SandboxResult<()> {
        let allowed = self.config.hot_reload;
        self.with_environment(id, |env| {
            if !allowed {
                return Err(SandboxError::HotReloadDisabled(format!(
                    "{} (disabled in configuration)",
                    id
                )));
            }
            env.hot_reload_enabled = true;
            env.touch();
            info!("Hot reloading enabled for {}", id);
            Ok(())
        })
    }

    /// Push new code for one component without reloading the document.
    pub fn update_component(
        &self,
        id: &str,
        component_id: &str,
        code: &str,
    ) -> SandboxResult<ComponentUpdate> {
        let sanitized = sanitize(code);
        let shimmed = shim_component(&sanitized, component_id)?;
        self.with_environment(id, |env| {
            if !env.hot_reload_enabled {
                return Err(SandboxError::HotReloadDisabled(id.to_string()));
            }
            let delivery = env.channel.send(HostMessage::ComponentUpdate {
                component_id: component_id.to_string(),
                code: shimmed.code,
            })?;
            let revision = env.revisions.record(component_id, &sanitized);
            let update = ComponentUpdate {
                component_id: component_id.to_string(),
                revision: revision.revision,
                summary: revision.summary.clone(),
                delivery,
            };
            if !env.components.iter().any(|c| c == component_id) {
                env.components.push(component_id.to_string());
            }
            env.status = SandboxStatus::Updating;
            env.touch();
            info!(
                "Component {} of {} updated to revision {} (+{} -{})",
                component_id, id, update.revision, update.summary.added, update.summary.deleted
            );
            Ok(update)
        })
    }

    pub fn full_reload(&self, id: &str) -> SandboxResult<Delivery> {
        self.with_environment(id, |env| {
            let delivery = env.channel.send(HostMessage::FullReload)?;
            env.status = SandboxStatus::Initializing;
            env.last_error = None;
            env.touch();
            Ok(delivery)
        })
    }

    pub fn simulate_network_conditions(
        &self,
        id: &str,
        conditions: NetworkConditions,
    ) -> SandboxResult<Delivery> {
        self.with_environment(id, |env| {
            let delivery = env.channel.send(HostMessage::NetworkSimulation { conditions })?;
            env.network_conditions = conditions;
            env.touch();
            Ok(delivery)
        })
    }

    pub fn get_console_output(&self, id: &str) -> SandboxResult<Vec<ConsoleEntry>> {
        self.with_environment(id, |env| Ok(env.console.to_vec()))
    }

    pub fn get_network_requests(&self, id: &str) -> SandboxResult<Vec<NetworkEntry>> {
        self.with_environment(id, |env| Ok(env.network.to_vec()))
    }

    /// Recompute the performance snapshot from the latest live samples.
    pub fn performance_profile(&self, id: &str) -> SandboxResult<PerformanceMetrics> {
        self.with_environment(id, |env| {
            let dependencies: Vec<&DependencyDescriptor> =
                baseline_runtime().iter().chain(&env.dependencies).collect();
            let metrics = performance::profile(
                &env.live_metrics,
                env.metric_samples,
                env.document.byte_len,
                &dependencies,
            );
            env.performance = Some(metrics.clone());
            Ok(metrics)
        })
    }

    pub fn accessibility_audit(&self, id: &str) -> SandboxResult<AccessibilityReport> {
        let source = self.with_environment(id, |env| Ok(env.sanitization.text.clone()))?;
        let report = accessibility::audit(&source);
        self.merge_report(id, |env| env.accessibility = Some(report.clone()))?;
        Ok(report)
    }

    pub fn security_audit(&self, id: &str) -> SandboxResult<SecurityReport> {
        let (sanitization, policy, permissions) = self.with_environment(id, |env| {
            Ok((
                env.sanitization.clone(),
                env.policy.clone(),
                env.permissions.clone(),
            ))
        })?;
        let report = security::audit(
            &sanitization,
            &policy,
            &permissions,
            self.config.isolates_previews(),
        );
        self.merge_report(id, |env| env.security = Some(report.clone()))?;
        Ok(report)
    }

    /// Run the smoke suite over fresh audits.
    pub fn run_tests(&self, id: &str) -> SandboxResult<TestReport> {
        let accessibility = self.accessibility_audit(id)?;
        let security = self.security_audit(id)?;
        let report = self.with_environment(id, |env| Ok(suite::run(env, &accessibility, &security)))?;
        info!(
            "Tests for {}: {}/{} passed",
            id, report.passed, report.total
        );
        Ok(report)
    }

    /// Merge an audit computed outside the lock, unless the sandbox was
    /// released in the meantime.
    fn merge_report<F>(&self, id: &str, merge: F) -> SandboxResult<()>
    where
        F: FnOnce(&mut SandboxEnvironment),
    {
        let mut registry = self.lock();
        match registry.get_mut(id) {
            Some(env) => {
                merge(env);
                env.touch();
                Ok(())
            }
            None => {
                debug!("Discarding audit for released sandbox {}", id);
                Err(SandboxError::NotFound(format!("sandbox {}", id)))
            }
        }
    }

    /// Ask the running document to describe the element matching `selector`.
    ///
    /// Fails fast when the sandbox is unknown or not connected, and settles
    /// with `Timeout` after the configured inspection timeout.
    pub async fn inspect_element(&self, id: &str, selector: &str) -> SandboxResult<ElementInfo> {
        let reply = self.with_environment(id, |env| env.channel.request_inspection(selector))?;
        let timeout = Duration::from_millis(self.config.inspect_timeout_ms);

        // The receiver is dropped once this resolves, which lets the channel
        // tell our request apart from a newer one for the same selector.
        let outcome = tokio::time::timeout(timeout, reply).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SandboxError::ChannelClosed(format!(
                "sandbox {} dropped the inspection of {}",
                id, selector
            ))),
            Err(_) => {
                if let Some(env) = self.lock().get_mut(id) {
                    env.channel.abandon_inspection(selector);
                }
                Err(SandboxError::Timeout(format!(
                    "inspecting {} in sandbox {} after {}ms",
                    selector, id, self.config.inspect_timeout_ms
                )))
            }
        }
    }

    /// Close the channel, drop the hosted document and forget the sandbox.
    /// Unknown ids are a no-op.
    pub fn cleanup_preview_environment(&self, id: &str) -> bool {
        let removed = self.lock().cleanup(id);
        match removed {
            Some(env) => {
                self.documents.release(&env.document.handle);
                info!("Released sandbox {}", id);
                true
            }
            None => false,
        }
    }
}

fn apply_message(env: &mut SandboxEnvironment, message: SandboxMessage) {
    match message {
        SandboxMessage::Ready => {
            env.status = SandboxStatus::Ready;
            env.last_error = None;
            info!("Sandbox {} ready", env.id);
        }
        SandboxMessage::Error { message, stack } => {
            warn!("Sandbox {} runtime error: {}", env.id, message);
            if let Some(stack) = &stack {
                debug!("{}", stack);
            }
            env.status = SandboxStatus::Error;
            env.last_error = Some(message);
        }
        SandboxMessage::Console {
            level,
            message,
            timestamp,
        } => env.console.push(ConsoleEntry {
            level,
            message,
            timestamp,
            received_at: Utc::now(),
        }),
        SandboxMessage::PerformanceMetrics { metrics } => {
            env.live_metrics.merge(&metrics);
            env.metric_samples += 1;
            let dependencies: Vec<&DependencyDescriptor> =
                baseline_runtime().iter().chain(&env.dependencies).collect();
            env.performance = Some(performance::profile(
                &env.live_metrics,
                env.metric_samples,
                env.document.byte_len,
                &dependencies,
            ));
        }
        SandboxMessage::NetworkRequest(request) => env.network.push(NetworkEntry {
            request,
            received_at: Utc::now(),
        }),
        SandboxMessage::ElementInfo { selector, info } => {
            if !env.channel.resolve_inspection(&selector, info) {
                debug!("Unsolicited element-info for {} in {}", selector, env.id);
            }
        }
        SandboxMessage::DependencyFailed { name, required } => {
            if required {
                warn!(
                    "Sandbox {}: required dependency {} failed on every URL; preview is degraded",
                    env.id, name
                );
            } else {
                info!("Sandbox {}: optional dependency {} unavailable", env.id, name);
            }
            if !env.degraded.iter().any(|d| d.name == name) {
                env.degraded.push(DegradedDependency { name, required });
            }
        }
        SandboxMessage::RegenerateRequest => {
            info!("Sandbox {} asked for regeneration", env.id);
            env.regenerate_requested = true;
        }
    }
    env.touch();
}
