use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Origin of the control API
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Origin serving untrusted documents and their channels. Must differ
    /// from `public_base_url`.
    #[serde(default = "default_preview_base_url")]
    pub preview_base_url: String,
    #[serde(default = "default_console_log_capacity")]
    pub console_log_capacity: usize,
    #[serde(default = "default_network_log_capacity")]
    pub network_log_capacity: usize,
    /// How long an `inspect-element` request may stay unanswered
    #[serde(default = "default_inspect_timeout_ms")]
    pub inspect_timeout_ms: u64,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    /// Host-to-sandbox messages kept while no transport is attached
    #[serde(default = "default_outbound_backlog_capacity")]
    pub outbound_backlog_capacity: usize,
    /// Whether sandboxes may accept hot component updates
    #[serde(default = "default_hot_reload")]
    pub hot_reload: bool,
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:4173".to_string()
}

fn default_preview_base_url() -> String {
    "http://127.0.0.1:4174".to_string()
}

fn default_console_log_capacity() -> usize {
    500
}

fn default_network_log_capacity() -> usize {
    200
}

fn default_inspect_timeout_ms() -> u64 {
    5000
}

fn default_max_source_bytes() -> usize {
    512 * 1024
}

fn default_outbound_backlog_capacity() -> usize {
    64
}

fn default_hot_reload() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            public_base_url: default_public_base_url(),
            preview_base_url: default_preview_base_url(),
            console_log_capacity: default_console_log_capacity(),
            network_log_capacity: default_network_log_capacity(),
            inspect_timeout_ms: default_inspect_timeout_ms(),
            max_source_bytes: default_max_source_bytes(),
            outbound_backlog_capacity: default_outbound_backlog_capacity(),
            hot_reload: default_hot_reload(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> SandboxResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = base_url.into();
        self
    }

    pub fn with_preview_url(mut self, preview_url: impl Into<String>) -> Self {
        self.preview_base_url = preview_url.into();
        self
    }

    pub fn validate(&self) -> SandboxResult<()> {
        self.base_url()?;
        self.preview_url()?;
        if !self.isolates_previews() {
            return Err(SandboxError::Config(format!(
                "previewBaseUrl '{}' must be a different origin from publicBaseUrl '{}'",
                self.preview_base_url, self.public_base_url
            )));
        }
        if self.console_log_capacity == 0 || self.network_log_capacity == 0 {
            return Err(SandboxError::Config(
                "log capacities must be at least 1".to_string(),
            ));
        }
        if self.max_source_bytes == 0 {
            return Err(SandboxError::Config(
                "maxSourceBytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn base_url(&self) -> SandboxResult<Url> {
        http_url("publicBaseUrl", &self.public_base_url)
    }

    pub fn preview_url(&self) -> SandboxResult<Url> {
        http_url("previewBaseUrl", &self.preview_base_url)
    }

    /// True when previews and the control API live on different origins.
    pub fn isolates_previews(&self) -> bool {
        match (self.base_url(), self.preview_url()) {
            (Ok(control), Ok(preview)) => control.origin() != preview.origin(),
            _ => false,
        }
    }

    /// WebSocket endpoint for one sandbox's message channel, on the preview
    /// origin and carrying the sandbox's channel token.
    pub fn channel_url(&self, sandbox_id: &str, token: &str) -> SandboxResult<String> {
        let mut url = self.preview_url()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SandboxError::Config(format!("cannot derive {} url", scheme)))?;
        url.set_path(&format!("/sandboxes/{}/channel", sandbox_id));
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url.to_string())
    }

    pub fn document_url(&self, handle: &str) -> SandboxResult<String> {
        let mut url = self.preview_url()?;
        url.set_path(&format!("/preview/{}", handle));
        Ok(url.to_string())
    }
}

fn http_url(field: &str, raw: &str) -> SandboxResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| SandboxError::Config(format!("invalid {} '{}': {}", field, raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SandboxError::Config(format!(
            "{} must be http or https, got '{}'",
            field, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"inspectTimeoutMs": 250}"#).unwrap();
        assert_eq!(config.inspect_timeout_ms, 250);
        assert_eq!(config.console_log_capacity, 500);
        assert!(config.hot_reload);
    }

    #[test]
    fn channel_url_follows_preview_scheme() {
        let config = EngineConfig::default().with_preview_url("https://preview.local:8443");
        assert_eq!(
            config.channel_url("sbx-1", "t0k").unwrap(),
            "wss://preview.local:8443/sandboxes/sbx-1/channel?token=t0k"
        );
        let config = EngineConfig::default();
        assert!(config
            .channel_url("sbx-2", "t")
            .unwrap()
            .starts_with("ws://127.0.0.1:4174/"));
        assert!(config.document_url("h").unwrap().starts_with("http://127.0.0.1:4174/preview/"));
    }

    #[test]
    fn preview_origin_must_differ_from_control_origin() {
        assert!(EngineConfig::default().validate().is_ok());
        let shared = EngineConfig::default().with_preview_url("http://127.0.0.1:4173/previews");
        assert!(!shared.isolates_previews());
        assert!(matches!(shared.validate(), Err(SandboxError::Config(_))));
    }

    #[test]
    fn rejects_non_http_base() {
        let config = EngineConfig::default().with_base_url("ftp://example.com");
        assert!(matches!(config.validate(), Err(SandboxError::Config(_))));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"consoleLogCapacity": 10, "hotReload": false}"#).unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.console_log_capacity, 10);
        assert!(!config.hot_reload);
    }
}
