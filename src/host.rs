//! Serves assembled documents from the isolated preview origin.
//!
//! A document is stored under a random handle and addressed by
//! `<public base>/preview/<handle>`. Embedders load that URL in an iframe
//! carrying the [`FramePermissions`] attribute; the origin is separate from
//! the embedder, so `allow-same-origin` only grants the preview its own
//! storage. Releasing a handle makes the URL return 404 from then on.

use crate::config::EngineConfig;
use crate::document::escape_html;
use crate::error::SandboxResult;
use crate::permissions::FramePermissions;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Where and how a sandbox document is reachable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedDocument {
    pub handle: String,
    pub url: String,
    /// Value for the iframe `sandbox` attribute
    pub sandbox_attribute: String,
    /// sha256 of the served bytes
    pub digest: String,
    pub byte_len: usize,
}

impl HostedDocument {
    /// Embeddable iframe element for this document.
    pub fn iframe_markup(&self, title: &str) -> String {
        format!(
            "<iframe src=\"{}\" sandbox=\"{}\" title=\"{}\" referrerpolicy=\"no-referrer\" style=\"width:100%;height:100%;border:0\"></iframe>",
            escape_html(&self.url),
            escape_html(&self.sandbox_attribute),
            escape_html(title)
        )
    }
}

/// A stored document and the policy header served with it
#[derive(Debug, Clone)]
pub struct ServedDocument {
    pub html: Arc<str>,
    pub policy: String,
}

/// Process-wide document storage behind the preview origin
#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    documents: Arc<Mutex<HashMap<String, ServedDocument>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServedDocument>> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `html` under a fresh handle and describe how to reach it.
    pub fn host(
        &self,
        html: String,
        policy: String,
        permissions: &FramePermissions,
        config: &EngineConfig,
    ) -> SandboxResult<HostedDocument> {
        let handle = Uuid::new_v4().to_string();
        let url = config.document_url(&handle)?;
        let hosted = HostedDocument {
            handle: handle.clone(),
            url,
            sandbox_attribute: permissions.attribute(),
            digest: digest(html.as_bytes()),
            byte_len: html.len(),
        };
        self.lock().insert(
            handle,
            ServedDocument {
                html: Arc::from(html),
                policy,
            },
        );
        Ok(hosted)
    }

    pub fn fetch(&self, handle: &str) -> Option<ServedDocument> {
        self.lock().get(handle).cloned()
    }

    /// Drop a document. Releasing an unknown handle is a no-op.
    pub fn release(&self, handle: &str) -> bool {
        self.lock().remove(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Encode a document as a `data:` URL for offline embedding.
pub fn data_url(html: &str) -> String {
    format!("data:text/html;charset=utf-8;base64,{}", STANDARD.encode(html.as_bytes()))
}
