use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// One token of an iframe `sandbox` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameCapability {
    AllowScripts,
    AllowSameOrigin,
    AllowForms,
    AllowPopups,
    AllowModals,
    AllowDownloads,
    AllowPopupsToEscapeSandbox,
    AllowTopNavigation,
    AllowTopNavigationByUserActivation,
    AllowPointerLock,
    AllowPresentation,
}

impl FrameCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameCapability::AllowScripts => "allow-scripts",
            FrameCapability::AllowSameOrigin => "allow-same-origin",
            FrameCapability::AllowForms => "allow-forms",
            FrameCapability::AllowPopups => "allow-popups",
            FrameCapability::AllowModals => "allow-modals",
            FrameCapability::AllowDownloads => "allow-downloads",
            FrameCapability::AllowPopupsToEscapeSandbox => "allow-popups-to-escape-sandbox",
            FrameCapability::AllowTopNavigation => "allow-top-navigation",
            FrameCapability::AllowTopNavigationByUserActivation => {
                "allow-top-navigation-by-user-activation"
            }
            FrameCapability::AllowPointerLock => "allow-pointer-lock",
            FrameCapability::AllowPresentation => "allow-presentation",
        }
    }

    /// Capabilities that let a document act on its embedder or escape the frame.
    pub fn is_escalating(&self) -> bool {
        matches!(
            self,
            FrameCapability::AllowTopNavigation
                | FrameCapability::AllowTopNavigationByUserActivation
                | FrameCapability::AllowPopupsToEscapeSandbox
        )
    }
}

impl fmt::Display for FrameCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameCapability {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let capability = match s {
            "allow-scripts" => FrameCapability::AllowScripts,
            "allow-same-origin" => FrameCapability::AllowSameOrigin,
            "allow-forms" => FrameCapability::AllowForms,
            "allow-popups" => FrameCapability::AllowPopups,
            "allow-modals" => FrameCapability::AllowModals,
            "allow-downloads" => FrameCapability::AllowDownloads,
            "allow-popups-to-escape-sandbox" => FrameCapability::AllowPopupsToEscapeSandbox,
            "allow-top-navigation" => FrameCapability::AllowTopNavigation,
            "allow-top-navigation-by-user-activation" => {
                FrameCapability::AllowTopNavigationByUserActivation
            }
            "allow-pointer-lock" => FrameCapability::AllowPointerLock,
            "allow-presentation" => FrameCapability::AllowPresentation,
            other => {
                return Err(SandboxError::Config(format!(
                    "Unknown sandbox capability: {}",
                    other
                )))
            }
        };
        Ok(capability)
    }
}

/// Capability gate for the frame hosting a preview.
///
/// `allow-same-origin` only ever applies to the preview origin, which
/// `EngineConfig::validate` keeps apart from the control API origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePermissions {
    granted: BTreeSet<FrameCapability>,
}

impl Default for FramePermissions {
    fn default() -> Self {
        Self::preview_defaults()
    }
}

impl FramePermissions {
    /// No capabilities at all: a fully locked-down frame.
    pub fn none() -> Self {
        Self {
            granted: BTreeSet::new(),
        }
    }

    /// scripts, same-origin, popups, forms, modals
    pub fn preview_defaults() -> Self {
        let mut permissions = Self::none();
        for capability in [
            FrameCapability::AllowScripts,
            FrameCapability::AllowSameOrigin,
            FrameCapability::AllowPopups,
            FrameCapability::AllowForms,
            FrameCapability::AllowModals,
        ] {
            permissions.granted.insert(capability);
        }
        permissions
    }

    /// Grant a capability. Escalating capabilities are refused.
    pub fn grant(&mut self, capability: FrameCapability) -> SandboxResult<()> {
        if capability.is_escalating() {
            return Err(SandboxError::Config(format!(
                "Capability {} would let the preview act on its embedder",
                capability
            )));
        }
        self.granted.insert(capability);
        Ok(())
    }

    pub fn revoke(&mut self, capability: FrameCapability) {
        self.granted.remove(&capability);
    }

    pub fn allows(&self, capability: FrameCapability) -> bool {
        self.granted.contains(&capability)
    }

    /// Parse a `sandbox` attribute value, rejecting escalating tokens.
    pub fn parse(attribute: &str) -> SandboxResult<Self> {
        let mut permissions = Self::none();
        for token in attribute.split_whitespace() {
            permissions.grant(token.parse()?)?;
        }
        Ok(permissions)
    }

    /// Space-separated attribute value
    pub fn attribute(&self) -> String {
        self.granted
            .iter()
            .map(FrameCapability::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
