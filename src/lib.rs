//! Preview Sandbox - isolated previews for generated front-end code
//!
//! Turns a bundle of generated React/JSX sources into a self-contained
//! document served from a separate preview origin, then keeps a message
//! channel open to the running document for telemetry, inspection and hot
//! component updates.
//!
//! # Features
//!
//! - **Dependency Detection**: Picks CDN libraries from a fixed catalog by usage signature
//! - **Sanitization**: Neutralises dangerous runtime constructs before assembly
//! - **Content Security Policy**: Built from the detected dependencies only
//! - **Message Channel**: Session-aware, bounded, with request/response inspection
//! - **Telemetry**: Performance, accessibility and security reports plus a smoke suite
//!
//! # Quick Start
//!
//! ```rust
//! use preview_sandbox::{PreviewEngine, SourceBundle};
//!
//! let engine = PreviewEngine::default();
//! let bundle = SourceBundle::from_frontend(
//!     "export default function App() { return <h1>Hello</h1>; }",
//! );
//!
//! let result = engine.generate_preview(&bundle);
//! assert!(result.is_ready());
//!
//! let id = result.sandbox_id.unwrap();
//! engine.cleanup_preview_environment(&id);
//! ```

pub mod bundle;
pub mod channel;
pub mod config;
pub mod dependencies;
pub mod document;
pub mod engine;
pub mod error;
pub mod host;
pub mod module_shim;
pub mod permissions;
pub mod policy;
pub mod registry;
pub mod revisions;
pub mod sanitizer;
pub mod server;
pub mod telemetry;

// Re-export main types
pub use bundle::{SourceBundle, SourceFile};
pub use channel::{
    Delivery, ElementInfo, HostMessage, MessageChannel, NetworkConditions, SandboxMessage,
};
pub use config::EngineConfig;
pub use dependencies::{detect, AssetType, DependencyDescriptor};
pub use document::{assemble, AssemblyOptions};
pub use engine::{ComponentUpdate, PreviewEngine, PreviewResult, PreviewStatus};
pub use error::{SandboxError, SandboxResult};
pub use host::{DocumentStore, HostedDocument};
pub use permissions::{FrameCapability, FramePermissions};
pub use policy::{build_policy, Policy};
pub use registry::{EnvironmentSnapshot, SandboxStatus};
pub use sanitizer::{sanitize, sanitize_with_report, SanitizationReport};
pub use telemetry::{AccessibilityReport, PerformanceMetrics, SecurityReport, TestReport};
