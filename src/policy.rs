use crate::dependencies::{baseline_runtime, DependencyDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Sources every assembled document may use.
///
/// `blob:` and `data:` are required because the document itself may be
/// delivered as a blob or data URL.
pub const BASELINE_SOURCES: &[&str] = &[
    "'self'",
    "'unsafe-inline'",
    "'unsafe-eval'",
    "https://unpkg.com",
    "https://cdn.jsdelivr.net",
    "https://cdnjs.cloudflare.com",
    "https://cdn.tailwindcss.com",
    "blob:",
    "data:",
];

/// Content-security policy for one sandboxed document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Ordered, deduplicated source expressions
    origins: Vec<String>,
    /// Extra `connect-src` entries (the message channel endpoint)
    connect_endpoints: Vec<String>,
}

impl Policy {
    pub fn baseline() -> Self {
        let mut policy = Self {
            origins: Vec::new(),
            connect_endpoints: Vec::new(),
        };
        for source in BASELINE_SOURCES {
            policy.allow(source);
        }
        policy
    }

    /// Add a source expression if it is not present yet.
    pub fn allow(&mut self, source: &str) {
        if !self.origins.iter().any(|o| o == source) {
            self.origins.push(source.to_string());
        }
    }

    /// Allow the origin of `url`. Returns false for URLs without a tuple origin.
    pub fn allow_url(&mut self, url: &str) -> bool {
        match origin_of(url) {
            Some(origin) => {
                self.allow(&origin);
                true
            }
            None => false,
        }
    }

    /// Permit connections to exactly `url`'s scheme, host, port and path.
    /// Query and fragment are dropped since source expressions ignore them.
    pub fn allow_connect(&mut self, url: &str) {
        if let Some(endpoint) = endpoint_of(url) {
            if !self.connect_endpoints.contains(&endpoint) {
                self.connect_endpoints.push(endpoint);
            }
        }
    }

    pub fn origins(&self) -> &[String] {
        &self.origins
    }

    pub fn connect_endpoints(&self) -> &[String] {
        &self.connect_endpoints
    }

    pub fn contains(&self, source: &str) -> bool {
        self.origins.iter().any(|o| o == source)
    }

    /// True when `url`'s origin is covered by the policy.
    pub fn permits_url(&self, url: &str) -> bool {
        match origin_of(url) {
            Some(origin) => self.contains(&origin),
            None => {
                let scheme = url.split(':').next().unwrap_or_default();
                self.contains(&format!("{}:", scheme))
            }
        }
    }

    pub fn allows_eval(&self) -> bool {
        self.contains("'unsafe-eval'")
    }

    /// `connect-src` sources: the shared origins minus keywords, so the
    /// document cannot reach its own origin, plus the channel endpoints.
    pub fn connect_sources(&self) -> Vec<&str> {
        self.origins
            .iter()
            .filter(|o| !o.starts_with('\''))
            .chain(&self.connect_endpoints)
            .map(String::as_str)
            .collect()
    }

    /// Render as a policy header / meta value.
    pub fn render(&self) -> String {
        let sources = self.origins.join(" ");
        let connect = self.connect_sources().join(" ");
        format!(
            "default-src {sources}; script-src {sources}; style-src {sources}; \
             img-src {sources}; font-src {sources}; connect-src {connect}; \
             object-src 'none'; base-uri 'self'"
        )
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// `scheme://host[:port]` for URLs with a tuple origin.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let origin = parsed.origin();
    if origin.is_tuple() {
        Some(origin.ascii_serialization())
    } else {
        None
    }
}

/// `scheme://host[:port]/path` without query or fragment.
fn endpoint_of(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    if !parsed.origin().is_tuple() {
        return None;
    }
    parsed.set_query(None);
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

/// Baseline plus the origin of every URL of every dependency (and of the
/// baseline runtime), deduplicated in first-seen order.
pub fn build_policy(dependencies: &[DependencyDescriptor]) -> Policy {
    let mut policy = Policy::baseline();
    for dependency in baseline_runtime().iter().chain(dependencies) {
        for url in dependency.urls() {
            policy.allow_url(url);
        }
    }
    policy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::detect;

    #[test]
    fn baseline_includes_blob_and_data() {
        let policy = build_policy(&[]);
        assert!(policy.contains("blob:"));
        assert!(policy.contains("data:"));
        assert!(policy.allows_eval());
    }

    #[test]
    fn shared_origin_appears_once() {
        let deps = detect("import _ from 'lodash';\nimport moment from 'moment';");
        assert_eq!(deps.len(), 2);
        let policy = build_policy(&deps);
        let count = policy
            .origins()
            .iter()
            .filter(|o| *o == "https://cdnjs.cloudflare.com")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn covers_every_dependency_url() {
        let deps = detect(
            "import axios from 'axios'; import * as d3 from 'd3'; import 'animate.css';",
        );
        let policy = build_policy(&deps);
        for dep in baseline_runtime().iter().chain(&deps) {
            for url in dep.urls() {
                assert!(policy.permits_url(url), "{} not permitted", url);
            }
        }
    }

    #[test]
    fn renders_uniform_directives() {
        let mut policy = build_policy(&[]);
        policy.allow_connect("ws://127.0.0.1:4174/sandboxes/x/channel?token=abc");
        let rendered = policy.render();
        let sources = policy.origins().join(" ");
        for directive in ["script-src", "style-src", "img-src", "font-src"] {
            assert!(rendered.contains(&format!("{} {};", directive, sources)));
        }
        assert!(rendered.contains("ws://127.0.0.1:4174/sandboxes/x/channel;"));
        assert!(!rendered.contains("token=abc"));
        assert!(rendered.contains("object-src 'none'"));
    }

    #[test]
    fn connect_src_excludes_own_origin() {
        let mut policy = build_policy(&[]);
        policy.allow_connect("ws://127.0.0.1:4174/sandboxes/x/channel?token=abc");
        let rendered = policy.render();
        let connect = rendered
            .split("; ")
            .find(|d| d.starts_with("connect-src "))
            .unwrap();
        assert!(!connect.contains("'self'"));
        assert!(!connect.contains("'unsafe-eval'"));
        assert!(connect.contains("https://unpkg.com"));
        assert!(connect.ends_with(" ws://127.0.0.1:4174/sandboxes/x/channel"));
    }

    #[test]
    fn origin_strips_path_and_keeps_port() {
        assert_eq!(
            origin_of("https://cdn.example.com:8443/a/b.js").as_deref(),
            Some("https://cdn.example.com:8443")
        );
        assert_eq!(origin_of("https://unpkg.com/react").as_deref(), Some("https://unpkg.com"));
        assert_eq!(origin_of("data:text/css,body{}"), None);
        assert_eq!(origin_of("not a url"), None);
    }
}
