//! Builds the self-contained HTML document a sandbox renders.
//!
//! Layout, in order: policy meta tag, sandbox configuration, the
//! instrumentation script, dependency tags, the mount node, harness scripts,
//! then the generated source and the bootstrap that evaluates it. The
//! instrumentation runs before any dependency so load failures and early
//! console output are captured.

use crate::dependencies::{baseline_runtime, AssetType, DependencyDescriptor};
use crate::error::{SandboxError, SandboxResult};
use crate::module_shim::{shim_document, ShimmedModule};
use crate::policy::Policy;
use serde::Serialize;

const INSTRUMENTATION_JS: &str = include_str!("harness/instrumentation.js");
const ERROR_BOUNDARY_JS: &str = include_str!("harness/error_boundary.js");
const ROUTER_JS: &str = include_str!("harness/router.js");
const AUTH_JS: &str = include_str!("harness/auth.js");
const HOT_RELOAD_JS: &str = include_str!("harness/hot_reload.js");
const BOOTSTRAP_JS: &str = include_str!("harness/bootstrap.js");

const BASE_STYLE: &str = "\
body { margin: 0; font-family: system-ui, -apple-system, sans-serif; }
.sandbox-error { margin: 2rem; padding: 1.5rem; border: 1px solid #fca5a5; border-radius: 0.5rem; background: #fef2f2; color: #7f1d1d; }
.sandbox-error pre { white-space: pre-wrap; font-size: 0.85rem; }
.sandbox-error button { margin-right: 0.5rem; padding: 0.4rem 0.9rem; border-radius: 0.375rem; border: 1px solid #b91c1c; background: #fff; cursor: pointer; }";

/// Knobs that are not part of the source itself
#[derive(Debug, Clone, Default)]
pub struct AssemblyOptions {
    /// WebSocket endpoint the harness connects back to
    pub channel_url: Option<String>,
    /// Sanitized stylesheets from the bundle, inlined after dependency styles
    pub stylesheets: Vec<String>,
    pub title: Option<String>,
    pub hot_reload: bool,
}

/// The assembled document plus what the shim learned about the source
#[derive(Debug, Clone)]
pub struct AssembledDocument {
    pub html: String,
    pub module: ShimmedModule,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarnessConfig<'a> {
    sandbox_id: &'a str,
    channel_url: Option<&'a str>,
    entry: Option<&'a str>,
    components: &'a [String],
    dependencies: Vec<&'a str>,
    self_mounting: bool,
    hot_reload: bool,
}

/// Escape text for HTML element content and double- or single-quoted attributes.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Neutralise sequences that would end an inline `<script>` or `<style>` block.
fn inline_safe(text: &str) -> String {
    text.replace("</", "<\\/").replace("<!--", "<\\!--")
}

/// JSON literal safe to place inside an inline script.
fn script_json<T: Serialize + ?Sized>(value: &T) -> SandboxResult<String> {
    Ok(inline_safe(&serde_json::to_string(value)?))
}

fn dependency_tag(dependency: &DependencyDescriptor) -> SandboxResult<Option<String>> {
    let mut urls = dependency.urls();
    let first = match urls.next() {
        Some(url) => url,
        None => return Ok(None),
    };
    let rest: Vec<&str> = urls.collect();
    let fallbacks = escape_html(&serde_json::to_string(&rest)?);
    let name = escape_html(&dependency.name);
    let tag = match dependency.asset_type {
        AssetType::Script => format!(
            "<script src=\"{}\" data-sandbox-dependency=\"{}\" data-required=\"{}\" data-fallbacks=\"{}\" onerror=\"__sandboxFallback(this)\"></script>",
            escape_html(first),
            name,
            dependency.required,
            fallbacks
        ),
        AssetType::Style => format!(
            "<link rel=\"stylesheet\" href=\"{}\" data-sandbox-dependency=\"{}\" data-required=\"{}\" data-fallbacks=\"{}\" onerror=\"__sandboxFallback(this)\">",
            escape_html(first),
            name,
            dependency.required,
            fallbacks
        ),
    };
    Ok(Some(tag))
}

fn inline_script(out: &mut String, body: &str) {
    out.push_str("<script>\n");
    out.push_str(body);
    out.push_str("\n</script>\n");
}

/// Assemble the full preview document.
///
/// `sanitized_source` must already have passed through the sanitizer. The
/// baseline runtime is always loaded ahead of `dependencies`; styles are
/// emitted before scripts.
pub fn assemble(
    sanitized_source: &str,
    dependencies: &[DependencyDescriptor],
    policy: &Policy,
    sandbox_id: &str,
    options: &AssemblyOptions,
) -> SandboxResult<AssembledDocument> {
    if sanitized_source.trim().is_empty() {
        return Err(SandboxError::Assembly("Source is empty".to_string()));
    }

    let module = shim_document(sanitized_source);
    let all: Vec<&DependencyDescriptor> = baseline_runtime().iter().chain(dependencies).collect();

    let config = HarnessConfig {
        sandbox_id,
        channel_url: options.channel_url.as_deref(),
        entry: module.entry.as_deref(),
        components: &module.components,
        dependencies: all.iter().map(|d| d.name.as_str()).collect(),
        self_mounting: module.self_mounting,
        hot_reload: options.hot_reload,
    };

    let title = options.title.as_deref().unwrap_or("Preview");
    let mut html = String::with_capacity(sanitized_source.len() + 32 * 1024);
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    html.push_str(&format!(
        "<meta http-equiv=\"Content-Security-Policy\" content=\"{}\">\n",
        escape_html(&policy.render())
    ));
    html.push_str(&format!("<title>{}</title>\n", escape_html(title)));
    inline_script(
        &mut html,
        &format!("window.__SANDBOX__ = {};", script_json(&config)?),
    );
    inline_script(&mut html, INSTRUMENTATION_JS);

    for dependency in all.iter().filter(|d| d.asset_type == AssetType::Style) {
        if let Some(tag) = dependency_tag(dependency)? {
            html.push_str(&tag);
            html.push('\n');
        }
    }
    html.push_str(&format!("<style>\n{}\n</style>\n", BASE_STYLE));
    for sheet in &options.stylesheets {
        html.push_str(&format!("<style>\n{}\n</style>\n", inline_safe(sheet)));
    }
    for dependency in all.iter().filter(|d| d.asset_type == AssetType::Script) {
        if let Some(tag) = dependency_tag(dependency)? {
            html.push_str(&tag);
            html.push('\n');
        }
    }

    html.push_str("</head>\n<body>\n<div id=\"root\"></div>\n");
    for harness in [ERROR_BOUNDARY_JS, ROUTER_JS, AUTH_JS, HOT_RELOAD_JS] {
        inline_script(&mut html, harness);
    }
    inline_script(
        &mut html,
        &format!("window.__SANDBOX_SOURCE__ = {};", script_json(&module.code)?),
    );
    inline_script(&mut html, BOOTSTRAP_JS);
    html.push_str("</body>\n</html>\n");

    Ok(AssembledDocument { html, module })
}

/// Standalone document shown when generation fails.
///
/// Uses only the baseline policy and inline script; the error text is
/// escaped so it can never become markup.
pub fn error_document(message: &str, sandbox_id: Option<&str>) -> String {
    let policy = Policy::baseline();
    let id = sandbox_id
        .and_then(|id| serde_json::to_string(id).ok())
        .map(|id| inline_safe(&id))
        .unwrap_or_else(|| "null".to_string());
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
<meta http-equiv=\"Content-Security-Policy\" content=\"{policy}\">\n\
<title>Preview error</title>\n<style>\n{style}\n</style>\n</head>\n<body>\n\
<div class=\"sandbox-error\" role=\"alert\">\n<h2>Preview could not be generated</h2>\n\
<pre>{message}</pre>\n\
<button type=\"button\" id=\"sandbox-retry\">Retry</button>\n\
<button type=\"button\" id=\"sandbox-regenerate\">Regenerate source</button>\n</div>\n\
<script>\n(function () {{\n  var sandboxId = {id};\n\
  function post(type) {{ if (window.parent !== window) window.parent.postMessage({{ type: type, sandboxId: sandboxId }}, '*'); }}\n\
  document.getElementById('sandbox-retry').addEventListener('click', function () {{ window.location.reload(); }});\n\
  document.getElementById('sandbox-regenerate').addEventListener('click', function () {{ post('regenerate-request'); }});\n\
}})();\n</script>\n</body>\n</html>\n",
        policy = escape_html(&policy.render()),
        style = BASE_STYLE,
        message = escape_html(message),
        id = id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::detect;
    use crate::policy::build_policy;

    const APP: &str = "import React, { useState } from 'react';\n\
import axios from 'axios';\n\
export default function App() {\n\
  const [n, setN] = useState(0);\n\
  return <div className=\"x\">{n} </div>;\n\
}\n";

    fn build(source: &str) -> AssembledDocument {
        let deps = detect(source);
        let policy = build_policy(&deps);
        assemble(source, &deps, &policy, "sb-1", &AssemblyOptions::default()).unwrap()
    }

    fn unescape(text: &str) -> String {
        text.replace("&#39;", "'")
            .replace("&quot;", "\"")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&")
    }

    #[test]
    fn embeds_the_rendered_policy() {
        let deps = detect(APP);
        let policy = build_policy(&deps);
        let doc = assemble(APP, &deps, &policy, "sb-1", &AssemblyOptions::default()).unwrap();
        let marker = "<meta http-equiv=\"Content-Security-Policy\" content=\"";
        let start = doc.html.find(marker).unwrap() + marker.len();
        let end = start + doc.html[start..].find('"').unwrap();
        assert_eq!(unescape(&doc.html[start..end]), policy.render());
    }

    #[test]
    fn instrumentation_precedes_dependencies() {
        let doc = build(APP);
        let instrumentation = doc.html.find("__sandboxSend = send").unwrap();
        let react = doc.html.find("data-sandbox-dependency=\"react\"").unwrap();
        let axios = doc.html.find("data-sandbox-dependency=\"axios\"").unwrap();
        let source = doc.html.find("__SANDBOX_SOURCE__ =").unwrap();
        assert!(instrumentation < react);
        assert!(react < axios);
        assert!(axios < source);
    }

    #[test]
    fn source_cannot_close_the_script_block() {
        let doc = build(APP);
        let opened = doc.html.matches("<script").count();
        let closed = doc.html.matches("</script>").count();
        assert_eq!(opened, closed);
        assert!(doc.html.contains("<\\/div>"));
    }

    #[test]
    fn fallback_urls_are_attribute_escaped() {
        let doc = build(APP);
        assert!(doc
            .html
            .contains("data-fallbacks=\"[&quot;https://cdn.jsdelivr.net/npm/react@18"));
    }

    #[test]
    fn config_reports_entry_and_channel() {
        let deps = detect(APP);
        let policy = build_policy(&deps);
        let options = AssemblyOptions {
            channel_url: Some("ws://127.0.0.1:4173/sandboxes/sb-1/channel".to_string()),
            ..Default::default()
        };
        let doc = assemble(APP, &deps, &policy, "sb-1", &options).unwrap();
        assert_eq!(doc.module.entry.as_deref(), Some("App"));
        assert!(doc.html.contains("\"sandboxId\":\"sb-1\""));
        assert!(doc.html.contains("\"channelUrl\":\"ws://127.0.0.1:4173/sandboxes/sb-1/channel\""));
        assert!(doc.html.contains("\"entry\":\"App\""));
    }

    #[test]
    fn react_shims_install_at_mount_not_at_parse() {
        for script in [ROUTER_JS, AUTH_JS, ERROR_BOUNDARY_JS] {
            assert!(!script.contains("if (!window.React) return;"));
            assert!(script.contains("window.__sandboxInstallers"));
        }
        let runtime_check = BOOTSTRAP_JS.find("Runtime libraries failed to load").unwrap();
        let install = BOOTSTRAP_JS.find("installHarness();").unwrap();
        let evaluate = BOOTSTRAP_JS
            .find("__sandboxEvaluate(window.__SANDBOX_SOURCE__)")
            .unwrap();
        assert!(runtime_check < install && install < evaluate);
        assert!(BOOTSTRAP_JS.contains("window.addEventListener('load', mount)"));

        let doc = build(APP);
        let shims = doc.html.find("installRouter").unwrap();
        let bootstrap = doc.html.find("function installHarness").unwrap();
        assert!(shims < bootstrap);
    }

    #[test]
    fn empty_source_is_an_assembly_error() {
        let err = assemble("  \n", &[], &Policy::baseline(), "sb", &AssemblyOptions::default())
            .unwrap_err();
        assert!(matches!(err, SandboxError::Assembly(_)));
    }

    #[test]
    fn error_document_escapes_message() {
        let doc = error_document("<img src=x onerror=alert(1)>", Some("sb-9"));
        assert!(!doc.contains("<img"));
        assert!(doc.contains("&lt;img src=x onerror=alert(1)&gt;"));
        assert!(doc.contains("Retry"));
        assert!(doc.contains("regenerate-request"));
        assert!(doc.contains("\"sb-9\""));
    }

    #[test]
    fn escape_html_covers_quotes() {
        assert_eq!(escape_html(r#"<a href="x">'&'</a>"#), "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;");
    }
}
