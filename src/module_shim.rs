//! Rewrites ES-module syntax in generated sources into plain script code.
//!
//! The in-browser transpiler cannot link modules, so imports become
//! destructuring from UMD globals (or the harness-provided router/auth
//! capabilities) and exports are stripped. Top-level components are routed
//! through the harness hot registry so a single component can later be
//! swapped without remounting the tree.

use crate::dependencies::global_for;
use crate::error::{SandboxError, SandboxResult};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Name bound to an anonymous default export
pub const DEFAULT_ENTRY: &str = "__SandboxEntry";

static IMPORT_FROM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s+(?P<clause>[^;'"]*?)\s*from\s*['"](?P<spec>[^'"]+)['"][ \t]*;?"#)
        .unwrap()
});
static IMPORT_BARE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s*['"](?P<spec>[^'"]+)['"][ \t]*;?"#).unwrap()
});
static EXPORT_DEFAULT_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^(?P<indent>[ \t]*)export\s+default\s+(?P<kind>(?:async\s+)?function\*?|class)\s+(?P<name>[A-Za-z_$][\w$]*)",
    )
    .unwrap()
});
static EXPORT_DEFAULT_IDENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*export\s+default\s+(?P<name>[A-Za-z_$][\w$]*)[ \t]*;?[ \t]*$").unwrap()
});
static EXPORT_DEFAULT_EXPR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(?P<indent>[ \t]*)export\s+default\s+").unwrap());
static EXPORT_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^[ \t]*export\s*\{[^}]*\}\s*(?:from\s*['"][^'"]*['"])?[ \t]*;?"#).unwrap()
});
static EXPORT_NAMED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^(?P<indent>[ \t]*)export\s+(?P<kw>const|let|var|function|class|async\s+function|type|interface|enum)\b",
    )
    .unwrap()
});
static TOP_LEVEL_COMPONENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^(?:(?:async\s+)?function\*?\s+|class\s+|(?P<decl>const|let)\s+)(?P<name>[A-Z][a-z][\w$]*)\b",
    )
    .unwrap()
});
static SELF_MOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:createRoot|hydrateRoot)\s*\(|\bReactDOM\s*\.\s*render\s*\(").unwrap()
});
static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_$][\w$]*$").unwrap());

/// Result of rewriting one module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimmedModule {
    pub code: String,
    /// Component the harness mounts
    pub entry: Option<String>,
    /// Top-level components registered for hot swapping
    pub components: Vec<String>,
    pub unresolved_imports: Vec<String>,
    /// The source mounts itself, so the harness must not
    pub self_mounting: bool,
}

/// Expression a module specifier resolves to inside the sandbox.
fn module_expr(spec: &str) -> Option<String> {
    let lower = spec.to_ascii_lowercase();
    if lower.starts_with('.') || lower.starts_with('/') {
        return if lower.contains("auth") {
            Some("window.SandboxAuth".to_string())
        } else if lower.contains("router") || lower.contains("routes") {
            Some("window.SandboxRouter".to_string())
        } else {
            None
        };
    }
    if spec == "react-router-dom" || spec == "react-router" {
        return Some("(window.SandboxRouter || window.ReactRouterDOM)".to_string());
    }
    global_for(spec).map(|global| match global {
        "React" | "ReactDOM" => format!("window.{}", global),
        other => format!("window[{}]", serde_json::Value::String(other.to_string())),
    })
}

/// Translate one import clause into declarations, skipping names bound earlier.
fn bind_clause(clause: &str, expr: &str, bound: &mut BTreeSet<String>) -> String {
    let clause = clause.trim();
    if clause.starts_with("type ") || clause.starts_with("type{") {
        return String::new();
    }

    let mut out = Vec::new();
    let mut rest = clause;

    // default binding precedes `{` or `*`
    if !rest.starts_with('{') && !rest.starts_with('*') {
        let (default, tail) = match rest.find(',') {
            Some(idx) => (rest[..idx].trim(), rest[idx + 1..].trim()),
            None => (rest, ""),
        };
        if IDENTIFIER.is_match(default) && bound.insert(default.to_string()) {
            out.push(format!("const {} = __sandboxInterop({});", default, expr));
        }
        rest = tail;
    }

    if let Some(ns) = rest.strip_prefix('*') {
        let name = ns.trim().trim_start_matches("as").trim();
        if IDENTIFIER.is_match(name) && bound.insert(name.to_string()) {
            out.push(format!("const {} = {};", name, expr));
        }
    } else if rest.starts_with('{') {
        let inner = rest.trim_start_matches('{').trim_end_matches('}');
        let mut fields = Vec::new();
        for part in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part.starts_with("type ") {
                continue;
            }
            let (imported, local) = match part.split_once(" as ") {
                Some((imported, local)) => (imported.trim(), local.trim()),
                None => (part, part),
            };
            if !IDENTIFIER.is_match(imported) || !IDENTIFIER.is_match(local) {
                continue;
            }
            if !bound.insert(local.to_string()) {
                continue;
            }
            if imported == local {
                fields.push(local.to_string());
            } else {
                fields.push(format!("{}: {}", imported, local));
            }
        }
        if !fields.is_empty() {
            out.push(format!("const {{ {} }} = ({} || {{}});", fields.join(", "), expr));
        }
    }

    out.join(" ")
}

fn rewrite_imports(source: &str, unresolved: &mut Vec<String>) -> String {
    let mut bound = BTreeSet::new();
    let rewritten = IMPORT_FROM.replace_all(source, |caps: &Captures| {
        let spec = &caps["spec"];
        let expr = match module_expr(spec) {
            Some(expr) => expr,
            None => {
                if !unresolved.iter().any(|u| u == spec) {
                    unresolved.push(spec.to_string());
                }
                "{}".to_string()
            }
        };
        bind_clause(&caps["clause"], &expr, &mut bound)
    });
    IMPORT_BARE.replace_all(&rewritten, "").into_owned()
}

/// Strip export syntax, returning the code and the default-exported name.
fn rewrite_exports(source: &str) -> (String, Option<String>) {
    let mut entry = None;

    let code = EXPORT_DEFAULT_DECL.replace_all(source, |caps: &Captures| {
        entry.get_or_insert_with(|| caps["name"].to_string());
        format!("{}{} {}", &caps["indent"], &caps["kind"], &caps["name"])
    });
    let code = EXPORT_DEFAULT_IDENT.replace_all(&code, |caps: &Captures| {
        entry.get_or_insert_with(|| caps["name"].to_string());
        String::new()
    });
    let code = EXPORT_DEFAULT_EXPR.replace_all(&code, |caps: &Captures| {
        entry.get_or_insert_with(|| DEFAULT_ENTRY.to_string());
        format!("{}const {} = ", &caps["indent"], DEFAULT_ENTRY)
    });
    let code = EXPORT_LIST.replace_all(&code, "");
    let code = EXPORT_NAMED.replace_all(&code, "${indent}${kw}");

    (code.into_owned(), entry)
}

fn return_entry(entry: &str) -> String {
    format!(
        "return typeof {entry} !== \"undefined\" ? {entry} : (typeof App !== \"undefined\" ? App : null);"
    )
}

/// Rewrite the entry module of a preview document.
pub fn shim_document(source: &str) -> ShimmedModule {
    let mut unresolved = Vec::new();
    let code = rewrite_imports(source, &mut unresolved);
    let (code, entry) = rewrite_exports(&code);

    let mut components = Vec::new();
    let code = TOP_LEVEL_COMPONENT.replace_all(&code, |caps: &Captures| {
        let name = caps["name"].to_string();
        if !components.contains(&name) {
            components.push(name);
        }
        match caps.name("decl") {
            // `const` bindings are rebound to their hot proxy below
            Some(_) => format!("let {}", &caps["name"]),
            None => caps[0].to_string(),
        }
    });

    let mut out = code.into_owned();
    out.push_str("\n;\n");
    for name in &components {
        out.push_str(&format!("{name} = __sandboxHot(\"{name}\", {name});\n"));
    }
    let entry = entry.or_else(|| components.iter().find(|c| *c == "App").cloned());
    out.push_str(&return_entry(entry.as_deref().unwrap_or("App")));

    ShimmedModule {
        self_mounting: SELF_MOUNT.is_match(source),
        code: out,
        entry,
        components,
        unresolved_imports: unresolved,
    }
}

/// Rewrite a hot-reload payload defining `component_id`.
pub fn shim_component(source: &str, component_id: &str) -> SandboxResult<ShimmedModule> {
    if !IDENTIFIER.is_match(component_id) {
        return Err(SandboxError::Assembly(format!(
            "component id '{}' is not an identifier",
            component_id
        )));
    }
    let mut unresolved = Vec::new();
    let code = rewrite_imports(source, &mut unresolved);
    let (code, _) = rewrite_exports(&code);

    let mut out = code;
    out.push_str("\n;\n");
    out.push_str(&return_entry(component_id));

    Ok(ShimmedModule {
        code: out,
        entry: Some(component_id.to_string()),
        components: vec![component_id.to_string()],
        unresolved_imports: unresolved,
        self_mounting: false,
    })
}
