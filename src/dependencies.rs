//! Dependency detection.
//!
//! Scans generated source for usage signatures of a fixed catalog of
//! browser libraries. Detection only selects among catalog entries; it never
//! invents descriptors. Signatures are deliberately specific (import
//! specifiers, namespaced calls, characteristic JSX tags) so that common
//! idioms like `.map(` never trigger a match on their own.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of asset a dependency loads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Script,
    Style,
}

/// Catalog record describing how to load a library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyDescriptor {
    pub name: String,
    pub version: String,
    pub asset_type: AssetType,
    /// Tried first, in order
    pub primary_urls: Vec<String>,
    /// Tried after every primary URL failed, in order
    pub fallback_urls: Vec<String>,
    pub required: bool,
    /// UMD global the module shim binds imports to
    pub global: Option<String>,
}

impl DependencyDescriptor {
    fn new(name: &str, version: &str, asset_type: AssetType) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            asset_type,
            primary_urls: Vec::new(),
            fallback_urls: Vec::new(),
            required: false,
            global: None,
        }
    }

    fn primary(mut self, url: &str) -> Self {
        self.primary_urls.push(url.to_string());
        self
    }

    fn fallback(mut self, url: &str) -> Self {
        self.fallback_urls.push(url.to_string());
        self
    }

    fn global(mut self, global: &str) -> Self {
        self.global = Some(global.to_string());
        self
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Every URL in load order: primaries, then fallbacks.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.primary_urls
            .iter()
            .chain(self.fallback_urls.iter())
            .map(String::as_str)
    }
}

struct CatalogEntry {
    descriptor: DependencyDescriptor,
    signatures: Vec<Regex>,
}

impl CatalogEntry {
    fn new(descriptor: DependencyDescriptor, signatures: Vec<Regex>) -> Self {
        Self {
            descriptor,
            signatures,
        }
    }

    fn matches(&self, source: &str) -> bool {
        self.signatures.iter().any(|sig| sig.is_match(source))
    }
}

/// Regex matching an import/require of `package` or one of its subpaths.
fn import_of(package: &str) -> Regex {
    let pattern = format!(
        r#"(?:\bfrom\s*|\bimport\s*\(\s*|\brequire\s*\(\s*|\bimport\s+)['"]{}(?:/[^'"]*)?['"]"#,
        regex::escape(package)
    );
    Regex::new(&pattern).unwrap()
}

fn sig(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

static CATALOG: Lazy<Vec<CatalogEntry>> = Lazy::new(|| {
    vec![
        CatalogEntry::new(
            DependencyDescriptor::new("react-router-dom", "6.22.3", AssetType::Script)
                .primary("https://unpkg.com/react-router-dom@6.22.3/dist/umd/react-router-dom.production.min.js")
                .fallback("https://cdn.jsdelivr.net/npm/react-router-dom@6.22.3/dist/umd/react-router-dom.production.min.js")
                .global("ReactRouterDOM"),
            vec![
                import_of("react-router-dom"),
                sig(r"<(?:BrowserRouter|HashRouter|MemoryRouter)\b"),
                sig(r"\buse(?:Navigate|Params|Location|SearchParams)\s*\("),
            ],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("framer-motion", "10.16.4", AssetType::Script)
                .primary("https://unpkg.com/framer-motion@10.16.4/dist/framer-motion.js")
                .fallback("https://cdn.jsdelivr.net/npm/framer-motion@10.16.4/dist/framer-motion.js")
                .global("Motion"),
            vec![
                import_of("framer-motion"),
                sig(r"<motion\.[a-z][A-Za-z0-9]*\b"),
                sig(r"<AnimatePresence\b"),
            ],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("lucide-react", "0.294.0", AssetType::Script)
                .primary("https://unpkg.com/lucide-react@0.294.0/dist/umd/lucide-react.js")
                .fallback("https://cdn.jsdelivr.net/npm/lucide-react@0.294.0/dist/umd/lucide-react.js")
                .global("LucideReact"),
            vec![import_of("lucide-react")],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("recharts", "2.10.3", AssetType::Script)
                .primary("https://unpkg.com/recharts@2.10.3/umd/Recharts.js")
                .fallback("https://cdn.jsdelivr.net/npm/recharts@2.10.3/umd/Recharts.js")
                .global("Recharts"),
            vec![
                import_of("recharts"),
                sig(r"<ResponsiveContainer\b"),
                sig(r"<(?:LineChart|BarChart|AreaChart|PieChart|RadarChart|ComposedChart)\b"),
            ],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("axios", "1.6.2", AssetType::Script)
                .primary("https://cdn.jsdelivr.net/npm/axios@1.6.2/dist/axios.min.js")
                .fallback("https://unpkg.com/axios@1.6.2/dist/axios.min.js")
                .fallback("https://cdnjs.cloudflare.com/ajax/libs/axios/1.6.2/axios.min.js")
                .global("axios"),
            vec![
                import_of("axios"),
                sig(r"\baxios\s*\.\s*(?:get|post|put|patch|delete|request|create)\s*\("),
            ],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("lodash", "4.17.21", AssetType::Script)
                .primary("https://cdnjs.cloudflare.com/ajax/libs/lodash.js/4.17.21/lodash.min.js")
                .fallback("https://cdn.jsdelivr.net/npm/lodash@4.17.21/lodash.min.js")
                .global("_"),
            vec![
                import_of("lodash"),
                sig(r"\b_\s*\.\s*(?:debounce|throttle|cloneDeep|groupBy|sortBy|uniqBy|orderBy|chunk|merge|isEqual)\s*\("),
            ],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("date-fns", "2.30.0", AssetType::Script)
                .primary("https://cdn.jsdelivr.net/npm/date-fns@2.30.0/cdn.min.js")
                .fallback("https://unpkg.com/date-fns@2.30.0/cdn.min.js")
                .global("dateFns"),
            vec![import_of("date-fns"), sig(r"\bdateFns\s*\.")],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("moment", "2.29.4", AssetType::Script)
                .primary("https://cdnjs.cloudflare.com/ajax/libs/moment.js/2.29.4/moment.min.js")
                .fallback("https://cdn.jsdelivr.net/npm/moment@2.29.4/moment.min.js")
                .global("moment"),
            vec![import_of("moment"), sig(r"\bmoment\s*\(\s*\)\s*\.")],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("chart.js", "4.4.0", AssetType::Script)
                .primary("https://cdn.jsdelivr.net/npm/chart.js@4.4.0/dist/chart.umd.min.js")
                .fallback("https://unpkg.com/chart.js@4.4.0/dist/chart.umd.min.js")
                .global("Chart"),
            vec![import_of("chart.js"), sig(r"\bnew\s+Chart\s*\(")],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("d3", "7.8.5", AssetType::Script)
                .primary("https://cdn.jsdelivr.net/npm/d3@7.8.5/dist/d3.min.js")
                .fallback("https://unpkg.com/d3@7.8.5/dist/d3.min.js")
                .global("d3"),
            vec![
                import_of("d3"),
                sig(r"\bd3\s*\.\s*(?:select|selectAll|scale[A-Z]\w*|axis[A-Z]\w*|line|arc|pie)\s*\("),
            ],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("three", "0.158.0", AssetType::Script)
                .primary("https://unpkg.com/three@0.158.0/build/three.min.js")
                .fallback("https://cdn.jsdelivr.net/npm/three@0.158.0/build/three.min.js")
                .global("THREE"),
            vec![import_of("three"), sig(r"\bnew\s+THREE\s*\.")],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("zustand", "4.4.7", AssetType::Script)
                .primary("https://unpkg.com/zustand@4.4.7/umd/index.production.js")
                .fallback("https://cdn.jsdelivr.net/npm/zustand@4.4.7/umd/index.production.js")
                .global("zustand"),
            vec![import_of("zustand")],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("clsx", "2.0.0", AssetType::Script)
                .primary("https://unpkg.com/clsx@2.0.0/dist/clsx.min.js")
                .fallback("https://cdn.jsdelivr.net/npm/clsx@2.0.0/dist/clsx.min.js")
                .global("clsx"),
            vec![import_of("clsx")],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("animate.css", "4.1.1", AssetType::Style)
                .primary("https://cdnjs.cloudflare.com/ajax/libs/animate.css/4.1.1/animate.min.css")
                .fallback("https://cdn.jsdelivr.net/npm/animate.css@4.1.1/animate.min.css"),
            vec![import_of("animate.css"), sig(r"\banimate__animated\b")],
        ),
        CatalogEntry::new(
            DependencyDescriptor::new("font-awesome", "6.4.2", AssetType::Style)
                .primary("https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.2/css/all.min.css")
                .fallback("https://cdn.jsdelivr.net/npm/@fortawesome/fontawesome-free@6.4.2/css/all.min.css"),
            vec![
                import_of("@fortawesome/fontawesome-free"),
                import_of("font-awesome"),
                sig(r#"className\s*=\s*["'][^"']*\bfa-(?:solid|regular|brands)\b"#),
            ],
        ),
    ]
});

static BASELINE_RUNTIME: Lazy<Vec<DependencyDescriptor>> = Lazy::new(|| {
    vec![
        DependencyDescriptor::new("react", "18.2.0", AssetType::Script)
            .primary("https://unpkg.com/react@18.2.0/umd/react.production.min.js")
            .fallback("https://cdn.jsdelivr.net/npm/react@18.2.0/umd/react.production.min.js")
            .global("React")
            .required(),
        DependencyDescriptor::new("react-dom", "18.2.0", AssetType::Script)
            .primary("https://unpkg.com/react-dom@18.2.0/umd/react-dom.production.min.js")
            .fallback("https://cdn.jsdelivr.net/npm/react-dom@18.2.0/umd/react-dom.production.min.js")
            .global("ReactDOM")
            .required(),
        DependencyDescriptor::new("@babel/standalone", "7.23.5", AssetType::Script)
            .primary("https://unpkg.com/@babel/standalone@7.23.5/babel.min.js")
            .fallback("https://cdn.jsdelivr.net/npm/@babel/standalone@7.23.5/babel.min.js")
            .global("Babel")
            .required(),
        DependencyDescriptor::new("tailwindcss", "3.3.5", AssetType::Script)
            .primary("https://cdn.tailwindcss.com/3.3.5")
            .fallback("https://cdn.jsdelivr.net/npm/tailwindcss-cdn@3.3.5/tailwindcss.js")
            .required(),
    ]
});

/// Runtime scripts every assembled document loads before detected dependencies.
pub fn baseline_runtime() -> &'static [DependencyDescriptor] {
    &BASELINE_RUNTIME
}

/// Every catalog descriptor, in catalog order.
pub fn catalog() -> impl Iterator<Item = &'static DependencyDescriptor> {
    CATALOG.iter().map(|entry| &entry.descriptor)
}

/// Detect catalog dependencies used by `source`.
///
/// Result order is catalog order, not source order. Unmatched text yields an
/// empty list.
pub fn detect(source: &str) -> Vec<DependencyDescriptor> {
    CATALOG
        .iter()
        .filter(|entry| entry.matches(source))
        .map(|entry| entry.descriptor.clone())
        .collect()
}

/// UMD global for an import specifier, checking the baseline then the catalog.
pub fn global_for(specifier: &str) -> Option<&'static str> {
    let package = package_name(specifier);
    BASELINE_RUNTIME
        .iter()
        .chain(catalog())
        .find(|d| d.name == package)
        .and_then(|d| d.global.as_deref())
}

/// `@scope/pkg/sub` → `@scope/pkg`, `pkg/sub` → `pkg`.
fn package_name(specifier: &str) -> &str {
    let mut parts = specifier.splitn(3, '/');
    let first = parts.next().unwrap_or(specifier);
    if first.starts_with('@') {
        match parts.next() {
            Some(second) => &specifier[..first.len() + 1 + second.len()],
            None => specifier,
        }
    } else {
        first
    }
}
