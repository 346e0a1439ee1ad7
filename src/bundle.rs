use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Key callers use for the primary front-end source.
pub const FRONTEND_KEY: &str = "frontend";

const SCRIPT_EXTENSIONS: &[&str] = &["jsx", "tsx", "js", "ts"];
const BUNDLED_EXTENSIONS: &[&str] = &["jsx", "tsx", "js", "ts", "css", "html", "json"];

/// A file inside a source bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
    pub hash: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let hash = Self::compute_hash(content.as_bytes());
        Self {
            path: path.into(),
            content,
            hash,
        }
    }

    fn compute_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    pub fn is_script(&self) -> bool {
        extension(&self.path)
            .map(|ext| SCRIPT_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
    }
}

fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext)
}

/// Virtual path → text content for one preview generation.
///
/// Never mutated after it is handed to the engine; regeneration builds a new bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceBundle {
    files: BTreeMap<String, SourceFile>,
}

impl SourceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle holding only a `frontend` entry.
    pub fn from_frontend(source: impl Into<String>) -> Self {
        Self::new().with_file(FRONTEND_KEY, source)
    }

    pub fn from_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        files
            .into_iter()
            .fold(Self::new(), |bundle, (path, content)| bundle.with_file(path, content))
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        let file = SourceFile::new(path, content);
        self.files.insert(file.path.clone(), file);
        self
    }

    /// Load every front-end file under a directory
    pub fn from_directory(path: &Path) -> SandboxResult<Self> {
        if !path.is_dir() {
            return Err(SandboxError::InvalidBundle(format!(
                "Directory does not exist: {}",
                path.display()
            )));
        }

        let mut bundle = Self::new();
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                name != "node_modules" && !name.starts_with('.')
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match entry.path().strip_prefix(path) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            let keep = extension(&relative)
                .map(|ext| BUNDLED_EXTENSIONS.contains(&ext))
                .unwrap_or(false);
            if !keep {
                continue;
            }
            let content = std::fs::read_to_string(entry.path())?;
            bundle = bundle.with_file(relative, content);
        }

        Ok(bundle)
    }

    /// Load a single file as the `frontend` entry, or a directory as a bundle.
    pub fn load(path: &Path) -> SandboxResult<Self> {
        if path.is_dir() {
            Self::from_directory(path)
        } else {
            let content = std::fs::read_to_string(path)?;
            Ok(Self::from_frontend(content))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn get(&self, path: &str) -> Option<&SourceFile> {
        self.files.get(path)
    }

    pub fn files(&self) -> impl Iterator<Item = &SourceFile> {
        self.files.values()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.values().map(|f| f.content.len()).sum()
    }

    /// The file rendered as the preview entry point.
    ///
    /// Preference: `frontend`, then an `App` module, then the first script in path order.
    pub fn entry(&self) -> Option<&SourceFile> {
        if let Some(file) = self.files.get(FRONTEND_KEY) {
            return Some(file);
        }
        let app = self.files.values().find(|f| {
            let name = f.path.rsplit('/').next().unwrap_or(&f.path);
            f.is_script() && name.split('.').next() == Some("App")
        });
        app.or_else(|| self.files.values().find(|f| f.is_script()))
    }

    /// Stylesheets shipped alongside the entry
    pub fn stylesheets(&self) -> impl Iterator<Item = &SourceFile> {
        self.files
            .values()
            .filter(|f| extension(&f.path) == Some("css"))
    }

    /// Digest over sorted paths and contents.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, file) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(file.hash.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_key_wins() {
        let bundle = SourceBundle::from_files([
            ("src/App.jsx", "export default function App() {}"),
            ("frontend", "const x = 1;"),
        ]);
        assert_eq!(bundle.entry().unwrap().path, "frontend");
    }

    #[test]
    fn falls_back_to_app_module_then_first_script() {
        let bundle = SourceBundle::from_files([
            ("src/components/Button.jsx", "a"),
            ("src/App.tsx", "b"),
            ("styles.css", "c"),
        ]);
        assert_eq!(bundle.entry().unwrap().path, "src/App.tsx");

        let bundle = SourceBundle::from_files([("styles.css", "c"), ("src/main.js", "d")]);
        assert_eq!(bundle.entry().unwrap().path, "src/main.js");

        let bundle = SourceBundle::from_files([("styles.css", "c")]);
        assert!(bundle.entry().is_none());
    }

    #[test]
    fn digest_is_order_independent() {
        let a = SourceBundle::from_files([("a.js", "1"), ("b.js", "2")]);
        let b = SourceBundle::from_files([("b.js", "2"), ("a.js", "1")]);
        assert_eq!(a.digest(), b.digest());
        let c = SourceBundle::from_files([("a.js", "1"), ("b.js", "3")]);
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn loads_directory_skipping_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
        std::fs::write(dir.path().join("src/App.jsx"), "export default function App() {}").unwrap();
        std::fs::write(dir.path().join("src/index.css"), "body {}").unwrap();
        std::fs::write(dir.path().join("node_modules/react/index.js"), "x").unwrap();
        std::fs::write(dir.path().join("logo.png"), [0u8, 1, 2]).unwrap();

        let bundle = SourceBundle::from_directory(dir.path()).unwrap();
        assert_eq!(bundle.len(), 2);
        assert!(bundle.get("src/App.jsx").is_some());
        assert_eq!(bundle.stylesheets().count(), 1);
    }

    #[test]
    fn missing_directory_is_invalid_bundle() {
        let err = SourceBundle::from_directory(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidBundle(_)));
    }
}
