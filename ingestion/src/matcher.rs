use std::path::{Path, PathBuf};

use context_core::{EngineError, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use tracing::warn;

/// Directories nothing good ever comes out of: VCS internals, build
/// outputs, IDE state, caches.
const BLACKLIST_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "dist",
    "build",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    ".idea",
    ".vscode",
    ".cache",
    ".pytest_cache",
    ".mypy_cache",
    "coverage",
];

const BLACKLIST_FILES: &[&str] = &[".DS_Store", "*.swp", "*.swo", "*~", "*.pyc", "*.lock"];

/// Extensions admitted into the index.
const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "mjs", "cjs", "jsx", "ts", "tsx", "go", "java", "c", "h", "cpp", "cc",
    "cxx", "hpp", "cs", "rb", "php", "swift", "kt", "kts", "scala", "sh", "bash", "sql", "md",
    "markdown", "txt", "json", "yml", "yaml", "toml", "html", "htm", "css", "proto", "graphql",
    "tf", "ini", "cfg", "env",
];

/// Extension-less files admitted by name.
const WELL_KNOWN_FILES: &[&str] = &[
    "Dockerfile",
    "Makefile",
    "docker-compose.yml",
    "docker-compose.yaml",
];

/// Composes the built-in blacklist with the codebase's `.gitignore` and
/// `.dockerignore` into a single path predicate, then gates on the
/// source-extension allowlist.
pub struct IgnoreMatcher {
    root: PathBuf,
    gitignore: Gitignore,
}

impl IgnoreMatcher {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut builder = GitignoreBuilder::new(&root);

        for dir in BLACKLIST_DIRS {
            builder
                .add_line(None, &format!("{dir}/"))
                .map_err(|e| EngineError::config(format!("bad built-in pattern: {e}")))?;
        }
        for file in BLACKLIST_FILES {
            builder
                .add_line(None, file)
                .map_err(|e| EngineError::config(format!("bad built-in pattern: {e}")))?;
        }

        for name in [".gitignore", ".dockerignore"] {
            let path = root.join(name);
            if path.exists() {
                if let Some(err) = builder.add(&path) {
                    warn!("ignoring unreadable {:?}: {}", path, err);
                }
            }
        }

        let gitignore = builder
            .build()
            .map_err(|e| EngineError::config(format!("ignore rules: {e}")))?;
        Ok(Self { root, gitignore })
    }

    /// Whether a file belongs in the index: not ignored, and carrying an
    /// admitted extension or well-known name.
    pub fn is_admitted(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        if self
            .gitignore
            .matched_path_or_any_parents(relative, false)
            .is_ignore()
        {
            return false;
        }
        Self::has_admitted_name(relative)
    }

    fn has_admitted_name(relative: &Path) -> bool {
        let Some(name) = relative.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if WELL_KNOWN_FILES.contains(&name) {
            return true;
        }
        match relative.extension().and_then(|e| e.to_str()) {
            Some(ext) => SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
            None => false,
        }
    }

    /// Walk the tree and collect admitted files. Nested `.gitignore`
    /// files are honoured by the walker on top of this matcher's rules.
    pub fn walk(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(false)
            .add_custom_ignore_filename(".dockerignore")
            .build();

        for entry in walker {
            match entry {
                Ok(entry) => {
                    if entry.file_type().map(|t| t.is_file()).unwrap_or(false)
                        && self.is_admitted(entry.path())
                    {
                        files.push(entry.path().to_path_buf());
                    }
                }
                Err(err) => warn!("error walking directory: {}", err),
            }
        }
        files.sort();
        files
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x").unwrap();
    }

    #[test]
    fn blacklist_and_extensions() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let matcher = IgnoreMatcher::new(root).unwrap();

        assert!(matcher.is_admitted(&root.join("src/main.rs")));
        assert!(matcher.is_admitted(&root.join("Dockerfile")));
        assert!(matcher.is_admitted(&root.join("docker-compose.yml")));
        assert!(!matcher.is_admitted(&root.join("node_modules/pkg/index.js")));
        assert!(!matcher.is_admitted(&root.join("target/debug/app.rs")));
        assert!(!matcher.is_admitted(&root.join(".git/config")));
        assert!(!matcher.is_admitted(&root.join("photo.png")));
        assert!(!matcher.is_admitted(&root.join(".DS_Store")));
        assert!(!matcher.is_admitted(&root.join("LICENSE")));
    }

    #[test]
    fn gitignore_patterns_apply() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join(".gitignore"), "generated/\n*.gen.ts\n!keep.gen.ts\n").unwrap();
        let matcher = IgnoreMatcher::new(root).unwrap();

        assert!(!matcher.is_admitted(&root.join("generated/api.ts")));
        assert!(!matcher.is_admitted(&root.join("src/api.gen.ts")));
        assert!(matcher.is_admitted(&root.join("src/keep.gen.ts")));
        assert!(matcher.is_admitted(&root.join("src/api.ts")));
    }

    #[test]
    fn dockerignore_patterns_apply() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join(".dockerignore"), "vendor/\n").unwrap();
        let matcher = IgnoreMatcher::new(root).unwrap();
        assert!(!matcher.is_admitted(&root.join("vendor/lib.go")));
    }

    #[test]
    fn walk_collects_admitted_files_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(root, "src/main.rs");
        touch(root, "docs/readme.md");
        touch(root, "node_modules/x/index.js");
        touch(root, "image.png");
        touch(root, "Makefile");

        let matcher = IgnoreMatcher::new(root).unwrap();
        let files: Vec<String> = matcher
            .walk()
            .iter()
            .map(|p| {
                p.strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        assert_eq!(files, vec!["Makefile", "docs/readme.md", "src/main.rs"]);
    }
}
