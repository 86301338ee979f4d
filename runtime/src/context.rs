//! Build contexts: the files COPY and ADD may read.
//!
//! The build engine never walks the filesystem itself; it asks a
//! [`BuildContext`] which files a source operand selects (with their
//! content hashes) and for the bytes of a selected file. Ignore-file
//! handling therefore lives entirely in the context implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use kiln_core::error::{KilnError, Result};

use crate::build::layer::{sha256_bytes, sha256_file};

const DOCKERIGNORE: &str = ".dockerignore";

/// A file selected by a source operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    /// Path relative to the context root, `/`-separated
    pub path: String,
    /// The path the operand matched: the file itself, or a directory the
    /// file was found under
    pub root: String,
    /// SHA256 of the content (of the link target for symlinks)
    pub hash: String,
    /// Permission bits
    pub mode: u32,
    /// Target of a symbolic link
    pub link_target: Option<String>,
}

impl ContextFile {
    /// Path below the matched root, empty when the operand named the file.
    pub fn relative(&self) -> &str {
        self.path
            .strip_prefix(self.root.as_str())
            .unwrap_or(&self.path)
            .trim_start_matches('/')
    }
}

/// Read-only file provider for COPY/ADD.
#[async_trait]
pub trait BuildContext: Send + Sync {
    /// Files selected by a source operand (a path or glob), sorted by path.
    ///
    /// An operand that selects nothing yields an empty list.
    async fn resolve(&self, pattern: &str) -> Result<Vec<ContextFile>>;

    /// Content of a file returned by [`BuildContext::resolve`].
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// A build context backed by a directory.
///
/// Paths listed in a `.dockerignore` at the root (gitignore syntax) are
/// invisible. Symlinks are reported as links and never followed.
#[derive(Debug, Clone)]
pub struct DirContext {
    root: PathBuf,
    ignore: Option<Gitignore>,
}

impl DirContext {
    /// Open a context directory, honouring its `.dockerignore`.
    pub fn new(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(KilnError::Build(format!(
                "Build context {} is not a directory",
                root.display()
            )));
        }

        let ignore_file = root.join(DOCKERIGNORE);
        let ignore = if ignore_file.is_file() {
            let mut builder = GitignoreBuilder::new(root);
            if let Some(e) = builder.add(&ignore_file) {
                return Err(KilnError::Build(format!(
                    "Invalid {}: {}",
                    ignore_file.display(),
                    e
                )));
            }
            let gitignore = builder.build().map_err(|e| {
                KilnError::Build(format!("Invalid {}: {}", ignore_file.display(), e))
            })?;
            Some(gitignore)
        } else {
            None
        };

        Ok(Self {
            root: root.to_path_buf(),
            ignore,
        })
    }

    /// A context over a directory without ignore rules, such as a
    /// completed stage's rootfs.
    pub fn unfiltered(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ignore: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths of all visible files and symlinks.
    fn list_paths(&self) -> Result<Vec<String>> {
        let mut walker = ignore::WalkBuilder::new(&self.root);
        walker.standard_filters(false).follow_links(false);
        if let Some(gitignore) = self.ignore.clone() {
            walker.filter_entry(move |entry| {
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                !gitignore
                    .matched_path_or_any_parents(entry.path(), is_dir)
                    .is_ignore()
            });
        }

        let mut paths = Vec::new();
        for entry in walker.build() {
            let entry = entry.map_err(|e| {
                KilnError::Build(format!(
                    "Failed to walk build context {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
            if entry.depth() == 0 || entry.file_type().is_some_and(|t| t.is_dir()) {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).map_err(|e| {
                KilnError::Build(format!(
                    "Failed to compute relative path for {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;
            paths.push(to_slash(relative));
        }
        Ok(paths)
    }
}

#[async_trait]
impl BuildContext for DirContext {
    async fn resolve(&self, pattern: &str) -> Result<Vec<ContextFile>> {
        let paths = self.list_paths()?;
        let mut files = Vec::new();

        for (path, root) in select(paths.iter().map(String::as_str), pattern)? {
            let full_path = self.root.join(&path);
            let metadata = std::fs::symlink_metadata(&full_path)?;
            let (hash, link_target) = if metadata.file_type().is_symlink() {
                let target = to_slash(&std::fs::read_link(&full_path)?);
                (sha256_bytes(format!("symlink:{}", target).as_bytes()), Some(target))
            } else {
                (sha256_file(&full_path)?, None)
            };
            files.push(ContextFile {
                path,
                root,
                hash,
                mode: permission_bits(&metadata),
                link_target,
            });
        }

        Ok(files)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let relative = normalize(path).ok_or_else(|| {
            KilnError::Build(format!("Path '{}' escapes the build context", path))
        })?;
        let full_path = self.root.join(&relative);
        tokio::fs::read(&full_path).await.map_err(|e| {
            KilnError::Build(format!(
                "Failed to read {} from build context: {}",
                full_path.display(),
                e
            ))
        })
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// An in-memory build context.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file; the path is normalized relative to the root.
    pub fn with_file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        if let Some(path) = normalize(path) {
            self.files.insert(path, content.into());
        }
        self
    }
}

#[async_trait]
impl BuildContext for MemoryContext {
    async fn resolve(&self, pattern: &str) -> Result<Vec<ContextFile>> {
        Ok(select(self.files.keys().map(String::as_str), pattern)?
            .into_iter()
            .map(|(path, root)| {
                let hash = sha256_bytes(&self.files[&path]);
                ContextFile {
                    path,
                    root,
                    hash,
                    mode: 0o644,
                    link_target: None,
                }
            })
            .collect())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        normalize(path)
            .and_then(|p| self.files.get(&p).cloned())
            .ok_or_else(|| KilnError::Build(format!("No such file in build context: {}", path)))
    }
}

/// Normalize a context path: `/`-separated, relative, no `.` or `..`.
///
/// Returns `None` for paths that climb above the root. The root itself
/// normalizes to the empty string.
pub(crate) fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Pair every path selected by `pattern` with the path it matched.
fn select<'a>(
    paths: impl IntoIterator<Item = &'a str>,
    pattern: &str,
) -> Result<Vec<(String, String)>> {
    let Some(pattern) = normalize(pattern) else {
        return Ok(Vec::new());
    };

    let matcher = if has_glob_meta(&pattern) {
        let compiled = glob::Pattern::new(&pattern).map_err(|e| {
            KilnError::Build(format!("Invalid source pattern '{}': {}", pattern, e))
        })?;
        Some(compiled)
    } else {
        None
    };
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let mut selected = Vec::new();
    for path in paths {
        let root = match &matcher {
            Some(matcher) => ancestors_or_self(path)
                .find(|candidate| matcher.matches_with(candidate, options))
                .map(str::to_string),
            None if pattern.is_empty() => Some(String::new()),
            None if path == pattern || path.strip_prefix(pattern.as_str()).is_some_and(|r| r.starts_with('/')) => {
                Some(pattern.clone())
            }
            None => None,
        };
        if let Some(root) = root {
            selected.push((path.to_string(), root));
        }
    }

    selected.sort();
    Ok(selected)
}

/// `a`, `a/b`, `a/b/c` for `a/b/c`.
fn ancestors_or_self(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .map(move |(idx, _)| &path[..idx])
        .chain(std::iter::once(path))
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
