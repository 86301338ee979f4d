//! Layer creation and application.
//!
//! Provides content-hashed filesystem snapshots, snapshot diffing
//! (including deletions), deterministic tar.gz layer creation with OCI
//! whiteouts, and applying a layer blob onto a rootfs.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use kiln_core::error::{KilnError, Result};
use sha2::{Digest, Sha256};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// What a snapshot entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file with the SHA256 of its content
    File { hash: String },
    Dir,
    Symlink { target: PathBuf },
}

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub kind: EntryKind,
    /// Permission bits
    pub mode: u32,
}

/// A snapshot of a directory's file state.
///
/// Entries are compared by content and mode, never by timestamps, so two
/// rootfs trees with the same files compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirSnapshot {
    /// Map of relative path → file entry
    pub entries: BTreeMap<PathBuf, FileEntry>,
}

/// Paths changed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerDelta {
    /// Added or modified paths, sorted
    pub changed: Vec<PathBuf>,
    /// Removed paths, sorted, without descendants of removed directories
    pub deleted: Vec<PathBuf>,
}

impl LayerDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

impl DirSnapshot {
    /// Take a snapshot of a directory, hashing every regular file.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        walk_dir(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Compute the delta from this snapshot (before) to `after`.
    pub fn diff(&self, after: &DirSnapshot) -> LayerDelta {
        let changed = after
            .entries
            .iter()
            .filter(|(path, entry)| self.entries.get(*path) != Some(entry))
            .map(|(path, _)| path.clone())
            .collect();

        let mut deleted: Vec<PathBuf> = Vec::new();
        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            // BTreeMap order visits a directory before its children
            if deleted.last().is_some_and(|dir| path.starts_with(dir)) {
                continue;
            }
            deleted.push(path.clone());
        }

        LayerDelta { changed, deleted }
    }
}

/// Recursively walk a directory and collect entries, without following
/// symlinks.
fn walk_dir(root: &Path, current: &Path, entries: &mut BTreeMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        KilnError::Build(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| KilnError::Build(format!("Failed to read directory entry: {}", e)))?;

        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                KilnError::Build(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            KilnError::Build(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            let target = std::fs::read_link(&path)?;
            EntryKind::Symlink { target }
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File {
                hash: sha256_file(&path)?,
            }
        };

        entries.insert(
            relative,
            FileEntry {
                kind,
                mode: permission_bits(&metadata),
            },
        );

        if file_type.is_dir() {
            walk_dir(root, &path, entries)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Create a gzip-compressed tar layer from a delta of `rootfs`.
///
/// The output depends only on the content and permissions of the changed
/// paths. Entries are sorted with ownership and timestamps zeroed;
/// deletions become `.wh.<name>` whiteout entries.
pub fn create_layer(rootfs: &Path, delta: &LayerDelta) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut entries: Vec<(PathBuf, bool)> = delta
        .changed
        .iter()
        .map(|p| (p.clone(), false))
        .chain(delta.deleted.iter().filter_map(|p| whiteout_path(p).map(|w| (w, true))))
        .collect();
    entries.sort();

    for (relative_path, is_whiteout) in entries {
        if is_whiteout {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(0);
            header.set_mode(0o644);
            header.set_mtime(0);
            builder
                .append_data(&mut header, &relative_path, std::io::empty())
                .map_err(|e| {
                    KilnError::Build(format!(
                        "Failed to add whiteout {} to layer: {}",
                        relative_path.display(),
                        e
                    ))
                })?;
            continue;
        }

        append_entry(&mut builder, rootfs, &relative_path).map_err(|e| {
            KilnError::Build(format!(
                "Failed to add {} to layer: {}",
                relative_path.display(),
                e
            ))
        })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| KilnError::Build(format!("Failed to finalize layer: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| KilnError::Build(format!("Failed to compress layer: {}", e)))
}

/// Append one rootfs path with zeroed ownership and timestamps.
fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    rootfs: &Path,
    relative_path: &Path,
) -> std::io::Result<()> {
    let full_path = rootfs.join(relative_path);
    let metadata = std::fs::symlink_metadata(&full_path)?;

    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&metadata, tar::HeaderMode::Complete);
    header.set_mode(permission_bits(&metadata));
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        header.set_size(0);
        let target = std::fs::read_link(&full_path)?;
        builder.append_link(&mut header, relative_path, target)
    } else if file_type.is_dir() {
        header.set_size(0);
        builder.append_data(&mut header, relative_path, std::io::empty())
    } else {
        let file = std::fs::File::open(&full_path)?;
        builder.append_data(&mut header, relative_path, file)
    }
}

fn whiteout_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    Some(
        path.parent()
            .unwrap_or_else(|| Path::new(""))
            .join(format!("{}{}", WHITEOUT_PREFIX, name)),
    )
}

/// Apply a layer blob onto `rootfs`, honouring whiteouts.
pub fn apply_layer(blob: &[u8], rootfs: &Path) -> Result<()> {
    use flate2::read::GzDecoder;

    let mut archive = tar::Archive::new(GzDecoder::new(blob));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|e| KilnError::Build(format!("Failed to read layer: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| KilnError::Build(format!("Failed to read layer entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| KilnError::Build(format!("Invalid layer entry path: {}", e)))?
            .into_owned();

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = path
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parent = resolve_in_rootfs(rootfs, &parent)?;
            if name == OPAQUE_WHITEOUT {
                clear_dir(&parent)?;
            } else {
                remove_path(&parent.join(hidden))?;
            }
            continue;
        }

        let target = resolve_entry_in_rootfs(rootfs, &path.to_string_lossy())?;
        let is_dir_entry = entry.header().entry_type().is_dir();
        if let Ok(existing) = std::fs::symlink_metadata(&target) {
            if existing.is_dir() != is_dir_entry || existing.file_type().is_symlink() {
                remove_path(&target)?;
            }
        }

        entry.unpack_in(rootfs).map_err(|e| {
            KilnError::Build(format!(
                "Failed to unpack {} from layer: {}",
                path.display(),
                e
            ))
        })?;
    }

    tracing::trace!(rootfs = %rootfs.display(), "Applied layer");
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| KilnError::Build(format!("Failed to remove {}: {}", path.display(), e)))
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

/// Compute the diff_id (SHA256 of the uncompressed tar) of a layer blob.
pub fn diff_id(blob: &[u8]) -> Result<String> {
    use flate2::read::GzDecoder;

    let mut decoder = GzDecoder::new(blob);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = decoder.read(&mut buf).map_err(|e| {
            KilnError::Build(format!("Failed to decompress layer for diff_id: {}", e))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Symlinks followed while resolving one path before giving up.
const MAX_SYMLINK_HOPS: usize = 40;

/// Map a container path onto `rootfs` the way the container would see it.
///
/// Symlinks met along the way are read and re-resolved inside `rootfs`:
/// absolute targets restart at the rootfs, relative ones at the link's
/// directory, and `..` stops at the root. The result never leaves `rootfs`.
/// Components that do not exist yet are kept as written.
pub fn resolve_in_rootfs(rootfs: &Path, path: &str) -> Result<PathBuf> {
    let mut pending: Vec<String> = path.split('/').rev().map(str::to_string).collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        match part.as_str() {
            "" | "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }

        let candidate = resolved
            .iter()
            .fold(rootfs.to_path_buf(), |dir, name| dir.join(name))
            .join(&part);
        let is_link = std::fs::symlink_metadata(&candidate)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            resolved.push(part);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(KilnError::Build(format!(
                "Too many levels of symbolic links resolving {}",
                path
            )));
        }
        let link = std::fs::read_link(&candidate).map_err(|e| {
            KilnError::Build(format!("Failed to read link {}: {}", candidate.display(), e))
        })?;
        let link = link.to_string_lossy();
        if link.starts_with('/') {
            resolved.clear();
        }
        pending.extend(link.split('/').rev().map(str::to_string));
    }

    Ok(resolved
        .iter()
        .fold(rootfs.to_path_buf(), |dir, name| dir.join(name)))
}

/// Like [`resolve_in_rootfs`], but a final symlink is returned itself.
pub fn resolve_entry_in_rootfs(rootfs: &Path, path: &str) -> Result<PathBuf> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
    let dir = resolve_in_rootfs(rootfs, parent)?;
    Ok(match name {
        "" | "." | ".." => resolve_in_rootfs(rootfs, trimmed)?,
        name => dir.join(name),
    })
}

/// Recursively copy a directory and its contents, keeping symlinks as links.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| {
        KilnError::Build(format!(
            "Failed to create directory {}: {}",
            dst.display(),
            e
        ))
    })?;

    for entry in std::fs::read_dir(src).map_err(|e| {
        KilnError::Build(format!(
            "Failed to read directory {}: {}",
            src.display(),
            e
        ))
    })? {
        let entry =
            entry.map_err(|e| KilnError::Build(format!("Failed to read entry: {}", e)))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            copy_symlink(&src_path, &dst_path)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
            let permissions = std::fs::metadata(&src_path)?.permissions();
            std::fs::set_permissions(&dst_path, permissions)?;
        } else {
            std::fs::copy(&src_path, &dst_path).map_err(|e| {
                KilnError::Build(format!(
                    "Failed to copy {} to {}: {}",
                    src_path.display(),
                    dst_path.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(&target, dst).map_err(|e| {
        KilnError::Build(format!(
            "Failed to link {} -> {}: {}",
            dst.display(),
            target.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        KilnError::Build(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn layer_paths(blob: &[u8]) -> Vec<String> {
        let decoder = flate2::read::GzDecoder::new(blob);
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path().unwrap().to_string_lossy().trim_end_matches('/').to_string())
            .collect()
    }

    // --- DirSnapshot ---

    #[test]
    fn test_snapshot_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let snap = DirSnapshot::capture(tmp.path()).unwrap();
        assert!(snap.entries.is_empty());
    }

    #[test]
    fn test_snapshot_with_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub").join("b.txt"), "world").unwrap();

        let snap = DirSnapshot::capture(tmp.path()).unwrap();
        assert_eq!(snap.entries.len(), 3);
        assert_eq!(
            snap.entries[&PathBuf::from("a.txt")].kind,
            EntryKind::File {
                hash: sha256_bytes(b"hello")
            }
        );
        assert_eq!(snap.entries[&PathBuf::from("sub")].kind, EntryKind::Dir);
    }

    #[test]
    fn test_snapshot_diff_new_and_modified() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        fs::write(tmp.path().join("keep.txt"), "same").unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();

        // Same size, different content
        fs::write(tmp.path().join("a.txt"), "HELLO").unwrap();
        fs::write(tmp.path().join("b.txt"), "world").unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();

        let delta = before.diff(&after);
        assert_eq!(
            delta.changed,
            vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]
        );
        assert!(delta.deleted.is_empty());
    }

    #[test]
    fn test_snapshot_diff_deletions_are_collapsed() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("cache/deep")).unwrap();
        fs::write(tmp.path().join("cache/deep/x"), "x").unwrap();
        fs::write(tmp.path().join("old.txt"), "old").unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();

        fs::remove_dir_all(tmp.path().join("cache")).unwrap();
        fs::remove_file(tmp.path().join("old.txt")).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();

        let delta = before.diff(&after);
        assert!(delta.changed.is_empty());
        assert_eq!(
            delta.deleted,
            vec![PathBuf::from("cache"), PathBuf::from("old.txt")]
        );
    }

    #[test]
    fn test_snapshot_diff_no_changes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();

        let before = DirSnapshot::capture(tmp.path()).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();
        assert!(before.diff(&after).is_empty());
    }

    // --- create_layer / apply_layer ---

    #[test]
    fn test_create_layer_is_deterministic() {
        let rootfs = TempDir::new().unwrap();
        fs::write(rootfs.path().join("hello.txt"), "hello").unwrap();
        fs::write(rootfs.path().join("world.txt"), "world").unwrap();

        let delta = LayerDelta {
            changed: vec![PathBuf::from("world.txt"), PathBuf::from("hello.txt")],
            deleted: vec![],
        };
        let first = create_layer(rootfs.path(), &delta).unwrap();

        // Rewriting the files changes mtimes but not the layer
        std::thread::sleep(std::time::Duration::from_millis(1100));
        fs::write(rootfs.path().join("hello.txt"), "hello").unwrap();
        let second = create_layer(rootfs.path(), &delta).unwrap();

        assert_eq!(first, second);
        assert_eq!(layer_paths(&first), vec!["hello.txt", "world.txt"]);
    }

    #[test]
    fn test_create_layer_whiteouts() {
        let rootfs = TempDir::new().unwrap();
        let delta = LayerDelta {
            changed: vec![],
            deleted: vec![PathBuf::from("etc/old.conf"), PathBuf::from("tmp")],
        };
        let blob = create_layer(rootfs.path(), &delta).unwrap();
        assert_eq!(layer_paths(&blob), vec![".wh.tmp", "etc/.wh.old.conf"]);
    }

    #[test]
    fn test_apply_layer_roundtrip_with_deletions() {
        let base = TempDir::new().unwrap();
        fs::create_dir(base.path().join("etc")).unwrap();
        fs::write(base.path().join("etc/old.conf"), "old").unwrap();
        fs::write(base.path().join("etc/keep.conf"), "keep").unwrap();

        // Build the "after" state in a copy and diff it
        let work = TempDir::new().unwrap();
        copy_dir_recursive(base.path(), work.path()).unwrap();
        let before = DirSnapshot::capture(work.path()).unwrap();
        fs::remove_file(work.path().join("etc/old.conf")).unwrap();
        fs::create_dir(work.path().join("app")).unwrap();
        fs::write(work.path().join("app/main"), "bin").unwrap();
        let after = DirSnapshot::capture(work.path()).unwrap();

        let blob = create_layer(work.path(), &before.diff(&after)).unwrap();

        apply_layer(&blob, base.path()).unwrap();
        assert_eq!(DirSnapshot::capture(base.path()).unwrap(), after);
    }

    #[test]
    fn test_apply_layer_opaque_whiteout() {
        let rootfs = TempDir::new().unwrap();
        fs::create_dir(rootfs.path().join("data")).unwrap();
        fs::write(rootfs.path().join("data/a"), "a").unwrap();

        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "data/.wh..wh..opq", std::io::empty())
            .unwrap();
        let blob = builder.into_inner().unwrap().finish().unwrap();

        apply_layer(&blob, rootfs.path()).unwrap();
        assert!(rootfs.path().join("data").is_dir());
        assert!(!rootfs.path().join("data/a").exists());
    }

    #[test]
    fn test_diff_id_differs_from_blob_digest() {
        let rootfs = TempDir::new().unwrap();
        fs::write(rootfs.path().join("f"), "content").unwrap();
        let delta = LayerDelta {
            changed: vec![PathBuf::from("f")],
            deleted: vec![],
        };
        let blob = create_layer(rootfs.path(), &delta).unwrap();
        let id = diff_id(&blob).unwrap();
        assert_eq!(id.len(), 64);
        assert_ne!(id, sha256_bytes(&blob));
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_dir_keeps_symlinks() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("target"), "t").unwrap();
        std::os::unix::fs::symlink("target", src.path().join("link")).unwrap();

        let dst = TempDir::new().unwrap();
        copy_dir_recursive(src.path(), dst.path()).unwrap();
        assert_eq!(
            fs::read_link(dst.path().join("link")).unwrap(),
            PathBuf::from("target")
        );
    }

    // --- sha256 ---

    #[test]
    fn test_sha256_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.txt");
        fs::write(&path, "hello").unwrap();

        let digest = sha256_file(&path).unwrap();
        // Known SHA256 of "hello"
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_in_rootfs_keeps_absolute_links_inside() {
        let rootfs = TempDir::new().unwrap();
        let host = TempDir::new().unwrap();
        fs::create_dir_all(rootfs.path().join("run")).unwrap();
        fs::create_dir_all(rootfs.path().join("var")).unwrap();
        std::os::unix::fs::symlink("/run", rootfs.path().join("var/run")).unwrap();
        std::os::unix::fs::symlink(host.path(), rootfs.path().join("escape")).unwrap();

        assert_eq!(
            resolve_in_rootfs(rootfs.path(), "/var/run/app.pid").unwrap(),
            rootfs.path().join("run/app.pid")
        );
        let escaped = resolve_in_rootfs(rootfs.path(), "/escape/pwned").unwrap();
        assert!(escaped.starts_with(rootfs.path()));
        assert!(!escaped.starts_with(host.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_in_rootfs_relative_links_and_dotdot() {
        let rootfs = TempDir::new().unwrap();
        fs::create_dir_all(rootfs.path().join("usr/lib")).unwrap();
        std::os::unix::fs::symlink("usr/lib", rootfs.path().join("lib")).unwrap();
        std::os::unix::fs::symlink("../../../../etc", rootfs.path().join("usr/up")).unwrap();

        assert_eq!(
            resolve_in_rootfs(rootfs.path(), "/lib/libc.so").unwrap(),
            rootfs.path().join("usr/lib/libc.so")
        );
        assert_eq!(
            resolve_in_rootfs(rootfs.path(), "/usr/up/passwd").unwrap(),
            rootfs.path().join("etc/passwd")
        );
        assert_eq!(
            resolve_in_rootfs(rootfs.path(), "/../../tmp").unwrap(),
            rootfs.path().join("tmp")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_in_rootfs_link_loop() {
        let rootfs = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/b", rootfs.path().join("a")).unwrap();
        std::os::unix::fs::symlink("/a", rootfs.path().join("b")).unwrap();
        assert!(resolve_in_rootfs(rootfs.path(), "/a/file").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_entry_keeps_final_link() {
        let rootfs = TempDir::new().unwrap();
        fs::create_dir_all(rootfs.path().join("usr/bin")).unwrap();
        std::os::unix::fs::symlink("python3", rootfs.path().join("usr/bin/python")).unwrap();
        assert_eq!(
            resolve_entry_in_rootfs(rootfs.path(), "/usr/bin/python").unwrap(),
            rootfs.path().join("usr/bin/python")
        );
        assert_eq!(resolve_entry_in_rootfs(rootfs.path(), "/").unwrap(), rootfs.path());
    }
}
