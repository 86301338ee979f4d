//! Content-addressed store for built layers.
//!
//! Layers are keyed by fingerprint. The store is append-only: an entry,
//! once committed, is never replaced, and concurrent writers of the same
//! fingerprint race safely (the first commit wins, later writers are told
//! the entry already exists and drop their copy).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};

use crate::build::fingerprint::Fingerprint;
use crate::build::layer::sha256_bytes;

/// Metadata stored with every layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMeta {
    pub fingerprint: Fingerprint,
    /// SHA256 of the compressed blob, empty for empty layers
    pub digest: String,
    pub size_bytes: u64,
    /// Instruction that produced the layer
    pub created_by: String,
    /// Captured RUN output
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// When the layer was stored (Unix timestamp)
    pub cached_at: i64,
}

impl LayerMeta {
    /// Whether the step left the filesystem unchanged.
    pub fn is_empty_layer(&self) -> bool {
        self.size_bytes == 0
    }
}

/// A layer as stored: metadata plus the gzip tar blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLayer {
    pub meta: LayerMeta,
    /// Empty when the step produced no filesystem change
    pub blob: Vec<u8>,
}

impl StoredLayer {
    pub fn new(
        fingerprint: Fingerprint,
        created_by: String,
        blob: Vec<u8>,
        stdout: String,
        stderr: String,
    ) -> Self {
        let digest = if blob.is_empty() {
            String::new()
        } else {
            sha256_bytes(&blob)
        };
        Self {
            meta: LayerMeta {
                fingerprint,
                digest,
                size_bytes: blob.len() as u64,
                created_by,
                stdout,
                stderr,
                cached_at: chrono::Utc::now().timestamp(),
            },
            blob,
        }
    }
}

/// Result of [`LayerStore::put_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// This call committed the entry
    Inserted,
    /// Another writer committed first; this copy was discarded
    AlreadyPresent,
}

/// Persistent layer store keyed by fingerprint.
#[async_trait]
pub trait LayerStore: Send + Sync {
    /// Look up a committed layer.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredLayer>>;

    /// Commit a layer unless one with the same fingerprint exists.
    async fn put_if_absent(&self, layer: StoredLayer) -> Result<PutOutcome>;

    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.get(fingerprint).await?.is_some())
    }
}

/// In-memory layer store.
#[derive(Debug, Default)]
pub struct MemoryLayerStore {
    layers: DashMap<Fingerprint, StoredLayer>,
}

impl MemoryLayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[async_trait]
impl LayerStore for MemoryLayerStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredLayer>> {
        Ok(self.layers.get(fingerprint).map(|entry| entry.value().clone()))
    }

    async fn put_if_absent(&self, layer: StoredLayer) -> Result<PutOutcome> {
        match self.layers.entry(layer.meta.fingerprint.clone()) {
            Entry::Occupied(_) => Ok(PutOutcome::AlreadyPresent),
            Entry::Vacant(slot) => {
                slot.insert(layer);
                Ok(PutOutcome::Inserted)
            }
        }
    }
}

/// On-disk layer store.
///
/// Layout under the store directory:
/// - `blobs/<digest>.tar.gz`: layer blobs, named by content digest
/// - `<fingerprint>.meta.json`: commit marker and metadata
/// - `tmp/`: staging area for in-progress writes
///
/// A layer is visible only once its metadata file exists. The metadata is
/// staged under `tmp/` and hard-linked into place, which fails if another
/// writer got there first.
pub struct DiskLayerStore {
    store_dir: PathBuf,
}

impl DiskLayerStore {
    /// Open (creating if necessary) a store at the given directory.
    pub fn new(store_dir: &Path) -> Result<Self> {
        for dir in [store_dir.join("blobs"), store_dir.join("tmp")] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                KilnError::Store(format!(
                    "Failed to create layer store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            store_dir: store_dir.to_path_buf(),
        })
    }

    fn meta_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.store_dir.join(format!("{}.meta.json", fingerprint))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.store_dir.join("blobs").join(format!("{}.tar.gz", digest))
    }

    fn staging_path(&self, suffix: &str) -> PathBuf {
        self.store_dir
            .join("tmp")
            .join(format!("{}.{}", uuid::Uuid::new_v4(), suffix))
    }

    /// List metadata of all committed layers.
    pub fn list_entries(&self) -> Result<Vec<LayerMeta>> {
        let mut entries = Vec::new();

        let read_dir = std::fs::read_dir(&self.store_dir).map_err(|e| {
            KilnError::Store(format!(
                "Failed to read layer store {}: {}",
                self.store_dir.display(),
                e
            ))
        })?;

        for entry in read_dir {
            let entry = entry
                .map_err(|e| KilnError::Store(format!("Failed to read directory entry: {}", e)))?;
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".meta.json"));
            if !is_meta {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(meta) = serde_json::from_str::<LayerMeta>(&content) {
                    entries.push(meta);
                }
            }
        }

        entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(entries)
    }

    /// Total size of all committed blobs in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size_bytes).sum())
    }
}

#[async_trait]
impl LayerStore for DiskLayerStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredLayer>> {
        let meta_path = self.meta_path(fingerprint);
        let content = match tokio::fs::read_to_string(&meta_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KilnError::Store(format!(
                    "Failed to read layer metadata {}: {}",
                    meta_path.display(),
                    e
                )))
            }
        };
        let meta: LayerMeta = serde_json::from_str(&content)?;

        if meta.is_empty_layer() {
            return Ok(Some(StoredLayer {
                meta,
                blob: Vec::new(),
            }));
        }

        let blob = match tokio::fs::read(self.blob_path(&meta.digest)).await {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Layer blob missing, treating as cache miss"
                );
                return Ok(None);
            }
        };
        if sha256_bytes(&blob) != meta.digest {
            tracing::warn!(
                fingerprint = %fingerprint.short(),
                "Layer blob digest mismatch, treating as cache miss"
            );
            return Ok(None);
        }

        Ok(Some(StoredLayer { meta, blob }))
    }

    async fn put_if_absent(&self, layer: StoredLayer) -> Result<PutOutcome> {
        let meta_path = self.meta_path(&layer.meta.fingerprint);
        if tokio::fs::try_exists(&meta_path).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        if !layer.blob.is_empty() {
            let blob_path = self.blob_path(&layer.meta.digest);
            if !tokio::fs::try_exists(&blob_path).await? {
                let staged = self.staging_path("tar.gz");
                tokio::fs::write(&staged, &layer.blob).await.map_err(|e| {
                    KilnError::Store(format!("Failed to stage layer blob: {}", e))
                })?;
                // Same digest means same bytes, so losing a rename race is harmless
                tokio::fs::rename(&staged, &blob_path).await.map_err(|e| {
                    KilnError::Store(format!(
                        "Failed to store layer blob {}: {}",
                        blob_path.display(),
                        e
                    ))
                })?;
            }
        }

        let staged_meta = self.staging_path("meta.json");
        tokio::fs::write(&staged_meta, serde_json::to_vec_pretty(&layer.meta)?)
            .await
            .map_err(|e| KilnError::Store(format!("Failed to stage layer metadata: {}", e)))?;

        let committed = tokio::fs::hard_link(&staged_meta, &meta_path).await;
        let _ = tokio::fs::remove_file(&staged_meta).await;

        match committed {
            Ok(()) => {
                tracing::debug!(
                    fingerprint = %layer.meta.fingerprint.short(),
                    size_bytes = layer.meta.size_bytes,
                    "Stored layer"
                );
                Ok(PutOutcome::Inserted)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(
                    fingerprint = %layer.meta.fingerprint.short(),
                    "Layer already stored by another writer"
                );
                Ok(PutOutcome::AlreadyPresent)
            }
            Err(e) => Err(KilnError::Store(format!(
                "Failed to commit layer {}: {}",
                meta_path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn layer(seed: &str, blob: &[u8]) -> StoredLayer {
        StoredLayer::new(
            Fingerprint::for_image(seed),
            format!("RUN {}", seed),
            blob.to_vec(),
            "out".to_string(),
            String::new(),
        )
    }

    #[test]
    fn test_disk_store_new_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("layers");

        assert!(!store_dir.exists());
        let _store = DiskLayerStore::new(&store_dir).unwrap();
        assert!(store_dir.join("blobs").is_dir());
    }

    #[tokio::test]
    async fn test_disk_store_get_miss() {
        let tmp = TempDir::new().unwrap();
        let store = DiskLayerStore::new(tmp.path()).unwrap();

        let result = store.get(&Fingerprint::for_image("missing")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_disk_store_put_and_get() {
        let tmp = TempDir::new().unwrap();
        let store = DiskLayerStore::new(tmp.path()).unwrap();
        let stored = layer("a", b"blob-bytes");

        let outcome = store.put_if_absent(stored.clone()).await.unwrap();
        assert_eq!(outcome, PutOutcome::Inserted);

        let fetched = store.get(&stored.meta.fingerprint).await.unwrap().unwrap();
        assert_eq!(fetched, stored);
        assert_eq!(fetched.meta.stdout, "out");
    }

    #[tokio::test]
    async fn test_disk_store_first_writer_wins() {
        let tmp = TempDir::new().unwrap();
        let store = DiskLayerStore::new(tmp.path()).unwrap();

        let first = layer("same", b"first");
        let mut second = layer("same", b"second");
        second.meta.created_by = "RUN other".to_string();

        assert_eq!(
            store.put_if_absent(first.clone()).await.unwrap(),
            PutOutcome::Inserted
        );
        assert_eq!(
            store.put_if_absent(second).await.unwrap(),
            PutOutcome::AlreadyPresent
        );

        let fetched = store.get(&first.meta.fingerprint).await.unwrap().unwrap();
        assert_eq!(fetched.blob, b"first");
    }

    #[tokio::test]
    async fn test_disk_store_concurrent_writers() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let blob = format!("writer-{}", i);
                store
                    .put_if_absent(layer("contended", blob.as_bytes()))
                    .await
                    .unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == PutOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);

        let fp = Fingerprint::for_image("contended");
        let fetched = store.get(&fp).await.unwrap().unwrap();
        assert_eq!(sha256_bytes(&fetched.blob), fetched.meta.digest);
        assert_eq!(store.list_entries().unwrap().len(), 1);
        assert_eq!(std::fs::read_dir(tmp.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_disk_store_empty_layer() {
        let tmp = TempDir::new().unwrap();
        let store = DiskLayerStore::new(tmp.path()).unwrap();
        let stored = layer("noop", b"");
        assert!(stored.meta.is_empty_layer());

        store.put_if_absent(stored.clone()).await.unwrap();
        let fetched = store.get(&stored.meta.fingerprint).await.unwrap().unwrap();
        assert!(fetched.blob.is_empty());
        assert_eq!(store.total_size().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disk_store_corrupt_blob_is_miss() {
        let tmp = TempDir::new().unwrap();
        let store = DiskLayerStore::new(tmp.path()).unwrap();
        let stored = layer("corrupt", b"good");
        store.put_if_absent(stored.clone()).await.unwrap();

        std::fs::write(store.blob_path(&stored.meta.digest), b"bad").unwrap();
        assert!(store.get(&stored.meta.fingerprint).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_store_persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        let stored = layer("persist", b"data");
        {
            let store = DiskLayerStore::new(tmp.path()).unwrap();
            store.put_if_absent(stored.clone()).await.unwrap();
        }
        let reopened = DiskLayerStore::new(tmp.path()).unwrap();
        assert!(reopened.contains(&stored.meta.fingerprint).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_put_if_absent() {
        let store = MemoryLayerStore::new();
        let first = layer("m", b"one");
        let second = layer("m", b"two");

        assert_eq!(
            store.put_if_absent(first.clone()).await.unwrap(),
            PutOutcome::Inserted
        );
        assert_eq!(
            store.put_if_absent(second).await.unwrap(),
            PutOutcome::AlreadyPresent
        );
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(&first.meta.fingerprint).await.unwrap().unwrap().blob,
            b"one"
        );
    }
}
