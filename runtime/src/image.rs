//! External base images.
//!
//! Registry access is out of scope for the build engine: base images come
//! from an [`ImageSource`], which hands back a root filesystem archive, a
//! content digest and the image's configuration.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};

use crate::archive;
use crate::build::layer::{sha256_bytes, sha256_file};
use crate::build::metadata::ImageMetadata;

/// The empty base image.
pub const SCRATCH: &str = "scratch";

/// Where an image's root filesystem archive lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RootfsArchive {
    Empty,
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// A resolved base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub reference: String,
    /// `sha256:<hex>` over the rootfs archive and configuration
    pub digest: String,
    pub metadata: ImageMetadata,
    rootfs: RootfsArchive,
}

impl BaseImage {
    /// The empty image.
    pub fn scratch() -> Self {
        Self {
            reference: SCRATCH.to_string(),
            digest: format!("sha256:{}", sha256_bytes(SCRATCH.as_bytes())),
            metadata: ImageMetadata::default(),
            rootfs: RootfsArchive::Empty,
        }
    }

    /// Build an image from in-memory files (`path`, `content`).
    pub fn from_files<P, C>(
        reference: &str,
        files: &[(P, C)],
        metadata: ImageMetadata,
    ) -> Result<Self>
    where
        P: AsRef<str>,
        C: AsRef<[u8]>,
    {
        let mut sorted: Vec<&(P, C)> = files.iter().collect();
        sorted.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));

        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, content) in sorted {
            let (path, content) = (path.as_ref(), content.as_ref());
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_mtime(0);
            builder
                .append_data(&mut header, path.trim_start_matches('/'), content)
                .map_err(|e| image_error(reference, format!("Failed to add {}: {}", path, e)))?;
        }
        let mut encoder = builder
            .into_inner()
            .map_err(|e| image_error(reference, e.to_string()))?;
        encoder
            .flush()
            .map_err(|e| image_error(reference, e.to_string()))?;
        let bytes = encoder
            .finish()
            .map_err(|e| image_error(reference, e.to_string()))?;

        let config_hash = sha256_bytes(&serde_json::to_vec(&ImageConfig::from(&metadata))?);
        Ok(Self {
            reference: reference.to_string(),
            digest: combined_digest(&sha256_bytes(&bytes), &config_hash),
            metadata,
            rootfs: RootfsArchive::Bytes(bytes),
        })
    }

    /// The rootfs archive, or `None` for an empty image.
    pub async fn rootfs_archive(&self) -> Result<Option<Vec<u8>>> {
        match &self.rootfs {
            RootfsArchive::Empty => Ok(None),
            RootfsArchive::Bytes(bytes) => Ok(Some(bytes.clone())),
            RootfsArchive::File(path) => tokio::fs::read(path).await.map(Some).map_err(|e| {
                image_error(
                    &self.reference,
                    format!("Failed to read {}: {}", path.display(), e),
                )
            }),
        }
    }

    /// Extract the root filesystem into `target_dir`.
    pub async fn unpack_into(&self, target_dir: &Path) -> Result<()> {
        let Some(data) = self.rootfs_archive().await? else {
            tokio::fs::create_dir_all(target_dir).await?;
            return Ok(());
        };
        match archive::unpack(&data, target_dir)? {
            Some(_) => Ok(()),
            None => Err(image_error(
                &self.reference,
                "rootfs is not a tar archive".to_string(),
            )),
        }
    }
}

fn combined_digest(rootfs_hash: &str, config_hash: &str) -> String {
    format!(
        "sha256:{}",
        sha256_bytes(format!("{}\n{}", rootfs_hash, config_hash).as_bytes())
    )
}

fn image_error(reference: &str, message: String) -> KilnError {
    KilnError::Image {
        reference: reference.to_string(),
        message,
    }
}

/// Provider of external base images.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<BaseImage>;
}

/// Image configuration as stored in `config.json` (OCI field names).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl From<&ImageMetadata> for ImageConfig {
    fn from(metadata: &ImageMetadata) -> Self {
        Self {
            env: metadata.env_list(),
            entrypoint: metadata.entrypoint.clone(),
            cmd: metadata.cmd.clone(),
            working_dir: (metadata.workdir != "/").then(|| metadata.workdir.clone()),
            user: metadata.user.clone(),
            exposed_ports: metadata
                .exposed_ports
                .iter()
                .map(|p| (p.clone(), serde_json::json!({})))
                .collect(),
            labels: metadata.labels.clone(),
        }
    }
}

impl From<ImageConfig> for ImageMetadata {
    fn from(config: ImageConfig) -> Self {
        let env = config
            .env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ImageMetadata {
            env,
            exposed_ports: config.exposed_ports.into_keys().collect(),
            workdir: config
                .working_dir
                .filter(|w| !w.is_empty())
                .unwrap_or_else(|| "/".to_string()),
            entrypoint: config.entrypoint,
            cmd: config.cmd,
            user: config.user.filter(|u| !u.is_empty()),
            labels: config.labels,
        }
    }
}

/// Images stored as directories.
///
/// Each image lives in `<root>/<reference>/` with `/`, `:` and `@`
/// replaced by `_`, and holds `rootfs.tar.gz` (or `rootfs.tar`) plus an
/// optional `config.json`.
pub struct DirImageSource {
    root: PathBuf,
}

impl DirImageSource {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Directory an image reference is stored in.
    pub fn image_dir(&self, reference: &str) -> PathBuf {
        self.root.join(reference.replace(['/', ':', '@'], "_"))
    }
}

#[async_trait]
impl ImageSource for DirImageSource {
    async fn fetch(&self, reference: &str) -> Result<BaseImage> {
        if reference.eq_ignore_ascii_case(SCRATCH) {
            return Ok(BaseImage::scratch());
        }

        let dir = self.image_dir(reference);
        let rootfs = ["rootfs.tar.gz", "rootfs.tar"]
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                image_error(
                    reference,
                    format!("no rootfs archive in {}", dir.display()),
                )
            })?;

        let config_path = dir.join("config.json");
        let (config, config_hash) = if config_path.is_file() {
            let bytes = tokio::fs::read(&config_path).await?;
            let config: ImageConfig = serde_json::from_slice(&bytes).map_err(|e| {
                image_error(reference, format!("invalid config.json: {}", e))
            })?;
            (config, sha256_bytes(&bytes))
        } else {
            (ImageConfig::default(), String::new())
        };

        let digest = combined_digest(&sha256_file(&rootfs)?, &config_hash);
        tracing::debug!(reference, digest = %digest, "Resolved base image");

        Ok(BaseImage {
            reference: reference.to_string(),
            digest,
            metadata: config.into(),
            rootfs: RootfsArchive::File(rootfs),
        })
    }
}

/// In-memory images, for tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryImageSource {
    images: HashMap<String, BaseImage>,
}

impl MemoryImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: BaseImage) -> Self {
        self.images.insert(image.reference.clone(), image);
        self
    }
}

#[async_trait]
impl ImageSource for MemoryImageSource {
    async fn fetch(&self, reference: &str) -> Result<BaseImage> {
        if let Some(image) = self.images.get(reference) {
            return Ok(image.clone());
        }
        if reference.eq_ignore_ascii_case(SCRATCH) {
            return Ok(BaseImage::scratch());
        }
        Err(image_error(reference, "image not found".to_string()))
    }
}
