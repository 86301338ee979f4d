//! Image assembly.
//!
//! The manifest describes the target stage: its base image, the non-empty
//! layers in application order (inherited layers first), the final
//! metadata and one history entry per step. It carries no timestamps, so
//! rebuilding the same inputs yields the same manifest and digest.

use std::path::Path;

use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};

use super::executor::StageOutput;
use super::fingerprint::Fingerprint;
use super::layer::{diff_id, sha256_bytes};
use super::metadata::ImageMetadata;
use crate::archive;
use crate::cache::LayerStore;
use crate::image::{ImageConfig, ImageSource};

const MANIFEST_VERSION: u32 = 1;
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// External image a stage chain starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseReference {
    pub reference: String,
    pub digest: String,
}

/// A non-empty layer of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub fingerprint: Fingerprint,
    /// SHA256 of the gzip blob
    pub digest: String,
    pub size_bytes: u64,
}

/// One step of the image's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created_by: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// How a runtime derives the process arguments from the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandRule {
    /// `entrypoint ++ cmd`; either may be absent
    AppendCmdToEntrypoint,
}

/// The built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub schema_version: u32,
    /// Alias of the stage the image was taken from; anonymous stages have
    /// none, so declaration order never reaches the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<BaseReference>,
    pub layers: Vec<LayerRecord>,
    pub metadata: ImageMetadata,
    pub command_rule: CommandRule,
    pub history: Vec<HistoryEntry>,
}

impl ImageManifest {
    /// Assemble the manifest of a completed stage.
    pub fn assemble(target: &StageOutput) -> Self {
        Self {
            schema_version: MANIFEST_VERSION,
            target: target.alias.clone(),
            base: target.base.clone(),
            layers: target.layers.clone(),
            metadata: target.metadata.clone(),
            command_rule: CommandRule::AppendCmdToEntrypoint,
            history: target.history.clone(),
        }
    }

    pub fn layer_fingerprints(&self) -> Vec<&Fingerprint> {
        self.layers.iter().map(|l| &l.fingerprint).collect()
    }

    /// Compact JSON; maps are sorted so the bytes are canonical.
    pub fn canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// `sha256:<hex>` of the canonical JSON.
    pub fn digest(&self) -> Result<String> {
        Ok(format!("sha256:{}", sha256_bytes(&self.canonical_json()?)))
    }

    /// The process arguments the image starts with by default.
    pub fn default_command(&self) -> Vec<String> {
        let entrypoint = self.metadata.entrypoint.iter().flatten();
        let cmd = self.metadata.cmd.iter().flatten();
        entrypoint.chain(cmd).cloned().collect()
    }
}

/// Assemble the manifest for `target_name` from its stage output, if any.
pub fn assemble(target_name: &str, output: Option<&StageOutput>) -> Result<ImageManifest> {
    let output = output.ok_or_else(|| KilnError::IncompleteStage {
        stage: target_name.to_string(),
    })?;
    let manifest = ImageManifest::assemble(output);
    tracing::debug!(
        stage = %target_name,
        layers = manifest.layers.len(),
        "Assembled image manifest"
    );
    Ok(manifest)
}

/// Result of [`export_oci_layout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciExport {
    /// `sha256:<hex>` of the OCI manifest
    pub manifest_digest: String,
    pub layer_count: usize,
    /// Sum of all blob sizes
    pub size: u64,
}

/// Write `manifest` as an OCI image layout into `output_dir`.
///
/// Layer blobs come from `store`; the base image's rootfs becomes the
/// first layer.
pub async fn export_oci_layout(
    manifest: &ImageManifest,
    store: &dyn LayerStore,
    images: &dyn ImageSource,
    output_dir: &Path,
) -> Result<OciExport> {
    let blobs_dir = output_dir.join("blobs").join("sha256");
    tokio::fs::create_dir_all(&blobs_dir).await.map_err(|e| {
        KilnError::Build(format!(
            "Failed to create output blobs dir {}: {}",
            blobs_dir.display(),
            e
        ))
    })?;

    let mut descriptors = Vec::new();
    let mut diff_ids = Vec::new();
    let mut total_size = 0u64;

    if let Some(base) = &manifest.base {
        let image = images.fetch(&base.reference).await?;
        if let Some(rootfs) = image.rootfs_archive().await? {
            let blob = archive::to_tar_gzip(&rootfs)?;
            let (descriptor, id) = write_layer_blob(&blobs_dir, &blob).await?;
            total_size += blob.len() as u64;
            descriptors.push(descriptor);
            diff_ids.push(id);
        }
    }

    for layer in &manifest.layers {
        let stored = store.get(&layer.fingerprint).await?.ok_or_else(|| {
            KilnError::Store(format!(
                "Layer {} is missing from the store",
                layer.fingerprint
            ))
        })?;
        let (descriptor, id) = write_layer_blob(&blobs_dir, &stored.blob).await?;
        total_size += stored.blob.len() as u64;
        descriptors.push(descriptor);
        diff_ids.push(id);
    }

    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    let now = chrono::Utc::now().to_rfc3339();
    let config = serde_json::json!({
        "architecture": arch,
        "os": "linux",
        "created": now,
        "config": ImageConfig::from(&manifest.metadata),
        "rootfs": {
            "type": "layers",
            "diff_ids": diff_ids,
        },
        "history": manifest.history.iter().map(|h| {
            let mut entry = serde_json::json!({
                "created": now,
                "created_by": h.created_by,
            });
            if h.empty_layer {
                entry["empty_layer"] = serde_json::json!(true);
            }
            entry
        }).collect::<Vec<_>>(),
    });

    let config_bytes = serde_json::to_vec_pretty(&config)?;
    let config_digest = write_blob(&blobs_dir, &config_bytes).await?;
    total_size += config_bytes.len() as u64;

    let oci_manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "digest": format!("sha256:{}", config_digest),
            "size": config_bytes.len(),
        },
        "layers": descriptors,
    });
    let manifest_bytes = serde_json::to_vec_pretty(&oci_manifest)?;
    let manifest_digest = write_blob(&blobs_dir, &manifest_bytes).await?;
    total_size += manifest_bytes.len() as u64;

    let mut descriptor = serde_json::json!({
        "mediaType": MANIFEST_MEDIA_TYPE,
        "digest": format!("sha256:{}", manifest_digest),
        "size": manifest_bytes.len(),
    });
    if let Some(name) = &manifest.target {
        descriptor["annotations"] = serde_json::json!({
            "org.opencontainers.image.ref.name": name,
        });
    }
    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [descriptor],
    });
    write_file(&output_dir.join("index.json"), &serde_json::to_vec_pretty(&index)?).await?;
    write_file(
        &output_dir.join("oci-layout"),
        br#"{"imageLayoutVersion":"1.0.0"}"#,
    )
    .await?;

    tracing::info!(
        output = %output_dir.display(),
        digest = %manifest_digest,
        layers = descriptors.len(),
        "Exported OCI image layout"
    );

    Ok(OciExport {
        manifest_digest: format!("sha256:{}", manifest_digest),
        layer_count: descriptors.len(),
        size: total_size,
    })
}

async fn write_layer_blob(blobs_dir: &Path, blob: &[u8]) -> Result<(serde_json::Value, String)> {
    let digest = write_blob(blobs_dir, blob).await?;
    let descriptor = serde_json::json!({
        "mediaType": LAYER_MEDIA_TYPE,
        "digest": format!("sha256:{}", digest),
        "size": blob.len(),
    });
    Ok((descriptor, format!("sha256:{}", diff_id(blob)?)))
}

async fn write_blob(blobs_dir: &Path, data: &[u8]) -> Result<String> {
    let digest = sha256_bytes(data);
    let path = blobs_dir.join(&digest);
    if !path.exists() {
        write_file(&path, data).await?;
    }
    Ok(digest)
}

async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    tokio::fs::write(path, data).await.map_err(|e| {
        KilnError::Build(format!("Failed to write {}: {}", path.display(), e))
    })
}
