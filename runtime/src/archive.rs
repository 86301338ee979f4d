//! Archive detection and extraction.
//!
//! Recognizes tar archives, plain or compressed with gzip, bzip2 or xz,
//! by their magic bytes rather than by file name.

use std::io::Read;
use std::path::Path;

use kiln_core::error::{KilnError, Result};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const TAR_MAGIC_OFFSET: usize = 257;

/// A recognized archive format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGzip,
    TarBzip2,
    TarXz,
}

impl ArchiveKind {
    /// Detect the archive format of `data`.
    ///
    /// Compressed payloads count only if they decompress to a tar stream;
    /// a gzipped text file is not an archive.
    pub fn detect(data: &[u8]) -> Option<Self> {
        let kind = if data.starts_with(GZIP_MAGIC) {
            ArchiveKind::TarGzip
        } else if data.starts_with(BZIP2_MAGIC) {
            ArchiveKind::TarBzip2
        } else if data.starts_with(XZ_MAGIC) {
            ArchiveKind::TarXz
        } else {
            return is_tar_header(data).then_some(ArchiveKind::Tar);
        };

        let mut header = Vec::with_capacity(512);
        decoder(kind, data).take(512).read_to_end(&mut header).ok()?;
        is_tar_header(&header).then_some(kind)
    }
}

fn is_tar_header(block: &[u8]) -> bool {
    block
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5)
        .is_some_and(|magic| magic == b"ustar")
}

fn decoder<'a>(kind: ArchiveKind, data: &'a [u8]) -> Box<dyn Read + 'a> {
    match kind {
        ArchiveKind::Tar => Box::new(data),
        ArchiveKind::TarGzip => Box::new(flate2::read::GzDecoder::new(data)),
        ArchiveKind::TarBzip2 => Box::new(bzip2::read::BzDecoder::new(data)),
        ArchiveKind::TarXz => Box::new(xz2::read::XzDecoder::new(data)),
    }
}

/// Extract `data` into `target_dir` if it is a recognized archive.
///
/// Returns the detected format, or `None` (and writes nothing) when `data`
/// is not an archive.
pub fn unpack(data: &[u8], target_dir: &Path) -> Result<Option<ArchiveKind>> {
    let Some(kind) = ArchiveKind::detect(data) else {
        return Ok(None);
    };

    std::fs::create_dir_all(target_dir).map_err(|e| {
        KilnError::Build(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let mut archive = tar::Archive::new(decoder(kind, data));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(target_dir).map_err(|e| {
        KilnError::Build(format!(
            "Failed to extract {:?} archive to {}: {}",
            kind,
            target_dir.display(),
            e
        ))
    })?;

    tracing::debug!(
        kind = ?kind,
        dir = %target_dir.display(),
        "Extracted archive"
    );

    Ok(Some(kind))
}

/// Re-encode a tar archive of any supported format as tar+gzip.
pub fn to_tar_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;

    match ArchiveKind::detect(data) {
        Some(ArchiveKind::TarGzip) => Ok(data.to_vec()),
        Some(kind) => {
            let mut tar = Vec::new();
            decoder(kind, data).read_to_end(&mut tar).map_err(|e| {
                KilnError::Build(format!("Failed to decompress {:?} archive: {}", kind, e))
            })?;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&tar)?;
            Ok(encoder.finish()?)
        }
        None => Err(KilnError::Build("Data is not a tar archive".to_string())),
    }
}
