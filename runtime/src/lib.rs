//! Kiln Runtime - Dockerfile interpreter and layered build executor.
//!
//! Builds container images from Dockerfiles: stages are planned as a
//! dependency graph, independent stages run concurrently, and every
//! filesystem step is cached by a chained content fingerprint so that an
//! unchanged prefix of a Dockerfile is never executed twice.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod build;
pub mod cache;
pub mod context;
pub mod image;

// Re-export common types
pub use build::{BuildEngine, BuildOptions, BuildPlan, BuildResult, Dockerfile, ImageManifest};
pub use build::{ChrootRunner, CommandRunner, Fetcher, HttpFetcher};
pub use cache::{DiskLayerStore, LayerStore, MemoryLayerStore};
pub use context::{BuildContext, DirContext, MemoryContext};
pub use image::{BaseImage, DirImageSource, ImageSource, MemoryImageSource};

/// Kiln Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
