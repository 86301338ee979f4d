//! Layer cache.
//!
//! `LayerStore` is the persistent, content-addressed home of built layers:
//! - `DiskLayerStore`: directory-backed, shared between builds and processes
//! - `MemoryLayerStore`: process-local, for tests and one-shot builds

pub mod layer_store;

pub use layer_store::{
    DiskLayerStore, LayerMeta, LayerStore, MemoryLayerStore, PutOutcome, StoredLayer,
};
