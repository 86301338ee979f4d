//! Kiln Core - shared types for the Kiln image builder.
//!
//! Error taxonomy, engine configuration and logging setup used by
//! `kiln-runtime` and by embedders.

pub mod config;
pub mod error;
pub mod log;

pub use config::{FetchConfig, KilnConfig, LogConfig, LogLevel};
pub use error::{KilnError, Result};
pub use log::init_tracing;

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
