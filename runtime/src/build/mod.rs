//! Dockerfile builds.
//!
//! Parses a Dockerfile into stages, plans the stage graph, executes each
//! stage's steps against a content-addressed layer store and assembles the
//! image manifest of the target stage.
//!
//! # Supported Instructions
//!
//! FROM, ARG, ENV, LABEL, EXPOSE, USER, WORKDIR, ENTRYPOINT, CMD, RUN, COPY, ADD

pub mod assemble;
pub mod dockerfile;
pub mod engine;
pub mod executor;
pub mod expand;
pub mod fetch;
pub mod fingerprint;
pub mod layer;
pub mod metadata;
pub mod plan;
pub mod runner;

pub use assemble::{assemble, export_oci_layout, ImageManifest, OciExport};
pub use dockerfile::{CommandForm, Dockerfile, Instruction, Stage, Step};
pub use engine::{BuildEngine, BuildOptions, BuildResult};
pub use executor::{BuildServices, StageOutput, StepReport, StepStatus};
pub use fetch::{FetchFailure, Fetcher, HttpFetcher};
pub use fingerprint::Fingerprint;
pub use layer::DirSnapshot;
pub use metadata::{ArgScope, ImageMetadata};
pub use plan::{BuildPlan, StageRef};
pub use runner::{ChrootRunner, CommandRunner, RunOutput, RunSpec};
