use std::time::Duration;

use thiserror::Error;

/// Kiln error types
#[derive(Error, Debug)]
pub enum KilnError {
    /// Malformed build-file instruction
    #[error("Syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// A stage reference that names no declared stage
    #[error(
        "Unresolved stage reference '{reference}' at line {line}: no stage has this name; \
         write '{reference}:latest' to use an image"
    )]
    UnresolvedStage { line: usize, reference: String },

    /// Stages whose base/copy-source references form a cycle
    #[error("Cyclic stage dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// COPY/ADD source missing from the context or source stage
    #[error("Source not found in stage '{stage}' at line {line}: {path}")]
    SourceNotFound {
        stage: String,
        line: usize,
        path: String,
    },

    /// Variable referenced without a value
    #[error("Undefined argument '{name}' in stage '{stage}' at line {line}")]
    UndefinedArgument {
        stage: String,
        line: usize,
        name: String,
    },

    /// RUN command exited non-zero
    #[error("RUN failed in stage '{stage}' at line {line} (exit {exit_code}): {stderr}")]
    BuildFailed {
        stage: String,
        line: usize,
        exit_code: i32,
        stderr: String,
    },

    /// RUN/ADD exceeded its instruction timeout
    #[error("Instruction timed out in stage '{stage}' at line {line} after {after:?}")]
    Timeout {
        stage: String,
        line: usize,
        after: Duration,
    },

    /// The designated final stage never completed
    #[error("Stage '{stage}' did not complete")]
    IncompleteStage { stage: String },

    /// Remote fetch failed permanently
    #[error("Fetch failed: {url} - {message}")]
    Fetch { url: String, message: String },

    /// Base image could not be loaded
    #[error("Image error: {reference} - {message}")]
    Image { reference: String, message: String },

    /// Layer store error
    #[error("Layer store error: {0}")]
    Store(String),

    /// Build execution error not covered above
    #[error("Build error: {0}")]
    Build(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Build aborted by cancellation
    #[error("Build cancelled")]
    Cancelled,
}

impl KilnError {
    /// Whether the error was raised while planning, before any layer ran.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            KilnError::Syntax { .. }
                | KilnError::UnresolvedStage { .. }
                | KilnError::CyclicDependency { .. }
        )
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KilnError {
    fn from(err: serde_yaml::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

/// Result type alias for Kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;
