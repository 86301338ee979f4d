use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{KilnError, Result};

/// Engine-wide configuration.
///
/// Loaded from YAML (all fields optional) and then adjusted by `KILN_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    /// Layer store directory
    pub store_dir: PathBuf,

    /// Maximum number of stages built concurrently
    pub max_parallel_stages: usize,

    /// Timeout for a single RUN or remote ADD instruction in seconds (0 = unlimited)
    pub instruction_timeout_secs: u64,

    /// Remote fetch policy
    pub fetch: FetchConfig,

    /// Logging setup
    pub log: LogConfig,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            max_parallel_stages: 4,
            instruction_timeout_secs: 1800, // 30 minutes
            fetch: FetchConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl KilnConfig {
    /// Parse configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: KilnConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Apply `KILN_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `KILN_*` overrides using the given lookup.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("KILN_STORE_DIR") {
            self.store_dir = PathBuf::from(dir);
        }
        if let Some(jobs) = lookup("KILN_MAX_PARALLEL_STAGES") {
            self.max_parallel_stages = parse_env_number("KILN_MAX_PARALLEL_STAGES", &jobs)?;
        }
        if let Some(secs) = lookup("KILN_INSTRUCTION_TIMEOUT") {
            self.instruction_timeout_secs = parse_env_number("KILN_INSTRUCTION_TIMEOUT", &secs)?;
        }
        if let Some(attempts) = lookup("KILN_FETCH_ATTEMPTS") {
            self.fetch.max_attempts = parse_env_number("KILN_FETCH_ATTEMPTS", &attempts)?;
        }
        if let Some(level) = lookup("KILN_LOG_LEVEL") {
            self.log.level = level.parse().map_err(KilnError::Config)?;
        }
        if let Some(json) = lookup("KILN_LOG_JSON") {
            self.log.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    /// Per-instruction timeout, `None` when unlimited.
    pub fn instruction_timeout(&self) -> Option<Duration> {
        match self.instruction_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel_stages == 0 {
            return Err(KilnError::Config(
                "max_parallel_stages must be at least 1".to_string(),
            ));
        }
        if self.fetch.max_attempts == 0 {
            return Err(KilnError::Config(
                "fetch.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KilnError::Config(format!("{} must be a number, got '{}'", key, value)))
}

fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiln")
        .join("layers")
}

/// Retry policy for remote ADD sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry, doubled on each further retry
    pub backoff_ms: u64,

    /// Timeout of a single attempt in seconds
    pub attempt_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            attempt_timeout_secs: 60,
        }
    }
}

impl FetchConfig {
    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level used when `RUST_LOG` is not set
    pub level: LogLevel,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: '{}' (supported: debug, info, warn, error)",
                s
            )),
        }
    }
}
