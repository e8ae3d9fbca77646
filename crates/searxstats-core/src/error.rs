//! Error taxonomy for the prober.
//!
//! Only [`ConfigError`] and [`ProbeError::BackendInit`] are fatal; both abort
//! before any instance is probed. Per-instance failures never surface here,
//! they are recorded as [`crate::check::CheckOutcome`] values in the snapshot.

use std::path::PathBuf;

/// Errors produced while loading configuration or the instance source.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("instance source is empty")]
    EmptySource,

    #[error("invalid instance url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("malformed instance source {path}: {reason}")]
    MalformedSource { path: PathBuf, reason: String },

    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("invalid regex for {field}: {source}")]
    InvalidRegex {
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level errors for a probe run.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("backend {backend} failed to initialize: {reason}")]
    BackendInit { backend: String, reason: String },

    #[error("cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type for probe-level operations.
pub type Result<T> = std::result::Result<T, ProbeError>;
