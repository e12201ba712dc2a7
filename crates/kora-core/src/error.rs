use std::path::PathBuf;
use thiserror::Error;

/// Failure talking to a field device. Never fatal: the tag is marked stale
/// and retried on the next cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommunicationError {
    #[error("adapter is not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("read of '{address}' timed out after {timeout_ms} ms")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("device error at '{address}': {message}")]
    Device { address: String, message: String },
}

impl CommunicationError {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::ConnectFailed(_) => "connect_failed",
            Self::Timeout { .. } => "timeout",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::Device { .. } => "device",
        }
    }
}

/// The engine refuses to start scanning against an invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("tag registry is empty")]
    EmptyRegistry,

    #[error("duplicate tag id '{0}'")]
    DuplicateTag(String),

    #[error("tag id must not be blank")]
    BlankTagId,

    #[error("tag '{id}' has a non-finite alarm limit ({limit})")]
    InvalidLimit { id: String, limit: f64 },

    #[error("failed to load tag file {path}: {reason}")]
    TagFile { path: PathBuf, reason: String },

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("unknown tag '{0}'")]
    UnknownTag(String),

    #[error("timestamp for '{id}' must advance (previous {previous_us}, attempted {attempted_us})")]
    NonMonotonic {
        id: String,
        previous_us: u64,
        attempted_us: u64,
    },
}

/// Anomaly model could not be loaded or used. Only ever surfaced as a
/// zero-confidence explanation.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model file is corrupt: {0}")]
    Corrupt(String),

    #[error("baseline for '{tag}' is invalid: {reason}")]
    InvalidBaseline { tag: String, reason: String },

    #[error("not enough samples to fit '{tag}' ({samples} < {required})")]
    InsufficientSamples {
        tag: String,
        samples: usize,
        required: usize,
    },
}
