//! Error types shared by every Vigil component.
//!
//! Two layers:
//! - [`AdapterError`]: a single capability call failed. Always skip-and-continue.
//! - [`VigilError`]: something the caller has to decide about (bad config,
//!   corrupted persisted state, a collector that would not shut down).

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Failure of one Metric Source Adapter call.
///
/// The core never treats any of these as fatal: a failed sample is skipped,
/// a failed scan becomes a skipped category, a failed removal becomes an
/// item error in the run result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl AdapterError {
    /// Map an io error for `path` onto the adapter taxonomy
    pub fn from_io(err: &io::Error, path: impl std::fmt::Display) -> Self {
        let detail = format!("{}: {}", path, err);
        match err.kind() {
            io::ErrorKind::PermissionDenied => AdapterError::PermissionDenied(detail),
            io::ErrorKind::NotFound => AdapterError::NotFound(detail),
            _ => AdapterError::Unavailable(detail),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            AdapterError::PermissionDenied(_) => "permission_denied",
            AdapterError::NotFound(_) => "not_found",
            AdapterError::Unavailable(_) => "unavailable",
        }
    }
}

impl From<io::Error> for AdapterError {
    fn from(err: io::Error) -> Self {
        let detail = err.to_string();
        match err.kind() {
            io::ErrorKind::PermissionDenied => AdapterError::PermissionDenied(detail),
            io::ErrorKind::NotFound => AdapterError::NotFound(detail),
            _ => AdapterError::Unavailable(detail),
        }
    }
}

/// Run-blocking errors surfaced to the composing process
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// Config failed validation. Startup must be refused.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("failed to read config {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Persisted state exists but cannot be parsed. The caller decides
    /// whether to reset it.
    #[error("persisted state {path:?} is corrupted: {source}")]
    StateCorrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state I/O failed for {path:?}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode persisted state: {0}")]
    StateEncode(#[source] serde_json::Error),

    #[error("collector did not stop within {0:?}")]
    ShutdownTimedOut(Duration),

    #[error("unknown optimization task: {0}")]
    UnknownTask(String),

    /// A blocking worker panicked or was cancelled
    #[error("background worker failed: {0}")]
    Worker(String),

    /// A capability the operation cannot do without (e.g. disk usage for a
    /// snapshot) failed
    #[error("{operation} failed: {source}")]
    Adapter {
        operation: &'static str,
        #[source]
        source: AdapterError,
    },
}

pub type Result<T> = std::result::Result<T, VigilError>;
