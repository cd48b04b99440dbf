use std::path::PathBuf;

use crate::codec::CodecError;
use crate::crypto::CryptoError;

/// The primary error type for all operations in the `packforge` crate.
#[derive(Debug)]
pub enum EngineError {
    /// An I/O error occurred while reading the source stream or writing an output.
    /// Includes the path where the error happened, when known.
    Io { source: std::io::Error, path: PathBuf },

    /// A codec failed outside of the per-entry fallback chain (e.g. while building an index).
    Codec(CodecError),

    /// An encryption layer could not be applied.
    Crypto(CryptoError),

    /// The resulting archive would not be addressable with the format's offset width.
    Capacity { required: u64, limit: u64 },

    /// The caller requested cancellation.
    Cancelled,

    /// A worker failed fatally; the whole pass was abandoned.
    PassAborted { worker: usize, source: Box<EngineError> },

    /// A worker thread panicked.
    WorkerPanicked { worker: usize },

    /// Worker outputs do not add up to the layout recorded in the entries.
    Layout(String),

    /// The container on disk is malformed.
    Format(String),

    /// An error during serialization or deserialization of the container index or config.
    SerdeJson(serde_json::Error),

    /// An invalid configuration value.
    Config(String),
}

impl EngineError {
    pub fn io_at(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        EngineError::Io { source, path: path.into() }
    }

    /// True when the caller should treat the failure as "operation cancelled".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled | EngineError::PassAborted { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Io { source, path } if path.as_os_str().is_empty() => write!(f, "I/O error: {}", source),
            EngineError::Io { source, path } => write!(f, "I/O error on path '{}': {}", path.display(), source),
            EngineError::Codec(e) => write!(f, "Codec error: {}", e),
            EngineError::Crypto(e) => write!(f, "Crypto error: {}", e),
            EngineError::Capacity { required, limit } => write!(
                f,
                "Resulting archive needs {} bytes but the format can only address {} bytes",
                required, limit
            ),
            EngineError::Cancelled => write!(f, "Operation cancelled"),
            EngineError::PassAborted { worker, source } => {
                write!(f, "Operation cancelled: worker {} failed: {}", worker, source)
            }
            EngineError::WorkerPanicked { worker } => write!(f, "Worker thread {} panicked", worker),
            EngineError::Layout(msg) => write!(f, "Layout mismatch: {}", msg),
            EngineError::Format(msg) => write!(f, "Malformed container: {}", msg),
            EngineError::SerdeJson(e) => write!(f, "Serialization error: {}", e),
            EngineError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io { source, .. } => Some(source),
            EngineError::Codec(e) => Some(e),
            EngineError::Crypto(e) => Some(e),
            EngineError::PassAborted { source, .. } => Some(source.as_ref()),
            EngineError::SerdeJson(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerdeJson(err)
    }
}

impl From<CodecError> for EngineError {
    fn from(err: CodecError) -> Self {
        EngineError::Codec(err)
    }
}

impl From<CryptoError> for EngineError {
    fn from(err: CryptoError) -> Self {
        EngineError::Crypto(err)
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io { source: err, path: PathBuf::new() }
    }
}
