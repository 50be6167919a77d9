//! Error types for the PPTX safety pipeline.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while validating, sanitizing or processing an archive.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to open or read an input or backing file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The ZIP container itself is unreadable.
    #[error("Archive corrupted: {0}")]
    ArchiveCorrupted(String),

    /// Required parts of the package are missing or malformed.
    #[error("Structural error: {0}")]
    StructuralError(String),

    /// An input exceeded a configured size limit.
    #[error("Size limit exceeded: {0}")]
    SizeExceeded(String),

    /// ZIP archive error while writing or re-reading an entry.
    #[error("ZIP error: {0}")]
    ZipError(String),

    /// XML parsing error.
    #[error("XML parsing error: {0}")]
    XmlError(String),

    /// The processing worker did not answer within its budget.
    #[error("Worker timed out after {0} ms")]
    WorkerTimeout(u64),

    /// The processing worker failed.
    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    /// Memory limits were hit while processing.
    #[error("Memory exceeded: {0}")]
    MemoryExceeded(String),

    /// Transport failure talking to a collaborator.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A collaborator asked us to slow down.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// A resource kind or format this pipeline does not handle.
    #[error("Unsupported resource: {0}")]
    UnsupportedResource(String),

    /// A cache tier or backing store failed.
    #[error("Cache error: {0}")]
    CacheError(String),

    /// The operation was cancelled by its caller.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::CacheError(format!("serialization failed: {}", e))
    }
}
