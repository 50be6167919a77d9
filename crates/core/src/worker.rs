//! The external processing worker contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveHandle;
use crate::error::Result;
use crate::types::Presentation;

/// Parameters handed to the worker for one call.
///
/// `timeout_ms` and `batch_size` are adjusted between retries by recovery
/// strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOptions {
    pub extract_text: bool,
    pub extract_images: bool,
    pub extract_metadata: bool,
    /// Budget for this call in milliseconds.
    pub timeout_ms: u64,
    /// Number of slides the worker should hold in memory at once.
    pub batch_size: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            extract_text: true,
            extract_images: false,
            extract_metadata: false,
            timeout_ms: 30_000,
            batch_size: 50,
        }
    }
}

/// Content extraction collaborator.
///
/// Receives an already-sanitized archive. Implementations may fail or stall;
/// the caller enforces the timeout and concurrency limit.
#[async_trait]
pub trait ProcessingWorker: Send + Sync {
    /// Extract content from a sanitized archive.
    async fn process(&self, payload: &ArchiveHandle, options: &WorkerOptions) -> Result<Presentation>;

    /// Short label used in logs and health reports.
    fn name(&self) -> &str {
        "worker"
    }
}
