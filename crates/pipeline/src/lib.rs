//! The PPTX safety pipeline: validation, sanitization, caching and worker
//! hand-off composed behind one [`Orchestrator`].
//!
//! Every service here is constructed explicitly and shared through `Arc`, so
//! several independent pipelines can live in one process.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error_handler;
pub mod memory;
pub mod metrics;
pub mod orchestrator;

pub use cache::{BackingStore, CacheStats, DirStore, MemoryStore, MultiTierCache, Priority, SetOptions, TierId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ErrorConfig, MemoryConfig, PipelineConfig, TierConfig, WorkerConfig};
pub use error_handler::{ErrorHandler, ErrorKind, ErrorRecord, ErrorStats, RecoveryOutcome, RecoveryStrategy, Severity, StageParams};
pub use memory::{MemoryManager, MemoryStats};
pub use metrics::{Component, ComponentStatus, HealthReport, MetricsSnapshot, PipelineMetrics};
pub use orchestrator::{
    BatchFailed, CachedOutcome, NoopObserver, OperationMetrics, OperationStatus, Orchestrator, PipelineObserver,
    ProcessOptions, ProcessResult, Stage,
};
