//! The request/response pipeline.
//!
//! One call to [`Orchestrator::process_file`] walks an operation through
//! cache lookup, validation, sanitization, the processing worker and the
//! cache write. Every stage failure is normalised by the [`ErrorHandler`];
//! retryable ones re-run the stage with adjusted parameters. Whatever the
//! outcome, the resources pinned for the operation are released before the
//! result is returned.

use futures_util::future::join_all;
use ppt_core::{
    ArchiveHandle, Error, IssueCode, Presentation, ProcessingWorker, Result, SanitizationResult, SanitizeOptions,
    ValidationResult, WorkerOptions,
};
use ppt_pptx::{Sanitizer, Validator};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{archive_tag, derive_key, MultiTierCache, Priority, SetOptions};
use crate::config::PipelineConfig;
use crate::error_handler::{ErrorHandler, ErrorRecord, StageParams};
use crate::memory::MemoryManager;
use crate::metrics::{Component, HealthReport, MetricsSnapshot, PipelineMetrics};

/// Finished operations whose status stays queryable.
const FINISHED_HISTORY: usize = 256;
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Caller options for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessOptions {
    pub use_cache: bool,
    pub skip_validation: bool,
    /// An invalid archive fails the operation instead of continuing.
    pub strict_validation: bool,
    pub skip_sanitization: bool,
    pub extract_text: bool,
    pub extract_images: bool,
    pub extract_metadata: bool,
    /// Emit `progress` events to the observer.
    pub enable_progress: bool,
    pub sanitize: SanitizeOptions,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            skip_validation: false,
            strict_validation: true,
            skip_sanitization: false,
            extract_text: true,
            extract_images: false,
            extract_metadata: false,
            enable_progress: false,
            sanitize: SanitizeOptions::default(),
        }
    }
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }

    pub fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    pub fn with_skip_sanitization(mut self, skip: bool) -> Self {
        self.skip_sanitization = skip;
        self
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.enable_progress = enabled;
        self
    }

    pub fn with_sanitize(mut self, sanitize: SanitizeOptions) -> Self {
        self.sanitize = sanitize;
        self
    }

    /// The subset of options that changes what the pipeline produces.
    fn fingerprint(&self) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Fingerprint<'a> {
            skip_validation: bool,
            strict_validation: bool,
            skip_sanitization: bool,
            extract_text: bool,
            extract_images: bool,
            extract_metadata: bool,
            sanitize: &'a SanitizeOptions,
        }
        serde_json::to_string(&Fingerprint {
            skip_validation: self.skip_validation,
            strict_validation: self.strict_validation,
            skip_sanitization: self.skip_sanitization,
            extract_text: self.extract_text,
            extract_images: self.extract_images,
            extract_metadata: self.extract_metadata,
            sanitize: &self.sanitize,
        })
        .unwrap_or_default()
    }
}

/// Lifecycle of one operation. Moves forward only; `Failed` is reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Queued,
    Validating,
    Sanitizing,
    Processing,
    Cached,
    Completed,
    Failed,
}

impl OperationStatus {
    fn rank(&self) -> u8 {
        match self {
            OperationStatus::Queued => 0,
            OperationStatus::Validating => 1,
            OperationStatus::Sanitizing => 2,
            OperationStatus::Processing => 3,
            OperationStatus::Cached => 4,
            OperationStatus::Completed => 5,
            OperationStatus::Failed => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == OperationStatus::Failed || next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    CacheLookup,
    Validation,
    Sanitization,
    Processing,
    CacheStore,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::CacheLookup => "cache-lookup",
            Stage::Validation => "validation",
            Stage::Sanitization => "sanitization",
            Stage::Processing => "processing",
            Stage::CacheStore => "cache-store",
        }
    }

    fn percent(&self) -> u8 {
        match self {
            Stage::CacheLookup => 5,
            Stage::Validation => 30,
            Stage::Sanitization => 55,
            Stage::Processing => 90,
            Stage::CacheStore => 100,
        }
    }
}

/// Receives pipeline events. All methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    fn stage_started(&self, _operation_id: &str, _stage: Stage) {}

    fn stage_completed(&self, _operation_id: &str, _stage: Stage) {}

    fn progress(&self, _operation_id: &str, _stage: Stage, _percent: u8) {}

    fn error(&self, _operation_id: &str, _record: &ErrorRecord) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// What the cache holds per archive and option set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedOutcome {
    pub presentation: Presentation,
    pub validation_result: Option<ValidationResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetrics {
    pub duration_ms: u64,
    pub cache_hit: bool,
    /// Change in sampled memory use while the operation held its resources.
    pub memory_delta: i64,
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResult {
    pub success: bool,
    pub operation_id: String,
    pub data: Option<Presentation>,
    pub validation_result: Option<ValidationResult>,
    pub sanitization_result: Option<SanitizationResult>,
    pub metrics: OperationMetrics,
    pub error: Option<ErrorRecord>,
}

/// Every input of a batch failed.
#[derive(Debug, ThisError)]
#[error("all {} inputs of the batch failed", .failures.len())]
pub struct BatchFailed {
    pub failures: Vec<ProcessResult>,
}

/// Filled in as stages complete, so a failing or cancelled operation still
/// reports what it got through.
#[derive(Default)]
struct StageReport {
    validation: Option<ValidationResult>,
    sanitization: Option<SanitizationResult>,
    cache_hit: bool,
    retries: u32,
}

impl StageReport {
    /// Unwrap a stage outcome. Retries count whether or not the stage
    /// finally succeeded.
    fn settle<T>(&mut self, outcome: std::result::Result<(T, u32), ErrorRecord>) -> std::result::Result<T, ErrorRecord> {
        match outcome {
            Ok((value, retries)) => {
                self.retries += retries;
                Ok(value)
            }
            Err(record) => {
                self.retries += record.retry_count;
                Err(record)
            }
        }
    }
}

struct InFlight {
    status: OperationStatus,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct Operations {
    in_flight: HashMap<String, InFlight>,
    finished: VecDeque<(String, OperationStatus)>,
}

pub struct Orchestrator {
    config: PipelineConfig,
    validator: Arc<Validator>,
    sanitizer: Arc<Sanitizer>,
    worker: Arc<dyn ProcessingWorker>,
    cache: Arc<MultiTierCache<CachedOutcome>>,
    custom_cache: bool,
    memory: Arc<MemoryManager>,
    errors: Arc<ErrorHandler>,
    metrics: Arc<PipelineMetrics>,
    observer: Arc<dyn PipelineObserver>,
    permits: Arc<Semaphore>,
    operations: Mutex<Operations>,
}

impl Orchestrator {
    /// Build a pipeline with in-memory cache tiers and system memory
    /// sampling. Fails when `config` is inconsistent.
    pub fn new(config: PipelineConfig, worker: Arc<dyn ProcessingWorker>) -> Result<Self> {
        config.check()?;
        let memory = Arc::new(MemoryManager::new(config.memory.clone()));
        let cache = Self::default_cache(&config, &memory);
        memory.monitor().add_listener(cache.clone());

        Ok(Self {
            validator: Arc::new(Validator::new()),
            sanitizer: Arc::new(Sanitizer::new()),
            worker,
            cache,
            custom_cache: false,
            errors: Arc::new(ErrorHandler::new(config.errors.clone())),
            metrics: Arc::new(PipelineMetrics::new()),
            observer: Arc::new(NoopObserver),
            permits: Arc::new(Semaphore::new(config.worker.max_concurrency)),
            operations: Mutex::new(Operations::default()),
            memory,
            config,
        })
    }

    fn default_cache(config: &PipelineConfig, memory: &MemoryManager) -> Arc<MultiTierCache<CachedOutcome>> {
        Arc::new(MultiTierCache::in_memory(config.cache.clone()).with_buffers(memory.buffers().clone()))
    }

    pub fn with_cache(mut self, cache: Arc<MultiTierCache<CachedOutcome>>) -> Self {
        self.memory.monitor().add_listener(cache.clone());
        self.cache = cache;
        self.custom_cache = true;
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        if !self.custom_cache {
            self.cache = Self::default_cache(&self.config, &memory);
        }
        memory.monitor().add_listener(self.cache.clone());
        self.memory = memory;
        self
    }

    pub fn with_error_handler(mut self, errors: Arc<ErrorHandler>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = Arc::new(sanitizer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MultiTierCache<CachedOutcome>> {
        &self.cache
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    fn operations(&self) -> MutexGuard<'_, Operations> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one archive through the pipeline.
    pub async fn process_file(&self, input: ArchiveHandle, options: &ProcessOptions) -> ProcessResult {
        let operation_id = Uuid::now_v7().to_string();
        let started = Instant::now();
        self.metrics.operation_started();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.operations().in_flight.insert(
            operation_id.clone(),
            InFlight {
                status: OperationStatus::Queued,
                cancel: cancel_tx,
            },
        );
        log::debug!("{}: queued {} ({} bytes)", operation_id, input.name(), input.size());

        let memory_before = self.memory.current_stats().heap_used as i64;
        let handle = self.memory.pin(&operation_id, input);
        let mut report = StageReport::default();

        let outcome = {
            let stages = self.run_stages(&operation_id, &handle, options, &mut report);
            tokio::select! {
                biased;
                _ = wait_cancelled(cancel_rx) => {
                    let error = Error::Cancelled(format!("operation {} cancelled", operation_id));
                    Err(self.errors.classify(&error, "orchestrator"))
                }
                result = stages => result,
            }
        };

        let memory_delta = self.memory.current_stats().heap_used as i64 - memory_before;
        drop(handle);
        self.memory.release_operation(&operation_id);

        let elapsed = started.elapsed();
        let metrics = OperationMetrics {
            duration_ms: elapsed.as_millis() as u64,
            cache_hit: report.cache_hit,
            memory_delta,
            retries: report.retries,
        };
        self.metrics.retried(report.retries);

        let (success, data, error) = match outcome {
            Ok(presentation) => {
                self.finish(&operation_id, OperationStatus::Completed);
                self.metrics.operation_completed(elapsed);
                (true, Some(presentation), None)
            }
            Err(record) => {
                self.finish(&operation_id, OperationStatus::Failed);
                if record.code == "OPERATION_CANCELLED" {
                    self.metrics.operation_cancelled();
                } else {
                    self.metrics.operation_failed(elapsed);
                }
                self.observer.error(&operation_id, &record);
                (false, None, Some(record))
            }
        };
        log::debug!(
            "{}: {} in {} ms (cache hit: {}, retries: {})",
            operation_id,
            if success { "completed" } else { "failed" },
            metrics.duration_ms,
            metrics.cache_hit,
            metrics.retries
        );

        ProcessResult {
            success,
            operation_id,
            data,
            validation_result: report.validation,
            sanitization_result: report.sanitization,
            metrics,
            error,
        }
    }

    async fn run_stages(
        &self,
        id: &str,
        handle: &Arc<ArchiveHandle>,
        options: &ProcessOptions,
        report: &mut StageReport,
    ) -> std::result::Result<Presentation, ErrorRecord> {
        let params = StageParams {
            timeout: self.config.worker.timeout(),
            batch_size: self.config.worker.batch_size,
        };

        let mut cache_entry = None;
        if options.use_cache {
            self.stage_started(id, Stage::CacheLookup, options);
            match self.memory.archive_digest(id, handle.data()).await {
                Ok(digest) => {
                    let key = derive_key(&digest, &options.fingerprint());
                    if let Some(cached) = self.cache.get(&key).await {
                        self.metrics.cache_hit();
                        report.cache_hit = true;
                        report.validation = cached.validation_result.clone();
                        self.transition(id, OperationStatus::Cached);
                        self.stage_completed(id, Stage::CacheLookup, options);
                        return Ok(cached.presentation.clone());
                    }
                    self.metrics.cache_miss();
                    cache_entry = Some((key, digest));
                }
                Err(e) => {
                    self.metrics.component_result(Component::Cache, false);
                    log::warn!("{}: cache bypassed, digest failed: {}", id, e);
                }
            }
            self.stage_completed(id, Stage::CacheLookup, options);
        }

        if !options.skip_validation {
            self.transition(id, OperationStatus::Validating);
            self.stage_started(id, Stage::Validation, options);
            let validation_options = self
                .config
                .validation
                .clone()
                .with_strict_mode(options.strict_validation);
            let outcome = self
                .errors
                .run_with_recovery("validation", params, |_| {
                    self.validate(Arc::clone(handle), validation_options.clone())
                })
                .await;
            self.metrics.component_result(Component::Validator, outcome.is_ok());
            let validation = report.settle(outcome)?;
            let failure = validation_failure(&validation);
            report.validation = Some(validation);
            self.stage_completed(id, Stage::Validation, options);

            if let (Some(error), true) = (failure, options.strict_validation) {
                return Err(self.errors.classify(&error, "validation"));
            }
        }

        let mut payload = ArchiveHandle::clone(handle);
        if !options.skip_sanitization {
            self.transition(id, OperationStatus::Sanitizing);
            self.stage_started(id, Stage::Sanitization, options);
            let source = &payload;
            let outcome = self
                .errors
                .run_with_recovery("sanitization", params, move |_| {
                    self.sanitize(source.clone(), options.sanitize.clone())
                })
                .await;
            self.metrics.component_result(Component::Sanitizer, outcome.is_ok());
            let sanitized = report.settle(outcome)?;
            payload = sanitized.archive.clone();
            report.sanitization = Some(sanitized);
            self.stage_completed(id, Stage::Sanitization, options);
        }

        self.transition(id, OperationStatus::Processing);
        self.stage_started(id, Stage::Processing, options);
        let worker_options = WorkerOptions {
            extract_text: options.extract_text,
            extract_images: options.extract_images,
            extract_metadata: options.extract_metadata,
            timeout_ms: self.config.worker.timeout_ms,
            batch_size: self.config.worker.batch_size,
        };
        let (payload_ref, base) = (&payload, &worker_options);
        let outcome = self
            .errors
            .run_with_recovery("processing", params, move |p| self.call_worker(payload_ref, base, p))
            .await;
        self.metrics.component_result(Component::Worker, outcome.is_ok());
        let presentation = report.settle(outcome).map_err(|mut record| {
            record.context = format!("processing via {}", self.worker.name());
            record
        })?;
        self.stage_completed(id, Stage::Processing, options);

        if let Some((key, digest)) = cache_entry {
            self.stage_started(id, Stage::CacheStore, options);
            let entry = CachedOutcome {
                presentation: presentation.clone(),
                validation_result: report.validation.clone(),
            };
            let set_options = SetOptions::new()
                .with_priority(Priority::High)
                .with_tag(archive_tag(&digest))
                .with_tag(format!("file:{}", handle.name()));
            match self.cache.set(&key, entry, set_options).await {
                Ok(()) => {
                    self.metrics.component_result(Component::Cache, true);
                    self.transition(id, OperationStatus::Cached);
                }
                Err(e) => {
                    // the result is still good; only the cache write is lost
                    self.metrics.component_result(Component::Cache, false);
                    let record = self.errors.classify(&e, "cache");
                    log::warn!("{}: result not cached: {}", id, record.message);
                }
            }
            self.stage_completed(id, Stage::CacheStore, options);
        }

        Ok(presentation)
    }

    async fn validate(
        &self,
        handle: Arc<ArchiveHandle>,
        options: ppt_core::ValidationOptions,
    ) -> Result<ValidationResult> {
        let validator = Arc::clone(&self.validator);
        tokio::task::spawn_blocking(move || validator.validate(&handle, &options))
            .await
            .map_err(|e| Error::WorkerCrashed(format!("validation task failed: {}", e)))?
    }

    async fn sanitize(&self, archive: ArchiveHandle, options: SanitizeOptions) -> Result<SanitizationResult> {
        let sanitizer = Arc::clone(&self.sanitizer);
        tokio::task::spawn_blocking(move || sanitizer.sanitize(&archive, &options))
            .await
            .map_err(|e| Error::WorkerCrashed(format!("sanitization task failed: {}", e)))?
    }

    /// One bounded, timed worker call with the parameters of this attempt.
    async fn call_worker(
        &self,
        payload: &ArchiveHandle,
        base: &WorkerOptions,
        params: StageParams,
    ) -> Result<Presentation> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::WorkerCrashed("worker pool closed".to_string()))?;
        let _gauge = self.metrics.worker_started();
        let options = WorkerOptions {
            timeout_ms: params.timeout.as_millis() as u64,
            batch_size: params.batch_size,
            ..base.clone()
        };
        match tokio::time::timeout(params.timeout, self.worker.process(payload, &options)).await {
            Ok(result) => result,
            Err(_) => Err(Error::WorkerTimeout(options.timeout_ms)),
        }
    }

    /// Process inputs independently. Fails only when none succeeded.
    pub async fn process_batch(
        &self,
        inputs: Vec<ArchiveHandle>,
        options: &ProcessOptions,
    ) -> std::result::Result<Vec<ProcessResult>, BatchFailed> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let total = inputs.len();
        let results = join_all(inputs.into_iter().map(|input| self.process_file(input, options))).await;
        let (succeeded, failures): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.success);
        log::debug!("batch: {} of {} inputs succeeded", succeeded.len(), total);
        if succeeded.is_empty() {
            return Err(BatchFailed { failures });
        }
        Ok(succeeded)
    }

    /// Ask an in-flight operation to stop. Returns false when the id is not
    /// running.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.operations().in_flight.get(operation_id) {
            Some(op) => {
                log::debug!("{}: cancellation requested", operation_id);
                op.cancel.send(true).is_ok()
            }
            None => false,
        }
    }

    pub fn status(&self, operation_id: &str) -> Option<OperationStatus> {
        let operations = self.operations();
        if let Some(op) = operations.in_flight.get(operation_id) {
            return Some(op.status);
        }
        operations
            .finished
            .iter()
            .rev()
            .find(|(id, _)| id == operation_id)
            .map(|(_, status)| *status)
    }

    pub fn active_operations(&self) -> Vec<String> {
        self.operations().in_flight.keys().cloned().collect()
    }

    fn transition(&self, id: &str, next: OperationStatus) {
        let mut operations = self.operations();
        let Some(op) = operations.in_flight.get_mut(id) else {
            return;
        };
        if op.status.can_transition_to(next) {
            log::debug!("{}: {:?} -> {:?}", id, op.status, next);
            op.status = next;
        } else {
            log::warn!("{}: ignoring transition {:?} -> {:?}", id, op.status, next);
        }
    }

    fn finish(&self, id: &str, status: OperationStatus) {
        self.transition(id, status);
        let mut operations = self.operations();
        if let Some(op) = operations.in_flight.remove(id) {
            while operations.finished.len() >= FINISHED_HISTORY {
                operations.finished.pop_front();
            }
            operations.finished.push_back((id.to_string(), op.status));
        }
    }

    fn stage_started(&self, id: &str, stage: Stage, _options: &ProcessOptions) {
        log::debug!("{}: {} started", id, stage.name());
        self.observer.stage_started(id, stage);
    }

    fn stage_completed(&self, id: &str, stage: Stage, options: &ProcessOptions) {
        self.observer.stage_completed(id, stage);
        if options.enable_progress {
            self.observer.progress(id, stage, stage.percent());
        }
    }

    pub fn health(&self) -> HealthReport {
        let mut forced_down = Vec::new();
        if self.memory.monitor().under_pressure() {
            forced_down.push(Component::Memory);
        }
        if self.permits.is_closed() {
            forced_down.push(Component::Worker);
        }
        self.metrics.health(&forced_down)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Start the cache sweeper, the pressure monitor and the metrics
    /// reporter. They stop when `shutdown` flips to true.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            Arc::clone(&self.cache).spawn_sweeper(shutdown.clone()),
            Arc::clone(self.memory.monitor()).spawn(self.config.memory.sample_interval(), shutdown.clone()),
            Arc::clone(&self.metrics).spawn_reporter(METRICS_REPORT_INTERVAL, shutdown),
        ]
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("worker", &self.worker.name())
            .field("cache", &self.cache)
            .field("memory", &self.memory)
            .finish()
    }
}

async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The error that fails a strict operation, taken from the first validation
/// error.
fn validation_failure(result: &ValidationResult) -> Option<Error> {
    if result.is_valid {
        return None;
    }
    let issue = result.first_error()?;
    let message = match &issue.location {
        Some(location) => format!("{}: {} ({})", issue.code.as_str(), issue.message, location),
        None => format!("{}: {}", issue.code.as_str(), issue.message),
    };
    Some(match issue.code {
        IssueCode::FileTooLarge
        | IssueCode::TooManySlides
        | IssueCode::TooManyImages
        | IssueCode::MediaTooLarge
        | IssueCode::MediaTotalExceeded
        | IssueCode::UncompressedSizeExceeded => Error::SizeExceeded(message),
        _ => Error::StructuralError(message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppt_core::ValidationIssue;

    #[test]
    fn test_status_transitions_are_monotonic() {
        use OperationStatus::*;
        assert!(Queued.can_transition_to(Validating));
        assert!(Queued.can_transition_to(Cached));
        assert!(Validating.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Validating));
        assert!(Sanitizing.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_failed_stage_retries_are_counted() {
        let mut report = StageReport::default();
        assert_eq!(report.settle(Ok(("done", 1))).unwrap(), "done");

        let mut record = ErrorHandler::default().classify(&Error::WorkerCrashed("gone".into()), "sanitization");
        record.retry_count = 3;
        let err = report.settle::<()>(Err(record)).unwrap_err();
        assert_eq!(err.context, "sanitization");
        assert_eq!(report.retries, 4);
    }

    #[test]
    fn test_fingerprint_ignores_cache_and_progress_flags() {
        let base = ProcessOptions::default();
        assert_eq!(
            base.fingerprint(),
            base.clone().with_cache(false).with_progress(true).fingerprint()
        );
        assert_ne!(base.fingerprint(), base.clone().with_skip_sanitization(true).fingerprint());
    }

    #[test]
    fn test_validation_failure_mapping() {
        let mut result = ValidationResult::new();
        result.finalize();
        assert!(validation_failure(&result).is_none());

        result.push(ValidationIssue::error(IssueCode::TooManySlides, "600 slides"));
        result.finalize();
        assert!(matches!(validation_failure(&result), Some(Error::SizeExceeded(_))));

        let mut structural = ValidationResult::new();
        structural.push(ValidationIssue::error(IssueCode::StructuralError, "missing").at("[Content_Types].xml"));
        structural.finalize();
        match validation_failure(&structural) {
            Some(Error::StructuralError(message)) => assert!(message.contains("[Content_Types].xml")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: ProcessOptions = serde_json::from_str(r#"{"useCache": false}"#).unwrap();
        assert!(!options.use_cache);
        assert!(options.strict_validation);
        assert!(options.extract_text);
    }
}
