//! Failure classification and recovery.
//!
//! Every failure becomes an [`ErrorRecord`] with a kind from a closed set.
//! Typed [`ppt_core::Error`] variants map directly; anything else is matched
//! against an ordered pattern table, first match wins. Retryable kinds carry
//! exactly one [`RecoveryStrategy`], which adjusts the stage parameters
//! before the next attempt.

use chrono::{DateTime, Utc};
use ppt_core::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::ErrorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    ArchiveCorrupted,
    StructuralInvalid,
    SizeExceeded,
    WorkerTimeout,
    WorkerCrashed,
    MemoryExceeded,
    NetworkError,
    RateLimited,
    UnsupportedResource,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// How a retryable failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    /// Grow the stage timeout by the configured factor.
    IncreaseTimeout,
    /// Retry with unchanged parameters.
    RetryAsIs,
    /// Halve the batch size; gives up once it reaches one.
    ReduceBatch,
    /// Retry after a linearly growing delay.
    LinearBackoff,
    /// Wait the rate-limit interval, then retry.
    WaitAndRetry,
}

impl RecoveryStrategy {
    pub fn id(&self) -> &'static str {
        match self {
            RecoveryStrategy::IncreaseTimeout => "increase-timeout",
            RecoveryStrategy::RetryAsIs => "retry-as-is",
            RecoveryStrategy::ReduceBatch => "reduce-batch",
            RecoveryStrategy::LinearBackoff => "linear-backoff",
            RecoveryStrategy::WaitAndRetry => "wait-and-retry",
        }
    }

    /// Adjust parameters for the next attempt. `false` means retrying cannot help.
    pub fn adjust(&self, params: &mut StageParams, config: &ErrorConfig) -> bool {
        match self {
            RecoveryStrategy::IncreaseTimeout => {
                params.timeout = params.timeout.mul_f64(config.timeout_growth);
                true
            }
            RecoveryStrategy::ReduceBatch => {
                if params.batch_size <= 1 {
                    return false;
                }
                params.batch_size = (params.batch_size / 2).max(1);
                true
            }
            RecoveryStrategy::RetryAsIs | RecoveryStrategy::LinearBackoff | RecoveryStrategy::WaitAndRetry => true,
        }
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32, config: &ErrorConfig) -> Duration {
        let base = match self {
            RecoveryStrategy::WaitAndRetry => config.rate_limit_wait_ms,
            _ => config.base_delay_ms,
        };
        Duration::from_millis(base.saturating_mul(attempt as u64))
    }
}

impl ErrorKind {
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::ArchiveCorrupted => Severity::High,
            ErrorKind::StructuralInvalid => Severity::Medium,
            ErrorKind::SizeExceeded => Severity::Medium,
            ErrorKind::WorkerTimeout => Severity::Medium,
            ErrorKind::WorkerCrashed => Severity::High,
            ErrorKind::MemoryExceeded => Severity::Critical,
            ErrorKind::NetworkError => Severity::Medium,
            ErrorKind::RateLimited => Severity::Low,
            ErrorKind::UnsupportedResource => Severity::Low,
            ErrorKind::Unknown => Severity::Medium,
        }
    }

    /// The registered strategy, if the kind is retryable.
    pub fn strategy(&self) -> Option<RecoveryStrategy> {
        match self {
            ErrorKind::WorkerTimeout => Some(RecoveryStrategy::IncreaseTimeout),
            ErrorKind::WorkerCrashed => Some(RecoveryStrategy::RetryAsIs),
            ErrorKind::MemoryExceeded => Some(RecoveryStrategy::ReduceBatch),
            ErrorKind::NetworkError => Some(RecoveryStrategy::LinearBackoff),
            ErrorKind::RateLimited => Some(RecoveryStrategy::WaitAndRetry),
            ErrorKind::ArchiveCorrupted
            | ErrorKind::StructuralInvalid
            | ErrorKind::SizeExceeded
            | ErrorKind::UnsupportedResource
            | ErrorKind::Unknown => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.strategy().is_some()
    }

    /// Stable user-facing code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ArchiveCorrupted => "ARCHIVE_CORRUPTED",
            ErrorKind::StructuralInvalid => "STRUCTURAL_INVALID",
            ErrorKind::SizeExceeded => "SIZE_EXCEEDED",
            ErrorKind::WorkerTimeout => "WORKER_TIMEOUT",
            ErrorKind::WorkerCrashed => "WORKER_CRASHED",
            ErrorKind::MemoryExceeded => "MEMORY_EXCEEDED",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::UnsupportedResource => "UNSUPPORTED_RESOURCE",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

/// Message patterns in evaluation order.
static CLASSIFIERS: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    [
        (ErrorKind::ArchiveCorrupted, r"(?i)corrupt|invalid (?:zip|archive)|central directory|bad zip"),
        (ErrorKind::SizeExceeded, r"(?i)too large|size (?:limit )?exceeded|exceeds .*limit|inflates beyond"),
        (ErrorKind::StructuralInvalid, r"(?i)structur|missing required|malformed|not well-formed"),
        (ErrorKind::MemoryExceeded, r"(?i)out of memory|memory (?:limit|exceeded)|allocation failed|heap limit"),
        (ErrorKind::WorkerTimeout, r"(?i)timed? ?out|deadline exceeded"),
        (ErrorKind::RateLimited, r"(?i)rate.?limit|too many requests|\b429\b"),
        (ErrorKind::NetworkError, r"(?i)network|connection (?:refused|reset|closed)|econn|dns|socket"),
        (ErrorKind::WorkerCrashed, r"(?i)worker (?:crashed|terminated|died)|panicked|exited unexpectedly"),
        (ErrorKind::UnsupportedResource, r"(?i)unsupported|not supported|unknown format"),
    ]
    .into_iter()
    .map(|(kind, re)| (kind, Regex::new(re).expect("static classifier must compile")))
    .collect()
});

/// Classify a bare message. Deterministic for a given input.
pub fn classify_message(message: &str) -> ErrorKind {
    CLASSIFIERS
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// Classify a typed error, falling back to the message table.
pub fn classify_error(error: &Error) -> ErrorKind {
    match error {
        Error::ArchiveCorrupted(_) | Error::ZipError(_) => ErrorKind::ArchiveCorrupted,
        Error::StructuralError(_) | Error::XmlError(_) => ErrorKind::StructuralInvalid,
        Error::SizeExceeded(_) => ErrorKind::SizeExceeded,
        Error::WorkerTimeout(_) => ErrorKind::WorkerTimeout,
        Error::WorkerCrashed(_) => ErrorKind::WorkerCrashed,
        Error::MemoryExceeded(_) => ErrorKind::MemoryExceeded,
        Error::NetworkError(_) => ErrorKind::NetworkError,
        Error::RateLimited(_) => ErrorKind::RateLimited,
        Error::UnsupportedResource(_) => ErrorKind::UnsupportedResource,
        Error::Cancelled(_) => ErrorKind::Unknown,
        Error::IoError(_) | Error::CacheError(_) | Error::ConfigError(_) => classify_message(&error.to_string()),
    }
}

/// A normalized failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub code: String,
    /// Where the failure happened, e.g. `"validation"`.
    pub context: String,
    pub retryable: bool,
    pub recovery_strategy_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Retries spent before the failure was surfaced.
    pub retry_count: u32,
}

impl ErrorRecord {
    fn build(kind: ErrorKind, message: String, context: &str, timestamp: DateTime<Utc>) -> Self {
        let strategy = kind.strategy();
        Self {
            kind,
            severity: kind.severity(),
            message,
            code: kind.code().to_string(),
            context: context.to_string(),
            retryable: strategy.is_some(),
            recovery_strategy_id: strategy.map(|s| s.id().to_string()),
            timestamp,
            retry_count: 0,
        }
    }

    pub fn strategy(&self) -> Option<RecoveryStrategy> {
        if self.retryable {
            self.kind.strategy()
        } else {
            None
        }
    }
}

/// Parameters a recovery strategy may adjust between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageParams {
    pub timeout: Duration,
    pub batch_size: usize,
}

/// What a recovery attempt achieved.
#[derive(Debug)]
pub struct RecoveryOutcome<T> {
    pub success: bool,
    pub strategy_used: Option<RecoveryStrategy>,
    pub retry_count: u32,
    pub value: Option<T>,
    /// The last failure seen, when recovery did not succeed.
    pub last_error: Option<ErrorRecord>,
    /// Parameters of the final attempt.
    pub params: StageParams,
}

/// Aggregates over the rolling history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStats {
    pub total: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub recent: Vec<ErrorRecord>,
}

/// Classifies failures, keeps a bounded history and drives retries.
#[derive(Debug)]
pub struct ErrorHandler {
    config: ErrorConfig,
    clock: Arc<dyn Clock>,
    history: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorHandler {
    pub fn new(config: ErrorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ErrorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &ErrorConfig {
        &self.config
    }

    /// Normalize a typed error and record it.
    pub fn classify(&self, error: &Error, context: &str) -> ErrorRecord {
        let kind = classify_error(error);
        let mut record = ErrorRecord::build(kind, error.to_string(), context, self.clock.now());
        if matches!(error, Error::Cancelled(_)) {
            record.code = "OPERATION_CANCELLED".to_string();
        }
        self.record(record.clone());
        record
    }

    /// Normalize a raw message and record it.
    pub fn classify_message(&self, message: &str, context: &str) -> ErrorRecord {
        let record = ErrorRecord::build(classify_message(message), message.to_string(), context, self.clock.now());
        self.record(record.clone());
        record
    }

    fn record(&self, record: ErrorRecord) {
        log::debug!(
            "[{}] {} ({:?}, retryable: {}): {}",
            record.context,
            record.code,
            record.severity,
            record.retryable,
            record.message
        );
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.config.history_capacity.max(1) {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Counts by kind and severity over the rolling history, newest last.
    pub fn stats(&self) -> ErrorStats {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = ErrorStats {
            total: history.len(),
            ..ErrorStats::default()
        };
        for record in history.iter() {
            *stats.by_kind.entry(record.kind).or_default() += 1;
            *stats.by_severity.entry(record.severity).or_default() += 1;
        }
        stats.recent = history.iter().cloned().collect();
        stats
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Retry `op` after `record` using the kind's strategy.
    ///
    /// Attempts stop at `max_retries`, when a strategy reports it cannot
    /// help, or when a retry fails with a non-retryable error. Attempt `n`
    /// waits `n` times the strategy's base delay first.
    pub async fn attempt_recovery<T, F, Fut>(
        &self,
        record: &ErrorRecord,
        mut params: StageParams,
        mut op: F,
    ) -> RecoveryOutcome<T>
    where
        F: FnMut(StageParams) -> Fut,
        Fut: Future<Output = ppt_core::Result<T>>,
    {
        let mut last = record.clone();
        let mut strategy_used = None;
        let mut retry_count = 0;

        while retry_count < self.config.max_retries {
            let Some(strategy) = last.strategy() else {
                break;
            };
            if !strategy.adjust(&mut params, &self.config) {
                log::debug!("[{}] {} cannot adjust further", last.context, strategy.id());
                break;
            }
            retry_count += 1;
            strategy_used = Some(strategy);

            let delay = strategy.delay(retry_count, &self.config);
            log::debug!(
                "[{}] retry {} of {} via {} after {:?} (timeout {:?}, batch {})",
                last.context,
                retry_count,
                self.config.max_retries,
                strategy.id(),
                delay,
                params.timeout,
                params.batch_size
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match op(params).await {
                Ok(value) => {
                    return RecoveryOutcome {
                        success: true,
                        strategy_used,
                        retry_count,
                        value: Some(value),
                        last_error: None,
                        params,
                    }
                }
                Err(e) => last = self.classify(&e, &record.context),
            }
        }

        last.retry_count = retry_count;
        RecoveryOutcome {
            success: false,
            strategy_used,
            retry_count,
            value: None,
            last_error: Some(last),
            params,
        }
    }

    /// Run `op` once and, on failure, recover through the registered strategy.
    ///
    /// Returns the value with the number of retries spent, or the surfaced
    /// record carrying that count.
    pub async fn run_with_recovery<T, F, Fut>(
        &self,
        context: &str,
        params: StageParams,
        mut op: F,
    ) -> std::result::Result<(T, u32), ErrorRecord>
    where
        F: FnMut(StageParams) -> Fut,
        Fut: Future<Output = ppt_core::Result<T>>,
    {
        let first = match op(params).await {
            Ok(value) => return Ok((value, 0)),
            Err(e) => self.classify(&e, context),
        };
        if !first.retryable {
            return Err(first);
        }

        let outcome = self.attempt_recovery(&first, params, op).await;
        match outcome.value {
            Some(value) => Ok((value, outcome.retry_count)),
            None => Err(outcome.last_error.unwrap_or(first)),
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(ErrorConfig::default())
    }
}
