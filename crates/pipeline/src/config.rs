//! Pipeline configuration.
//!
//! Every field has a default, so a TOML file only needs the values it wants
//! to change:
//!
//! ```toml
//! [cache]
//! default_ttl_ms = 600000
//!
//! [cache.fast]
//! max_items = 50
//!
//! [worker]
//! timeout_ms = 10000
//! max_concurrency = 2
//!
//! [validation]
//! maxSlides = 200
//! ```

use ppt_core::{Error, Result, ValidationOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Item and byte caps for one cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub max_items: usize,
    pub max_bytes: u64,
}

impl TierConfig {
    pub fn new(max_items: usize, max_bytes: u64) -> Self {
        Self { max_items, max_bytes }
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self::new(100, 50 * 1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub fast: TierConfig,
    pub mid: TierConfig,
    pub durable: TierConfig,
    /// TTL applied when a write does not carry one. `None` means no expiry.
    pub default_ttl_ms: Option<u64>,
    pub sweep_interval_ms: u64,
    /// Maximum expired entries removed per tier per sweep tick.
    pub sweep_slice: usize,
    /// Number of per-key lock stripes.
    pub lock_stripes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast: TierConfig::new(100, 50 * 1024 * 1024),
            mid: TierConfig::new(500, 200 * 1024 * 1024),
            durable: TierConfig::new(2_000, 1024 * 1024 * 1024),
            default_ttl_ms: Some(60 * 60 * 1000),
            sweep_interval_ms: 60_000,
            sweep_slice: 64,
            lock_stripes: 16,
        }
    }
}

impl CacheConfig {
    pub fn with_fast(mut self, tier: TierConfig) -> Self {
        self.fast = tier;
        self
    }

    pub fn with_mid(mut self, tier: TierConfig) -> Self {
        self.mid = tier;
        self
    }

    pub fn with_durable(mut self, tier: TierConfig) -> Self {
        self.durable = tier;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl_ms = ttl.map(|d| d.as_millis() as u64);
        self
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Tier limits, fastest first.
    pub fn tiers(&self) -> [TierConfig; 3] {
        [self.fast, self.mid, self.durable]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Buffers kept in the shared buffer pool.
    pub pool_capacity: usize,
    /// Pooled buffers that grew past this capacity are discarded on release.
    pub max_buffer_capacity: usize,
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
    /// Usage ratio above which a sample counts as pressure.
    pub pressure_threshold: f64,
    pub sample_interval_ms: u64,
    /// Consecutive pressure samples before listeners are asked to shrink.
    pub sustained_samples: usize,
    /// Samples kept for trend classification.
    pub trend_window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 32,
            max_buffer_capacity: 8 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            max_concurrent_chunks: 4,
            pressure_threshold: 0.85,
            sample_interval_ms: 5_000,
            sustained_samples: 3,
            trend_window: 10,
        }
    }
}

impl MemoryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    pub max_retries: u32,
    /// Delay before the first retry; attempt `n` waits `n * base_delay_ms`.
    pub base_delay_ms: u64,
    pub history_capacity: usize,
    /// Base wait used by the rate-limit strategy.
    pub rate_limit_wait_ms: u64,
    /// Multiplier applied to the worker timeout on each timeout retry.
    pub timeout_growth: f64,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            history_capacity: 100,
            rate_limit_wait_ms: 5_000,
            timeout_growth: 1.5,
        }
    }
}

impl ErrorConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait_ms = wait.as_millis() as u64;
        self
    }
}

/// The external worker's contract: per-call budget and concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub timeout_ms: u64,
    pub max_concurrency: usize,
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_concurrency: 4,
            batch_size: 50,
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub errors: ErrorConfig,
    pub worker: WorkerConfig,
    pub validation: ValidationOptions,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read '{}': {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_validation(mut self, validation: ValidationOptions) -> Self {
        self.validation = validation;
        self
    }

    /// Reject values the services cannot run with.
    pub fn check(&self) -> Result<()> {
        if self.worker.max_concurrency == 0 {
            return Err(Error::ConfigError("worker.max_concurrency must be at least 1".into()));
        }
        if self.memory.chunk_size == 0 {
            return Err(Error::ConfigError("memory.chunk_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.memory.pressure_threshold) {
            return Err(Error::ConfigError("memory.pressure_threshold must be within 0..=1".into()));
        }
        if self.errors.timeout_growth < 1.0 {
            return Err(Error::ConfigError("errors.timeout_growth must be at least 1.0".into()));
        }
        Ok(())
    }
}
