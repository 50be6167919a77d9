//! Memory management: pooled buffers, chunked streaming, weak tracking of
//! pinned archives and pressure monitoring.
//!
//! Resources taken on behalf of an operation are recorded under its id and
//! released together by [`MemoryManager::release_operation`], whether the
//! operation completed, failed or was cancelled.

pub mod pool;
pub mod pressure;
pub mod stream;
pub mod weak;

pub use pool::{BufferPool, ObjectPool, PoolError, PoolStats, Pooled};
pub use pressure::{
    AccountingProbe, HeapProbe, HeapSample, PressureListener, PressureMonitor, PressureReading, SystemProbe, Trend,
};
pub use stream::StreamProcessor;
pub use weak::WeakRegistry;

use bytes::Bytes;
use ppt_core::{ArchiveHandle, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::MemoryConfig;

/// Point-in-time view of memory state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub heap_used: u64,
    pub heap_total: u64,
    pub heap_limit: u64,
    pub pooled_object_count: usize,
    /// Pool buffers currently held by operations.
    pub leased_buffer_count: usize,
    pub active_stream_chunk_count: usize,
    pub pinned_handle_count: usize,
    pub pressure: bool,
    pub trend: Trend,
}

/// Resources held for one operation.
#[derive(Default)]
struct OperationResources {
    pinned: Vec<Arc<ArchiveHandle>>,
    buffers: Vec<Pooled<Vec<u8>>>,
}

/// What [`MemoryManager::release_operation`] gave back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Released {
    pub handles: usize,
    pub buffers: usize,
    pub bytes: u64,
}

pub struct MemoryManager {
    buffers: BufferPool,
    streams: StreamProcessor,
    pinned: WeakRegistry<ArchiveHandle>,
    monitor: Arc<PressureMonitor>,
    accounting: Option<Arc<AccountingProbe>>,
    operations: Mutex<HashMap<String, OperationResources>>,
    pin_seq: AtomicU64,
    config: MemoryConfig,
}

impl MemoryManager {
    /// A manager sampling system memory.
    pub fn new(config: MemoryConfig) -> Self {
        Self::build(config, Arc::new(SystemProbe::new()), None)
    }

    /// A manager whose pressure is measured by the bytes it pins, against
    /// `limit`.
    pub fn accounted(config: MemoryConfig, limit: u64) -> Self {
        let probe = Arc::new(AccountingProbe::new(limit));
        Self::build(config, probe.clone(), Some(probe))
    }

    /// A manager sampling a custom probe.
    pub fn with_probe(config: MemoryConfig, probe: Arc<dyn HeapProbe>) -> Self {
        Self::build(config, probe, None)
    }

    fn build(config: MemoryConfig, probe: Arc<dyn HeapProbe>, accounting: Option<Arc<AccountingProbe>>) -> Self {
        let buffers = BufferPool::new(config.pool_capacity, 0, config.max_buffer_capacity);
        let monitor = Arc::new(PressureMonitor::new(
            probe,
            config.pressure_threshold,
            config.sustained_samples,
            config.trend_window,
        ));
        monitor.add_listener(Arc::new(buffers.clone()));

        Self {
            streams: StreamProcessor::new(config.chunk_size, config.max_concurrent_chunks),
            buffers,
            pinned: WeakRegistry::new(),
            monitor,
            accounting,
            operations: Mutex::new(HashMap::new()),
            pin_seq: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn streams(&self) -> &StreamProcessor {
        &self.streams
    }

    pub fn monitor(&self) -> &Arc<PressureMonitor> {
        &self.monitor
    }

    fn operations(&self) -> std::sync::MutexGuard<'_, HashMap<String, OperationResources>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold `handle` for `operation_id` until the operation is released.
    pub fn pin(&self, operation_id: &str, handle: ArchiveHandle) -> Arc<ArchiveHandle> {
        let handle = Arc::new(handle);
        let bytes = handle.size() as u64;
        if let Some(accounting) = &self.accounting {
            accounting.add(bytes);
        }

        let accounting = self.accounting.clone();
        let seq = self.pin_seq.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}/{}#{}", operation_id, handle.name(), seq);
        let log_label = label.clone();
        self.pinned.register(label, &handle, move || {
            if let Some(accounting) = accounting {
                accounting.sub(bytes);
            }
            log::debug!("released pinned archive {} ({} bytes)", log_label, bytes);
        });

        self.operations()
            .entry(operation_id.to_string())
            .or_default()
            .pinned
            .push(Arc::clone(&handle));
        handle
    }

    /// Take a pooled buffer owned by `operation_id` and hand it to `fill`.
    /// The buffer goes back to the pool when the operation is released.
    pub fn lease_buffer<R>(&self, operation_id: &str, fill: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut buffer = self.buffers.acquire();
        let out = fill(&mut *buffer);
        self.operations()
            .entry(operation_id.to_string())
            .or_default()
            .buffers
            .push(buffer);
        out
    }

    /// Content digest of an archive for `operation_id`: SHA-256 over the
    /// per-chunk digests and the total length. The chunk digests are staged
    /// in a buffer leased to the operation.
    pub async fn archive_digest(&self, operation_id: &str, data: Bytes) -> Result<String> {
        let len = data.len() as u64;
        let chunks = self.streams.chunk_digests(data).await?;
        Ok(self.lease_buffer(operation_id, |manifest| {
            for digest in &chunks {
                manifest.extend_from_slice(digest);
            }
            manifest.extend_from_slice(&len.to_le_bytes());
            hex::encode(Sha256::digest(&manifest[..]))
        }))
    }

    /// Release everything recorded for `operation_id`.
    pub fn release_operation(&self, operation_id: &str) -> Released {
        let Some(resources) = self.operations().remove(operation_id) else {
            return Released::default();
        };
        let released = Released {
            handles: resources.pinned.len(),
            buffers: resources.buffers.len(),
            bytes: resources.pinned.iter().map(|h| h.size() as u64).sum(),
        };
        drop(resources);
        // cleanup callbacks run for every archive of this operation
        self.pinned.cleanup_prefix(&format!("{}/", operation_id));
        log::debug!(
            "operation {} released {} handles, {} buffers",
            operation_id,
            released.handles,
            released.buffers
        );
        released
    }

    /// Operations currently holding resources.
    pub fn tracked_operations(&self) -> usize {
        self.operations().len()
    }

    pub fn stats(&self) -> MemoryStats {
        let sample = self.monitor.latest().unwrap_or_else(|| self.monitor.probe_now());
        self.stats_from(sample)
    }

    /// Stats from a fresh probe reading rather than the last monitor tick.
    pub fn current_stats(&self) -> MemoryStats {
        self.stats_from(self.monitor.probe_now())
    }

    fn stats_from(&self, sample: HeapSample) -> MemoryStats {
        MemoryStats {
            heap_used: sample.used,
            heap_total: sample.total,
            heap_limit: sample.limit,
            pooled_object_count: self.buffers.len(),
            leased_buffer_count: self.operations().values().map(|r| r.buffers.len()).sum(),
            active_stream_chunk_count: self.streams.active_chunks(),
            pinned_handle_count: self.pinned.len(),
            pressure: sample.usage_ratio() > self.config.pressure_threshold,
            trend: self.monitor.trend(),
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("buffers", &self.buffers)
            .field("streams", &self.streams)
            .field("pinned", &self.pinned)
            .finish()
    }
}
