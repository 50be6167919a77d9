//! Operation counters, latency figures and component health.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Consecutive failures after which a component is reported down.
pub const DOWN_AFTER_FAILURES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Component {
    Validator,
    Sanitizer,
    Cache,
    Memory,
    Worker,
    ErrorHandler,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::Validator,
        Component::Sanitizer,
        Component::Cache,
        Component::Memory,
        Component::Worker,
        Component::ErrorHandler,
    ];

    fn slot(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub consecutive_failures: usize,
}

/// Per-component up/down view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub components: BTreeMap<Component, ComponentHealth>,
}

impl HealthReport {
    pub fn status(&self, component: Component) -> Option<ComponentStatus> {
        self.components.get(&component).map(|c| c.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub operations_started: u64,
    pub operations_completed: u64,
    pub operations_failed: u64,
    pub operations_cancelled: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub retries: u64,
    pub active_workers: usize,
    pub average_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

/// Lock-free counters shared by every operation of one orchestrator.
#[derive(Debug)]
pub struct PipelineMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    active_workers: AtomicUsize,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    latency_min_ms: AtomicU64,
    latency_max_ms: AtomicU64,
    failures: [AtomicUsize; 6],
    last_snapshot: Mutex<Option<MetricsSnapshot>>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            latency_sum_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_min_ms: AtomicU64::new(u64::MAX),
            latency_max_ms: AtomicU64::new(0),
            failures: Default::default(),
            last_snapshot: Mutex::new(None),
        }
    }
}

/// Counts one in-flight worker call until dropped.
#[derive(Debug)]
pub struct WorkerGauge<'a> {
    active: &'a AtomicUsize,
}

impl Drop for WorkerGauge<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_completed(&self, elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(elapsed);
    }

    pub fn operation_failed(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(elapsed);
    }

    pub fn operation_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self, attempts: u32) {
        self.retries.fetch_add(attempts as u64, Ordering::Relaxed);
    }

    pub fn worker_started(&self) -> WorkerGauge<'_> {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        WorkerGauge {
            active: &self.active_workers,
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    fn record_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.latency_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_min_ms.fetch_min(ms, Ordering::Relaxed);
        self.latency_max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Record the outcome of a component call. Success resets its streak.
    pub fn component_result(&self, component: Component, ok: bool) {
        let slot = &self.failures[component.slot()];
        if ok {
            slot.store(0, Ordering::Relaxed);
        } else {
            let streak = slot.fetch_add(1, Ordering::Relaxed) + 1;
            if streak == DOWN_AFTER_FAILURES {
                log::warn!("{:?} reported down after {} consecutive failures", component, streak);
            }
        }
    }

    /// Health from failure streaks; components in `forced_down` are reported
    /// down regardless.
    pub fn health(&self, forced_down: &[Component]) -> HealthReport {
        let components: BTreeMap<Component, ComponentHealth> = Component::ALL
            .iter()
            .map(|&component| {
                let consecutive_failures = self.failures[component.slot()].load(Ordering::Relaxed);
                let down = consecutive_failures >= DOWN_AFTER_FAILURES || forced_down.contains(&component);
                let status = if down { ComponentStatus::Down } else { ComponentStatus::Up };
                (
                    component,
                    ComponentHealth {
                        status,
                        consecutive_failures,
                    },
                )
            })
            .collect();
        HealthReport {
            healthy: components.values().all(|c| c.status == ComponentStatus::Up),
            components,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let count = self.latency_count.load(Ordering::Relaxed);
        let sum = self.latency_sum_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            taken_at: Utc::now(),
            operations_started: self.started.load(Ordering::Relaxed),
            operations_completed: self.completed.load(Ordering::Relaxed),
            operations_failed: self.failed.load(Ordering::Relaxed),
            operations_cancelled: self.cancelled.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            retries: self.retries.load(Ordering::Relaxed),
            active_workers: self.active_workers(),
            average_latency_ms: if count == 0 { 0.0 } else { sum as f64 / count as f64 },
            min_latency_ms: if count == 0 {
                0
            } else {
                self.latency_min_ms.load(Ordering::Relaxed)
            },
            max_latency_ms: self.latency_max_ms.load(Ordering::Relaxed),
        }
    }

    /// The snapshot taken by the most recent reporter tick.
    pub fn last_snapshot(&self) -> Option<MetricsSnapshot> {
        self.last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot and log on a fixed interval until `shutdown` flips to true.
    pub fn spawn_reporter(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let snapshot = self.snapshot();
                        log::debug!(
                            "pipeline: {} started, {} completed, {} failed, hit rate {:.2}, avg {:.1} ms, {} active workers",
                            snapshot.operations_started,
                            snapshot.operations_completed,
                            snapshot.operations_failed,
                            snapshot.cache_hit_rate,
                            snapshot.average_latency_ms,
                            snapshot.active_workers
                        );
                        *self.last_snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
                    }
                }
            }
        })
    }
}
