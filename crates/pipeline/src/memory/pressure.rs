//! Heap sampling, trend classification and pressure notifications.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// One memory reading, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapSample {
    pub used: u64,
    pub total: u64,
    pub limit: u64,
}

impl HeapSample {
    pub fn usage_ratio(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.used as f64 / self.limit as f64
        }
    }
}

/// Source of memory readings.
pub trait HeapProbe: Send + Sync {
    fn sample(&self) -> HeapSample;
}

/// System memory as reported by the OS.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapProbe for SystemProbe {
    fn sample(&self) -> HeapSample {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        let total = system.total_memory();
        HeapSample {
            used: system.used_memory(),
            total,
            limit: total,
        }
    }
}

/// Bytes explicitly accounted by the pipeline against a fixed limit.
#[derive(Debug)]
pub struct AccountingProbe {
    used: AtomicU64,
    limit: u64,
}

impl AccountingProbe {
    pub fn new(limit: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
        }
    }

    pub fn add(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn sub(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(bytes)));
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

impl HeapProbe for AccountingProbe {
    fn sample(&self) -> HeapSample {
        HeapSample {
            used: self.used(),
            total: self.limit,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

/// The outcome of one sampling tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureReading {
    pub sample: HeapSample,
    pub pressure: bool,
    pub trend: Trend,
}

/// Receives shrink requests when pressure is sustained.
#[async_trait]
pub trait PressureListener: Send + Sync {
    async fn on_pressure(&self, reading: &PressureReading);
}

/// Relative change across the window that counts as a trend.
const TREND_EPSILON: f64 = 0.01;

/// Samples a [`HeapProbe`] and notifies listeners after `sustained`
/// consecutive readings above `threshold`.
pub struct PressureMonitor {
    probe: Arc<dyn HeapProbe>,
    threshold: f64,
    sustained: usize,
    window: usize,
    samples: Mutex<VecDeque<HeapSample>>,
    consecutive: AtomicUsize,
    under_pressure: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn PressureListener>>>,
}

impl PressureMonitor {
    pub fn new(probe: Arc<dyn HeapProbe>, threshold: f64, sustained: usize, window: usize) -> Self {
        Self {
            probe,
            threshold,
            sustained: sustained.max(1),
            window: window.max(2),
            samples: Mutex::new(VecDeque::new()),
            consecutive: AtomicUsize::new(0),
            under_pressure: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PressureListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Latest reading without taking a new sample.
    pub fn latest(&self) -> Option<HeapSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .copied()
    }

    /// Read the probe now, bypassing the sample window.
    pub fn probe_now(&self) -> HeapSample {
        self.probe.sample()
    }

    pub fn under_pressure(&self) -> bool {
        self.under_pressure.load(Ordering::SeqCst)
    }

    /// Classify the sample window: compares the oldest and newest reading
    /// relative to the limit.
    pub fn trend(&self) -> Trend {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        classify_trend(samples.iter())
    }

    /// Take one sample, update the window and notify listeners if the
    /// pressure has been sustained.
    pub async fn sample_now(&self) -> PressureReading {
        let sample = self.probe.sample();
        let trend = {
            let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            samples.push_back(sample);
            while samples.len() > self.window {
                samples.pop_front();
            }
            classify_trend(samples.iter())
        };

        let pressure = sample.usage_ratio() > self.threshold;
        let reading = PressureReading {
            sample,
            pressure,
            trend,
        };

        let was = self.under_pressure.swap(pressure, Ordering::SeqCst);
        if was != pressure {
            log::debug!(
                "memory pressure {} ({:.1}% of {} bytes, {:?})",
                if pressure { "entered" } else { "cleared" },
                sample.usage_ratio() * 100.0,
                sample.limit,
                trend
            );
        }

        if !pressure {
            self.consecutive.store(0, Ordering::SeqCst);
            return reading;
        }

        let streak = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if streak >= self.sustained {
            self.consecutive.store(0, Ordering::SeqCst);
            let listeners: Vec<Arc<dyn PressureListener>> = self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            log::debug!("sustained memory pressure, notifying {} listeners", listeners.len());
            for listener in listeners {
                listener.on_pressure(&reading).await;
            }
        }
        reading
    }

    /// Sample on a fixed interval until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
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
                        self.sample_now().await;
                    }
                }
            }
            log::debug!("pressure monitor stopped");
        })
    }
}

fn classify_trend<'a>(mut samples: impl DoubleEndedIterator<Item = &'a HeapSample>) -> Trend {
    let (Some(first), Some(last)) = (samples.next(), samples.next_back()) else {
        return Trend::Stable;
    };
    let scale = last.limit.max(first.limit).max(1) as f64;
    let delta = (last.used as f64 - first.used as f64) / scale;
    if delta > TREND_EPSILON {
        Trend::Increasing
    } else if delta < -TREND_EPSILON {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}
