//! Object pools with reset-on-release.

use async_trait::async_trait;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use super::pressure::{PressureListener, PressureReading};

#[derive(Debug, Error)]
pub enum PoolError {
    /// The reset callback refused the object; it will not be reused.
    #[error("reset failed: {0}")]
    ResetFailed(String),

    /// A buffer grew beyond what the pool is willing to retain.
    #[error("buffer capacity {capacity} exceeds retention cap {cap}")]
    Oversized { capacity: usize, cap: usize },
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) -> Result<(), PoolError> + Send + Sync>;

struct PoolInner<T> {
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    reset: Reset<T>,
    capacity: usize,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// Counters describing pool behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub capacity: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

/// A capped pool. `acquire` never blocks: an empty pool builds a new object.
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool").field("stats", &self.stats()).finish()
    }
}

impl<T> ObjectPool<T> {
    pub fn new(
        capacity: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) -> Result<(), PoolError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(capacity)),
                factory: Box::new(factory),
                reset: Box::new(reset),
                capacity,
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an object, returned to the pool when the guard drops.
    pub fn acquire(&self) -> Pooled<T> {
        let reused = self.idle().pop();
        let value = match reused {
            Some(value) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                (self.inner.factory)()
            }
        };
        Pooled {
            value: Some(value),
            pool: self.clone(),
        }
    }

    /// Reset and return an object. Returns whether it was kept.
    pub fn release(&self, mut value: T) -> bool {
        if let Err(e) = (self.inner.reset)(&mut value) {
            log::debug!("discarding pooled object: {}", e);
            self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let mut idle = self.idle();
        if idle.len() >= self.inner.capacity {
            self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        idle.push(value);
        true
    }

    pub fn len(&self) -> usize {
        self.idle().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Drop a fraction of the idle objects. Returns how many were dropped.
    pub fn shrink(&self, fraction: f64) -> usize {
        let mut idle = self.idle();
        let count = (((idle.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize).min(idle.len());
        let keep = idle.len() - count;
        idle.truncate(keep);
        count
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.len(),
            capacity: self.inner.capacity,
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Scope guard for a pooled object.
pub struct Pooled<T> {
    value: Option<T>,
    pool: ObjectPool<T>,
}

impl<T> Pooled<T> {
    /// Keep the object; it will not go back to the pool.
    pub fn detach(mut self) -> T {
        self.value.take().expect("pooled value present until drop")
    }

    /// Return the object now rather than at scope exit.
    pub fn release(self) {}
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}

/// Pool of byte buffers. Buffers are cleared on release; ones that grew past
/// `max_retained_capacity` are dropped instead of pooled.
#[derive(Debug, Clone)]
pub struct BufferPool {
    pool: ObjectPool<Vec<u8>>,
}

impl BufferPool {
    pub fn new(capacity: usize, initial_size: usize, max_retained_capacity: usize) -> Self {
        let pool = ObjectPool::new(
            capacity,
            move || Vec::with_capacity(initial_size),
            move |buf: &mut Vec<u8>| {
                if buf.capacity() > max_retained_capacity {
                    return Err(PoolError::Oversized {
                        capacity: buf.capacity(),
                        cap: max_retained_capacity,
                    });
                }
                buf.clear();
                Ok(())
            },
        );
        Self { pool }
    }

    pub fn acquire(&self) -> Pooled<Vec<u8>> {
        self.pool.acquire()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn shrink(&self, fraction: f64) -> usize {
        self.pool.shrink(fraction)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[async_trait]
impl PressureListener for BufferPool {
    async fn on_pressure(&self, reading: &PressureReading) {
        let dropped = self.shrink(0.5);
        log::debug!(
            "buffer pool shrank by {} under pressure ({:.0}% used)",
            dropped,
            reading.sample.usage_ratio() * 100.0
        );
    }
}
