//! Chunked processing of large buffers with bounded concurrency.

use bytes::Bytes;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use ppt_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Splits buffers into fixed-size chunks and runs at most
/// `max_concurrent` chunk futures at a time.
#[derive(Debug, Clone)]
pub struct StreamProcessor {
    chunk_size: usize,
    max_concurrent: usize,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Counts a chunk as in flight for as long as it lives.
struct ChunkGuard {
    active: Arc<AtomicUsize>,
}

impl ChunkGuard {
    fn enter(active: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            active: Arc::clone(active),
        }
    }
}

impl Drop for ChunkGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StreamProcessor {
    pub fn new(chunk_size: usize, max_concurrent: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_concurrent: max_concurrent.max(1),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Zero-copy views of `data`, each at most `chunk_size` long.
    pub fn chunks(&self, data: &Bytes) -> Vec<Bytes> {
        (0..data.len())
            .step_by(self.chunk_size)
            .map(|start| data.slice(start..(start + self.chunk_size).min(data.len())))
            .collect()
    }

    /// Run `f` over every chunk, at most `max_concurrent` at once. Results
    /// come back in chunk order; the first error stops the run.
    pub async fn process<F, Fut, R>(&self, data: Bytes, mut f: F) -> Result<Vec<R>>
    where
        F: FnMut(usize, Bytes) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let active = Arc::clone(&self.active);
        let peak = Arc::clone(&self.peak);

        stream::iter(self.chunks(&data).into_iter().enumerate())
            .map(|(index, chunk)| {
                let guard = ChunkGuard::enter(&active, &peak);
                let fut = f(index, chunk);
                async move {
                    let out = fut.await;
                    drop(guard);
                    out
                }
            })
            .buffered(self.max_concurrent)
            .try_collect()
            .await
    }

    /// SHA-256 of every chunk, in chunk order, hashed on the blocking pool.
    pub async fn chunk_digests(&self, data: Bytes) -> Result<Vec<[u8; 32]>> {
        self.process(data, |_, chunk| async move {
            tokio::task::spawn_blocking(move || -> [u8; 32] { Sha256::digest(&chunk).into() })
                .await
                .map_err(|e| Error::WorkerCrashed(format!("digest task failed: {}", e)))
        })
        .await
    }

    /// Chunks currently in flight.
    pub fn active_chunks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of chunks seen in flight at once.
    pub fn peak_chunks(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_chunks_are_views() {
        let processor = StreamProcessor::new(4, 2);
        let data = Bytes::from_static(b"abcdefghij");
        let chunks = processor.chunks(&data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[2][..], b"ij");
        assert!(processor.chunks(&Bytes::new()).is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let processor = StreamProcessor::new(8, 3);
        let data = Bytes::from(vec![7u8; 8 * 40]);

        let sums = processor
            .process(data, |index, chunk| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok((index, chunk.iter().map(|b| *b as u64).sum::<u64>()))
            })
            .await
            .unwrap();

        assert_eq!(sums.len(), 40);
        assert!(sums.iter().enumerate().all(|(i, (index, sum))| i == *index && *sum == 56));
        assert!(processor.peak_chunks() <= 3);
        assert_eq!(processor.active_chunks(), 0);
    }

    #[tokio::test]
    async fn test_first_error_stops() {
        let processor = StreamProcessor::new(1, 2);
        let result = processor
            .process(Bytes::from_static(b"abc"), |index, _| async move {
                if index == 1 {
                    Err(ppt_core::Error::MemoryExceeded("chunk".into()))
                } else {
                    Ok(index)
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(processor.active_chunks(), 0);
    }

    #[tokio::test]
    async fn test_chunk_digests_follow_chunk_order() {
        let processor = StreamProcessor::new(3, 4);
        let data = Bytes::from_static(b"the quick brown fox");
        let digests = processor.chunk_digests(data.clone()).await.unwrap();

        assert_eq!(digests.len(), 7);
        let expected: Vec<[u8; 32]> = processor
            .chunks(&data)
            .iter()
            .map(|chunk| Sha256::digest(chunk).into())
            .collect();
        assert_eq!(digests, expected);
        assert_eq!(processor.active_chunks(), 0);
        assert!(processor.peak_chunks() >= 1);
    }
}
