use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::MutexGuard;

use crate::swarm::{LocalChunks, PeerId};
use crate::torrent::Metadata;

struct ChunkState {
    len: u32,
    /// Bytes received contiguously from the chunk's start.
    high_water: AtomicU32,
    verified: AtomicBool,
    failures: AtomicU32,
    contributors: Mutex<HashSet<PeerId>>,
    /// Serializes arrivals for this chunk.
    arrival: tokio::sync::Mutex<()>,
}

/// Download state of every chunk, plus the running byte total.
pub struct ChunkProgress {
    chunks: Vec<ChunkState>,
    total_size: u64,
    downloaded: AtomicU64,
    verified: AtomicUsize,
}

impl ChunkProgress {
    pub fn new(metadata: &Metadata) -> Self {
        let chunks = (0..metadata.chunk_count() as u32)
            .map(|index| ChunkState {
                len: metadata.chunk_len(index),
                high_water: AtomicU32::new(0),
                verified: AtomicBool::new(false),
                failures: AtomicU32::new(0),
                contributors: Mutex::new(HashSet::new()),
                arrival: tokio::sync::Mutex::new(()),
            })
            .collect();

        Self {
            chunks,
            total_size: metadata.total_size,
            downloaded: AtomicU64::new(0),
            verified: AtomicUsize::new(0),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_len(&self, index: u32) -> Option<u32> {
        self.chunk(index).map(|c| c.len)
    }

    pub fn high_water(&self, index: u32) -> u32 {
        self.chunk(index)
            .map_or(0, |c| c.high_water.load(Ordering::SeqCst))
    }

    pub fn failures(&self, index: u32) -> u32 {
        self.chunk(index).map_or(0, |c| c.failures.load(Ordering::SeqCst))
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    pub fn verified_count(&self) -> usize {
        self.verified.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.chunks.len()
    }

    /// Percentage of the content downloaded, in `[0, 100]`. An empty torrent
    /// is complete.
    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        let percent = self.downloaded() as f64 / self.total_size as f64 * 100.0;
        percent.clamp(0.0, 100.0)
    }

    pub fn unverified(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.verified.load(Ordering::SeqCst))
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Hold while handling an arrival for chunk `index`.
    pub async fn lock(&self, index: u32) -> Option<MutexGuard<'_, ()>> {
        match self.chunk(index) {
            Some(chunk) => Some(chunk.arrival.lock().await),
            None => None,
        }
    }

    /// Move the high-water mark to `end` if that is further, returning the
    /// bytes gained.
    pub fn advance(&self, index: u32, end: u32, peer: PeerId) -> u32 {
        let Some(chunk) = self.chunk(index) else {
            return 0;
        };
        chunk.contributors.lock().insert(peer);

        let previous = chunk.high_water.fetch_max(end, Ordering::SeqCst);
        let gained = end.saturating_sub(previous);
        self.downloaded.fetch_add(gained as u64, Ordering::SeqCst);
        gained
    }

    /// Forget everything received for chunk `index` and return the peers that
    /// sent it.
    pub fn reset(&self, index: u32) -> Vec<PeerId> {
        let Some(chunk) = self.chunk(index) else {
            return Vec::new();
        };
        let previous = chunk.high_water.swap(0, Ordering::SeqCst);
        self.downloaded.fetch_sub(previous as u64, Ordering::SeqCst);
        chunk.contributors.lock().drain().collect()
    }

    /// Returns the chunk's failure count after this one.
    pub fn record_failure(&self, index: u32) -> u32 {
        self.chunk(index)
            .map_or(0, |c| c.failures.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Returns `false` if the chunk was already verified.
    pub fn mark_verified(&self, index: u32) -> bool {
        let Some(chunk) = self.chunk(index) else {
            return false;
        };
        if chunk.verified.swap(true, Ordering::SeqCst) {
            return false;
        }
        chunk.contributors.lock().clear();
        self.verified.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn chunk(&self, index: u32) -> Option<&ChunkState> {
        self.chunks.get(index as usize)
    }
}

impl LocalChunks for ChunkProgress {
    fn is_verified(&self, index: u32) -> bool {
        self.chunk(index)
            .is_some_and(|c| c.verified.load(Ordering::SeqCst))
    }
}
