//! Random-order block scheduling and chunk verification.
//!
//! A fast tick picks a random unfinished chunk and asks the swarm for the next
//! block of it. Arriving blocks are written through the [`ChunkStore`]; once a
//! chunk is fully received it is read back and checked against its SHA-1.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::StorageError;
use crate::events::{DownloadEvent, EventBus};
use crate::peer::{BLOCK_SIZE, BlockRequest};
use crate::storage::ChunkStore;
use crate::swarm::{InboundBlock, LocalChunks, PeerId};
use crate::torrent::{Metadata, Sha1Hash};

pub mod progress;

pub use progress::ChunkProgress;

/// The scheduler's view of the swarm.
#[async_trait]
pub trait BlockRequester: Send + Sync {
    /// Send `request` to some peer able to serve it; `None` if there is none.
    async fn request_block(&self, request: BlockRequest) -> Option<PeerId>;

    /// Record that `peer` contributed to a chunk that failed verification.
    fn penalize(&self, peer: PeerId);

    async fn broadcast_have(&self, index: u32);
}

/// What became of one inbound block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Unknown chunk, already verified, out of range or nothing new.
    Discarded,
    Stored,
    Verified,
    /// The chunk was complete but its hash did not match; progress reset.
    Corrupt,
    /// A transient storage error; the block will be requested again.
    Retry,
    /// The download has been abandoned.
    Failed,
}

pub struct DownloadScheduler {
    metadata: Arc<Metadata>,
    store: Arc<ChunkStore>,
    progress: Arc<ChunkProgress>,
    requester: Arc<dyn BlockRequester>,
    in_flight: Mutex<HashMap<(u32, u32), Instant>>,
    request_interval: Duration,
    request_retries: usize,
    request_timeout: Duration,
    chunk_failure_limit: u32,
    completed: AtomicBool,
    failed: AtomicBool,
    events: EventBus<DownloadEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadScheduler {
    pub fn new(
        metadata: Arc<Metadata>,
        store: Arc<ChunkStore>,
        progress: Arc<ChunkProgress>,
        requester: Arc<dyn BlockRequester>,
        config: &Config,
    ) -> Self {
        Self {
            metadata,
            store,
            progress,
            requester,
            in_flight: Mutex::new(HashMap::new()),
            request_interval: config.request_interval,
            request_retries: config.request_retries,
            request_timeout: config.request_timeout,
            chunk_failure_limit: config.chunk_failure_limit,
            completed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            events: EventBus::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub fn progress(&self) -> &ChunkProgress {
        &self.progress
    }

    /// Completed or failed; no more requests will be issued.
    pub fn is_finished(&self) -> bool {
        self.completed.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst)
    }

    /// Spawn the request tick and the arrival loop.
    pub fn start(self: &Arc<Self>, mut blocks: UnboundedReceiver<InboundBlock>) {
        if self.progress.is_complete() {
            self.complete();
            return;
        }

        let ticker = {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(scheduler.request_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                while !scheduler.is_finished() {
                    interval.tick().await;
                    scheduler.tick().await;
                }
            })
        };
        let arrivals = {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(inbound) = blocks.recv().await {
                    scheduler.handle_block(inbound).await;
                    if scheduler.is_finished() {
                        break;
                    }
                }
            })
        };
        self.tasks.lock().extend([ticker, arrivals]);
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Issue at most one block request, trying up to `request_retries`
    /// distinct random chunks. Returns the peer the request went to.
    pub async fn tick(&self) -> Option<PeerId> {
        if self.is_finished() {
            return None;
        }
        self.expire_requests();

        let mut candidates = self.progress.unverified();
        for _ in 0..self.request_retries {
            if candidates.is_empty() {
                break;
            }
            let pick = rand::thread_rng().gen_range(0..candidates.len());
            let index = candidates.swap_remove(pick);

            let Some(request) = self.next_request(index) else {
                continue;
            };
            if let Some(peer) = self.requester.request_block(request).await {
                self.in_flight
                    .lock()
                    .insert((request.index, request.offset), Instant::now());
                return Some(peer);
            }
        }
        None
    }

    /// The block after chunk `index`'s high-water mark, unless that block is
    /// already in flight or the chunk is fully received.
    fn next_request(&self, index: u32) -> Option<BlockRequest> {
        let len = self.progress.chunk_len(index)?;
        let offset = self.progress.high_water(index);
        if offset >= len || self.in_flight.lock().contains_key(&(index, offset)) {
            return None;
        }
        Some(BlockRequest {
            index,
            offset,
            length: BLOCK_SIZE.min(len - offset),
        })
    }

    fn expire_requests(&self) {
        let timeout = self.request_timeout;
        self.in_flight
            .lock()
            .retain(|_, sent| sent.elapsed() < timeout);
    }

    pub async fn handle_block(&self, inbound: InboundBlock) -> Arrival {
        let InboundBlock { peer, block } = inbound;
        let index = block.index;

        let Some(len) = self.progress.chunk_len(index) else {
            debug!("block for unknown chunk {} from peer {}", index, peer);
            return Arrival::Discarded;
        };
        if self.is_finished() || block.data.is_empty() || block.end() > len as u64 {
            return Arrival::Discarded;
        }

        let Some(_guard) = self.progress.lock(index).await else {
            return Arrival::Discarded;
        };
        if self.progress.is_verified(index) {
            return Arrival::Discarded;
        }
        let high_water = self.progress.high_water(index);
        let end = block.end() as u32;
        // A block past the mark would leave a hole; one below it adds nothing.
        if block.offset > high_water || end <= high_water {
            return Arrival::Discarded;
        }
        self.in_flight.lock().remove(&(index, block.offset));

        if let Err(e) = self.store.write_block(index, block.offset, &block.data).await {
            return self.storage_failure(index, e);
        }
        self.progress.advance(index, end, peer);
        self.events.publish(DownloadEvent::Progress(self.progress.percent()));

        if end < len {
            return Arrival::Stored;
        }
        self.verify(index, len).await
    }

    async fn verify(&self, index: u32, len: u32) -> Arrival {
        let data = match self.store.read_range(index, 0, len as usize).await {
            Ok(data) => data,
            Err(e) if e.is_retryable() => {
                warn!("could not read back chunk {}: {}", index, e);
                self.progress.reset(index);
                return Arrival::Retry;
            }
            Err(e) => return self.storage_failure(index, e),
        };

        let expected = self.metadata.chunk_hashes[index as usize];
        let actual: Sha1Hash = Sha1::digest(&data).into();
        if actual != expected {
            return self.reject(index);
        }

        self.progress.mark_verified(index);
        debug!(
            "chunk {} verified ({}/{})",
            index,
            self.progress.verified_count(),
            self.progress.chunk_count()
        );
        self.events.publish(DownloadEvent::ChunkVerified(index));
        self.requester.broadcast_have(index).await;

        if self.progress.is_complete() {
            self.complete();
        }
        Arrival::Verified
    }

    fn reject(&self, index: u32) -> Arrival {
        let contributors = self.progress.reset(index);
        let failures = self.progress.record_failure(index);
        warn!(
            "chunk {} failed verification ({} of {} allowed)",
            index, failures, self.chunk_failure_limit
        );
        for peer in contributors {
            self.requester.penalize(peer);
        }
        self.events.publish(DownloadEvent::Progress(self.progress.percent()));

        if failures >= self.chunk_failure_limit {
            self.fail(format!("chunk {index} failed verification {failures} times"));
            return Arrival::Failed;
        }
        Arrival::Corrupt
    }

    fn storage_failure(&self, index: u32, e: StorageError) -> Arrival {
        if e.is_retryable() {
            warn!("storage error on chunk {}, will retry: {}", index, e);
            return Arrival::Retry;
        }
        self.fail(e.to_string());
        Arrival::Failed
    }

    fn complete(&self) {
        if !self.completed.swap(true, Ordering::SeqCst) {
            info!("download complete");
            self.events.publish(DownloadEvent::Progress(self.progress.percent()));
            self.events.publish(DownloadEvent::Completed);
        }
    }

    fn fail(&self, reason: String) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            error!("download failed: {}", reason);
            self.events.publish(DownloadEvent::Failed(reason));
        }
    }
}
