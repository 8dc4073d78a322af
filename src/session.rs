//! One torrent download from start to finish.
//!
//! A [`Session`] owns the store, the swarm and the scheduler for a torrent,
//! keeps the trackers informed and merges everything the caller may want to
//! observe into a single [`DownloadEvent`] stream.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{DownloadEvent, EventBus};
use crate::peer::BLOCK_SIZE;
use crate::scheduler::{BlockRequester, ChunkProgress, DownloadScheduler};
use crate::storage::ChunkStore;
use crate::swarm::{InboundRequest, LocalChunks, PeerStateChange, SwarmCoordinator};
use crate::torrent::Metadata;
use crate::tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};

pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

struct Inner {
    metadata: Arc<Metadata>,
    config: Config,
    store: Arc<ChunkStore>,
    progress: Arc<ChunkProgress>,
    swarm: Arc<SwarmCoordinator>,
    scheduler: Arc<DownloadScheduler>,
    tracker: TrackerClient,
    uploaded: AtomicU64,
    started: AtomicBool,
    events: EventBus<DownloadEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(metadata: Metadata, config: Config) -> Result<Self> {
        config.validate()?;

        let metadata = Arc::new(metadata);
        let store = Arc::new(ChunkStore::new(&config.download_dir, &metadata));
        let progress = Arc::new(ChunkProgress::new(&metadata));
        let swarm = Arc::new(SwarmCoordinator::new(
            config.clone(),
            metadata.info_hash,
            metadata.chunk_count(),
            Arc::clone(&progress) as Arc<dyn LocalChunks>,
        ));
        let scheduler = Arc::new(DownloadScheduler::new(
            Arc::clone(&metadata),
            Arc::clone(&store),
            Arc::clone(&progress),
            Arc::clone(&swarm) as Arc<dyn BlockRequester>,
            &config,
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                metadata,
                config,
                store,
                progress,
                swarm,
                scheduler,
                tracker: TrackerClient::new(),
                uploaded: AtomicU64::new(0),
                started: AtomicBool::new(false),
                events: EventBus::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    pub fn subscribe(&self) -> UnboundedReceiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Percentage downloaded, 0 to 100.
    pub fn progress(&self) -> f64 {
        self.inner.progress.percent()
    }

    /// Queue a peer for admission. Works before and after the download
    /// starts.
    pub fn add_peer(&self, ip: IpAddr, port: u16) -> bool {
        self.inner.swarm.add_peer(SocketAddr::new(ip, port))
    }

    /// Allocate the files, announce to every tracker and start exchanging
    /// blocks.
    ///
    /// Fails with [`Error::NoPeers`] when no tracker produced a peer and none
    /// were added by hand, unless there is nothing to download.
    pub async fn start_download(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        inner.store.allocate().await?;

        let responses = inner.announce_all(AnnounceEvent::Started).await;
        for peer in responses.iter().flat_map(|r| &r.peers) {
            inner.swarm.add_peer((*peer).into());
        }
        if inner.swarm.pending_count() == 0 && !inner.progress.is_complete() {
            inner.started.store(false, Ordering::SeqCst);
            return Err(Error::NoPeers);
        }
        info!(
            "starting {} ({} chunks, {} bytes) with {} queued peers",
            inner.metadata.name,
            inner.metadata.chunk_count(),
            inner.metadata.total_size,
            inner.swarm.pending_count()
        );

        let blocks = inner.swarm.subscribe_blocks();
        let mut tasks = vec![
            tokio::spawn(Inner::forward_peer_states(
                Arc::clone(inner),
                inner.swarm.subscribe_states(),
            )),
            tokio::spawn(Inner::forward_download_events(
                Arc::clone(inner),
                inner.scheduler.subscribe(),
            )),
            tokio::spawn(Inner::serve_requests(
                Arc::clone(inner),
                inner.swarm.subscribe_requests(),
            )),
        ];
        if !inner.metadata.trackers.is_empty() {
            let period = reannounce_period(&responses, inner.config.max_announce_interval);
            tasks.push(tokio::spawn(Inner::reannounce(Arc::clone(inner), period)));
        }
        inner.tasks.lock().extend(tasks);

        inner.swarm.start();
        inner.scheduler.start(blocks);
        Ok(())
    }

    /// Stop all activity, close every peer and tell the trackers we left.
    pub async fn stop(&self) {
        let inner = &self.inner;
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        inner.scheduler.stop();
        inner.swarm.stop();

        if inner.started.swap(false, Ordering::SeqCst) {
            inner.announce_all(AnnounceEvent::Stopped).await;
        }
        info!("session for {} stopped", inner.metadata.name);
    }
}

impl Inner {
    fn announce_request(&self, event: AnnounceEvent) -> AnnounceRequest {
        let downloaded = self.progress.downloaded();
        AnnounceRequest {
            info_hash: self.metadata.info_hash,
            peer_id: self.config.peer_id,
            port: self.config.listen_port,
            uploaded: self.uploaded.load(Ordering::SeqCst),
            downloaded,
            left: self.metadata.total_size.saturating_sub(downloaded),
            event,
            compact: true,
        }
    }

    /// Announce to every tracker. Failures are logged and skipped.
    async fn announce_all(&self, event: AnnounceEvent) -> Vec<AnnounceResponse> {
        let request = self.announce_request(event);
        let mut responses = Vec::new();
        for announce in &self.metadata.trackers {
            match self.tracker.announce(announce, &request).await {
                Ok(response) => responses.push(response),
                Err(e) => warn!("announce to {} failed: {}", announce, e),
            }
        }
        responses
    }

    async fn reannounce(inner: Arc<Inner>, mut period: Duration) {
        loop {
            tokio::time::sleep(period).await;
            let responses = inner.announce_all(AnnounceEvent::Regular).await;
            for peer in responses.iter().flat_map(|r| &r.peers) {
                inner.swarm.add_peer((*peer).into());
            }
            if !responses.is_empty() {
                period = reannounce_period(&responses, inner.config.max_announce_interval);
            }
        }
    }

    async fn forward_peer_states(
        inner: Arc<Inner>,
        mut states: UnboundedReceiver<PeerStateChange>,
    ) {
        while let Some(change) = states.recv().await {
            inner.events.publish(DownloadEvent::PeerState {
                peer: change.peer,
                addr: change.addr,
                status: change.status,
            });
        }
    }

    async fn forward_download_events(
        inner: Arc<Inner>,
        mut events: UnboundedReceiver<DownloadEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let completed = event == DownloadEvent::Completed;
            inner.events.publish(event);
            if completed {
                inner.announce_all(AnnounceEvent::Completed).await;
            }
        }
    }

    /// Answer block requests for verified chunks from peers we unchoked.
    async fn serve_requests(inner: Arc<Inner>, mut requests: UnboundedReceiver<InboundRequest>) {
        while let Some(InboundRequest { peer, request }) = requests.recv().await {
            let Some(len) = inner.progress.chunk_len(request.index) else {
                continue;
            };
            let valid = request.length > 0
                && request.length <= BLOCK_SIZE
                && request.offset as u64 + request.length as u64 <= len as u64;
            if !valid || !inner.progress.is_verified(request.index) {
                debug!("ignoring request {:?} from peer {}", request, peer);
                continue;
            }

            let data = match inner
                .store
                .read_range(request.index, request.offset, request.length as usize)
                .await
            {
                Ok(data) => data,
                Err(e) => {
                    warn!("cannot serve chunk {}: {}", request.index, e);
                    continue;
                }
            };
            if inner
                .swarm
                .serve_block(peer, request.index, request.offset, data.into())
                .await
            {
                inner
                    .uploaded
                    .fetch_add(request.length as u64, Ordering::SeqCst);
            }
        }
    }
}

/// The smallest interval any tracker asked for, capped at `max`.
fn reannounce_period(responses: &[AnnounceResponse], max: Duration) -> Duration {
    responses
        .iter()
        .map(|r| r.interval)
        .filter(|i| !i.is_zero())
        .min()
        .map_or(max, |i| i.min(max))
}
