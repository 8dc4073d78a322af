//! Peer admission, choking and request routing for one torrent.
//!
//! The coordinator owns every [`PeerConnection`] of the session. Addresses
//! are queued with [`SwarmCoordinator::add_peer`] and dialed on the admission
//! tick while the table is below the connection limit. Each admitted peer gets
//! an event task that applies the choke and interest policies and republishes
//! blocks, requests and state changes on the coordinator's buses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::PeerError;
use crate::events::EventBus;
use crate::peer::{
    Bitfield, BlockData, BlockRequest, ConnectionState, PeerConnection, PeerEvent, PeerStatus,
};
use crate::scheduler::BlockRequester;
use crate::torrent::Sha1Hash;

/// Session-unique handle of an admitted peer. Never reused.
pub type PeerId = u64;

/// What we hold locally, consulted by the interest policy.
pub trait LocalChunks: Send + Sync {
    fn is_verified(&self, index: u32) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundBlock {
    pub peer: PeerId,
    pub block: BlockData,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InboundRequest {
    pub peer: PeerId,
    pub request: BlockRequest,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerStateChange {
    pub peer: PeerId,
    pub addr: SocketAddr,
    pub status: PeerStatus,
}

/// Point-in-time view of one peer's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub status: PeerStatus,
    pub am_choking: bool,
    pub am_interested: bool,
    pub strikes: u32,
}

struct PeerEntry {
    addr: SocketAddr,
    /// `None` while the dial is in flight; the entry still holds the slot.
    conn: Option<Arc<PeerConnection>>,
    status: PeerStatus,
    chunks: Bitfield,
    am_choking: bool,
    am_interested: bool,
    strikes: u32,
    task: Option<JoinHandle<()>>,
}

impl PeerEntry {
    fn new(addr: SocketAddr, chunk_count: usize) -> Self {
        Self {
            addr,
            conn: None,
            status: PeerStatus::default(),
            chunks: Bitfield::from_piece_count(chunk_count),
            am_choking: true,
            am_interested: false,
            strikes: 0,
            task: None,
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            addr: self.addr,
            status: self.status,
            am_choking: self.am_choking,
            am_interested: self.am_interested,
            strikes: self.strikes,
        }
    }
}

pub struct SwarmCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    info_hash: Sha1Hash,
    chunk_count: usize,
    local: Arc<dyn LocalChunks>,
    next_id: AtomicU64,
    pending: Mutex<VecDeque<SocketAddr>>,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    unchoked: AtomicUsize,
    banned: Mutex<HashSet<SocketAddr>>,
    blocks: EventBus<InboundBlock>,
    requests: EventBus<InboundRequest>,
    states: EventBus<PeerStateChange>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl SwarmCoordinator {
    pub fn new(
        config: Config,
        info_hash: Sha1Hash,
        chunk_count: usize,
        local: Arc<dyn LocalChunks>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                info_hash,
                chunk_count,
                local,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(VecDeque::new()),
                peers: RwLock::new(HashMap::new()),
                unchoked: AtomicUsize::new(0),
                banned: Mutex::new(HashSet::new()),
                blocks: EventBus::new(),
                requests: EventBus::new(),
                states: EventBus::new(),
                timers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe_blocks(&self) -> UnboundedReceiver<InboundBlock> {
        self.inner.blocks.subscribe()
    }

    pub fn subscribe_requests(&self) -> UnboundedReceiver<InboundRequest> {
        self.inner.requests.subscribe()
    }

    pub fn subscribe_states(&self) -> UnboundedReceiver<PeerStateChange> {
        self.inner.states.subscribe()
    }

    /// Queue an address for admission. Returns `false` if it is banned,
    /// already queued or already in the peer table.
    pub fn add_peer(&self, addr: SocketAddr) -> bool {
        if self.inner.banned.lock().contains(&addr) {
            debug!("ignoring banned peer {}", addr);
            return false;
        }
        if self.inner.peers.read().values().any(|e| e.addr == addr) {
            return false;
        }

        let mut pending = self.inner.pending.lock();
        if pending.contains(&addr) {
            return false;
        }
        pending.push_back(addr);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Peers holding a slot, including dials still in flight.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    pub fn unchoked_count(&self) -> usize {
        self.inner.unchoked.load(Ordering::SeqCst)
    }

    pub fn peer(&self, id: PeerId) -> Option<PeerSnapshot> {
        self.inner.peers.read().get(&id).map(PeerEntry::snapshot)
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.inner.banned.lock().contains(addr)
    }

    /// Dial queued addresses until the table is full or the queue is empty.
    /// Dials run in the background; the returned ids already hold slots.
    pub fn admit_pending(&self) -> Vec<PeerId> {
        let mut admitted = Vec::new();
        loop {
            let (id, addr) = {
                let mut peers = self.inner.peers.write();
                if peers.len() >= self.inner.config.connection_limit {
                    break;
                }
                let Some(addr) = self.inner.pending.lock().pop_front() else {
                    break;
                };
                let id = self.inner.next_id();
                peers.insert(id, PeerEntry::new(addr, self.inner.chunk_count));
                (id, addr)
            };

            debug!("admitting peer {} ({})", id, addr);
            tokio::spawn(Inner::dial(Arc::clone(&self.inner), id, addr));
            admitted.push(id);
        }
        admitted
    }

    /// Adopt an already-connected stream as a peer, bypassing the queue but
    /// not the connection limit.
    pub async fn attach<S>(&self, addr: SocketAddr, stream: S) -> Result<PeerId, PeerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = {
            let mut peers = self.inner.peers.write();
            if peers.len() >= self.inner.config.connection_limit
                || self.inner.banned.lock().contains(&addr)
            {
                return Err(PeerError::NotConnected);
            }
            let id = self.inner.next_id();
            peers.insert(id, PeerEntry::new(addr, self.inner.chunk_count));
            id
        };

        let conn = Arc::new(self.inner.connection(addr));
        let events = conn.subscribe();
        if let Err(e) = conn.attach(stream) {
            self.inner.evict(id);
            return Err(e);
        }
        Inner::register(&self.inner, id, conn, events).await;
        Ok(id)
    }

    /// Forward a block request to a random peer that can serve it.
    pub async fn request_block(&self, request: BlockRequest) -> Option<PeerId> {
        let (id, conn) = {
            let peers = self.inner.peers.read();
            let candidates: Vec<_> = peers
                .iter()
                .filter(|(_, e)| {
                    e.status.state == ConnectionState::Established
                        && !e.status.peer_choking
                        && e.chunks.has_piece(request.index as usize)
                })
                .filter_map(|(id, e)| e.conn.as_ref().map(|c| (*id, Arc::clone(c))))
                .collect();
            candidates.choose(&mut rand::thread_rng()).cloned()?
        };

        match conn.send_request(request).await {
            Ok(()) => Some(id),
            Err(e) => {
                debug!("request to peer {} failed: {}", id, e);
                None
            }
        }
    }

    /// Announce a verified chunk to every established peer. The sends run
    /// concurrently so one slow reader does not hold up the rest.
    pub async fn broadcast_have(&self, index: u32) {
        let mut sends = JoinSet::new();
        for (id, conn) in self.inner.established() {
            sends.spawn(async move { (id, conn.send_have(index).await) });
        }
        while let Some(joined) = sends.join_next().await {
            if let Ok((id, Err(e))) = joined {
                debug!("have to peer {} failed: {}", id, e);
            }
        }
    }

    /// Send a block to a peer we are not choking. Returns whether it went out.
    pub async fn serve_block(&self, peer: PeerId, index: u32, offset: u32, data: Bytes) -> bool {
        let conn = {
            let peers = self.inner.peers.read();
            match peers.get(&peer) {
                Some(entry) if !entry.am_choking => entry.conn.clone(),
                _ => None,
            }
        };
        let Some(conn) = conn else {
            return false;
        };

        let block = BlockData {
            index,
            offset,
            data,
        };
        conn.send_piece(block).await.is_ok()
    }

    /// Record a verification strike against `peer`; at the strike limit the
    /// peer is disconnected and its address banned for the session.
    pub fn penalize(&self, peer: PeerId) {
        let banned = {
            let mut peers = self.inner.peers.write();
            let Some(entry) = peers.get_mut(&peer) else {
                return;
            };
            entry.strikes += 1;
            if entry.strikes < self.inner.config.strike_limit {
                debug!("peer {} has {} strikes", peer, entry.strikes);
                return;
            }
            (entry.addr, entry.conn.clone())
        };

        let (addr, conn) = banned;
        warn!("banning peer {} ({}) after repeated bad data", peer, addr);
        self.inner.banned.lock().insert(addr);
        match conn {
            Some(conn) => conn.close(),
            None => self.inner.evict(peer),
        }
    }

    pub async fn send_keep_alives(&self) {
        let connected: Vec<_> = {
            let peers = self.inner.peers.read();
            peers
                .iter()
                .filter(|(_, e)| e.status.is_connected())
                .filter_map(|(id, e)| e.conn.as_ref().map(|c| (*id, Arc::clone(c))))
                .collect()
        };
        let mut sends = JoinSet::new();
        for (id, conn) in connected {
            sends.spawn(async move { (id, conn.send_keep_alive().await) });
        }
        while let Some(joined) = sends.join_next().await {
            if let Ok((id, Err(e))) = joined {
                debug!("keep-alive to peer {} failed: {}", id, e);
            }
        }
    }

    /// Close connections that went silent or never finished the handshake.
    pub fn supervise(&self) {
        let stale: Vec<_> = {
            let peers = self.inner.peers.read();
            peers
                .iter()
                .filter_map(|(id, e)| e.conn.as_ref().map(|c| (*id, Arc::clone(c))))
                .filter(|(_, conn)| self.inner.is_stale(conn))
                .collect()
        };
        for (id, conn) in stale {
            info!("closing unresponsive peer {} ({})", id, conn.addr());
            conn.close();
        }
    }

    /// Spawn the admission and keep-alive ticks.
    pub fn start(&self) {
        let admission = {
            let coordinator = self.handle();
            let period = self.inner.config.admission_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    coordinator.supervise();
                    coordinator.admit_pending();
                }
            })
        };
        let keep_alive = {
            let coordinator = self.handle();
            let period = self.inner.config.keep_alive_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(
                    tokio::time::Instant::now() + period,
                    period,
                );
                loop {
                    interval.tick().await;
                    coordinator.send_keep_alives().await;
                }
            })
        };
        self.inner.timers.lock().extend([admission, keep_alive]);
    }

    /// Stop the ticks and drop every peer.
    pub fn stop(&self) {
        for timer in self.inner.timers.lock().drain(..) {
            timer.abort();
        }
        self.inner.pending.lock().clear();

        let entries: Vec<_> = self.inner.peers.write().drain().collect();
        self.inner.unchoked.store(0, Ordering::SeqCst);
        for (_, entry) in entries {
            if let Some(task) = entry.task {
                task.abort();
            }
            if let Some(conn) = entry.conn {
                conn.close();
            }
        }
    }

    fn handle(&self) -> SwarmCoordinator {
        SwarmCoordinator {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl BlockRequester for SwarmCoordinator {
    async fn request_block(&self, request: BlockRequest) -> Option<PeerId> {
        SwarmCoordinator::request_block(self, request).await
    }

    fn penalize(&self, peer: PeerId) {
        SwarmCoordinator::penalize(self, peer)
    }

    async fn broadcast_have(&self, index: u32) {
        SwarmCoordinator::broadcast_have(self, index).await
    }
}

impl Inner {
    fn next_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn connection(&self, addr: SocketAddr) -> PeerConnection {
        PeerConnection::new(addr, self.info_hash, self.config.peer_id)
            .with_write_timeout(self.config.write_timeout)
    }

    async fn dial(inner: Arc<Inner>, id: PeerId, addr: SocketAddr) {
        let conn = Arc::new(inner.connection(addr));
        let events = conn.subscribe();

        if let Err(e) = conn.connect(inner.config.connect_timeout).await {
            debug!("dropping peer {}: {}", addr, e);
            inner.evict(id);
            inner.states.publish(PeerStateChange {
                peer: id,
                addr,
                status: conn.status(),
            });
            return;
        }
        Inner::register(&inner, id, conn, events).await;
    }

    /// Bind a live connection to its reserved slot, start its event task and
    /// send our handshake.
    async fn register(
        inner: &Arc<Inner>,
        id: PeerId,
        conn: Arc<PeerConnection>,
        events: UnboundedReceiver<PeerEvent>,
    ) {
        {
            let mut peers = inner.peers.write();
            let Some(entry) = peers.get_mut(&id) else {
                // stopped while dialing
                conn.close();
                return;
            };
            entry.conn = Some(Arc::clone(&conn));
            entry.task = Some(tokio::spawn(Inner::peer_events(
                Arc::clone(inner),
                id,
                conn.addr(),
                events,
            )));
        }

        if let Err(e) = conn.send_handshake().await {
            debug!("handshake to {} failed: {}", conn.addr(), e);
        }
    }

    async fn peer_events(
        inner: Arc<Inner>,
        id: PeerId,
        addr: SocketAddr,
        mut events: UnboundedReceiver<PeerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::State(status) => {
                    inner.states.publish(PeerStateChange {
                        peer: id,
                        addr,
                        status,
                    });
                    if status.state == ConnectionState::Disconnected {
                        debug!("peer {} ({}) disconnected", id, addr);
                        inner.evict(id);
                        return;
                    }
                    inner.on_status(id, status).await;
                }
                PeerEvent::Have(index) => {
                    let news = inner.learn(id, |chunks| {
                        chunks.set_piece(index as usize);
                        vec![index]
                    });
                    inner.maybe_interested(id, &news).await;
                }
                PeerEvent::Bitfield(bits) => {
                    let count = inner.chunk_count;
                    let news = inner.learn(id, |chunks| {
                        *chunks = bits;
                        chunks.pieces(count).map(|i| i as u32).collect()
                    });
                    inner.maybe_interested(id, &news).await;
                }
                PeerEvent::Request(request) => {
                    inner.requests.publish(InboundRequest { peer: id, request });
                }
                PeerEvent::Piece(block) => {
                    inner.blocks.publish(InboundBlock { peer: id, block });
                }
            }
        }
    }

    /// Remove a peer's bookkeeping and release its unchoke slot.
    fn evict(&self, id: PeerId) {
        let entry = self.peers.write().remove(&id);
        if let Some(entry) = entry {
            if !entry.am_choking {
                self.unchoked.fetch_sub(1, Ordering::SeqCst);
            }
            if let Some(conn) = entry.conn {
                conn.close();
            }
        }
    }

    fn is_stale(&self, conn: &PeerConnection) -> bool {
        match conn.status().state {
            ConnectionState::HandshakePending => {
                conn.in_state_for() >= self.config.handshake_timeout
            }
            ConnectionState::Established => conn.idle_for() >= self.config.idle_timeout,
            _ => false,
        }
    }

    fn established(&self) -> Vec<(PeerId, Arc<PeerConnection>)> {
        let peers = self.peers.read();
        peers
            .iter()
            .filter(|(_, e)| e.status.state == ConnectionState::Established)
            .filter_map(|(id, e)| e.conn.as_ref().map(|c| (*id, Arc::clone(c))))
            .collect()
    }

    /// Reactive choke policy: unchoke interested peers while below the
    /// unchoke limit, choke peers that lose interest.
    async fn on_status(&self, id: PeerId, status: PeerStatus) {
        let action = {
            let mut peers = self.peers.write();
            let Some(entry) = peers.get_mut(&id) else {
                return;
            };
            entry.status = status;
            let Some(conn) = entry.conn.clone() else {
                return;
            };

            if status.peer_interested && entry.am_choking {
                if self.unchoked.load(Ordering::SeqCst) >= self.config.unchoke_limit {
                    debug!("unchoke limit reached, peer {} stays choked", id);
                    None
                } else {
                    entry.am_choking = false;
                    self.unchoked.fetch_add(1, Ordering::SeqCst);
                    Some((conn, true))
                }
            } else if !status.peer_interested && !entry.am_choking {
                entry.am_choking = true;
                self.unchoked.fetch_sub(1, Ordering::SeqCst);
                Some((conn, false))
            } else {
                None
            }
        };

        let result = match action {
            Some((conn, true)) => conn.send_unchoke().await,
            Some((conn, false)) => conn.send_choke().await,
            None => Ok(()),
        };
        if let Err(e) = result {
            debug!("choke update for peer {} failed: {}", id, e);
        }
    }

    /// Apply `update` to the peer's chunk map and return the chunks it names.
    fn learn(&self, id: PeerId, update: impl FnOnce(&mut Bitfield) -> Vec<u32>) -> Vec<u32> {
        let mut peers = self.peers.write();
        match peers.get_mut(&id) {
            Some(entry) => update(&mut entry.chunks),
            None => Vec::new(),
        }
    }

    /// Send `interested` once, the first time a choking peer turns out to hold
    /// something we still need.
    async fn maybe_interested(&self, id: PeerId, chunks: &[u32]) {
        let needed = chunks
            .iter()
            .any(|&i| (i as usize) < self.chunk_count && !self.local.is_verified(i));
        if !needed {
            return;
        }

        let conn = {
            let mut peers = self.peers.write();
            let Some(entry) = peers.get_mut(&id) else {
                return;
            };
            if entry.am_interested || !entry.status.peer_choking {
                return;
            }
            entry.am_interested = true;
            entry.conn.clone()
        };

        if let Some(conn) = conn {
            if let Err(e) = conn.send_interested().await {
                debug!("interested to peer {} failed: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Message;
    use crate::peer::handshake::Handshake;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    const INFO_HASH: Sha1Hash = [5u8; 20];

    struct Verified(Vec<u32>);

    impl LocalChunks for Verified {
        fn is_verified(&self, index: u32) -> bool {
            self.0.contains(&index)
        }
    }

    fn coordinator(config: Config) -> SwarmCoordinator {
        SwarmCoordinator::new(config, INFO_HASH, 4, Arc::new(Verified(vec![])))
    }

    fn fake_addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Attach a duplex peer that has answered our handshake.
    async fn attach_remote(swarm: &SwarmCoordinator, n: u8) -> (PeerId, DuplexStream) {
        attach_remote_with_capacity(swarm, n, 64 * 1024).await
    }

    async fn attach_remote_with_capacity(
        swarm: &SwarmCoordinator,
        n: u8,
        capacity: usize,
    ) -> (PeerId, DuplexStream) {
        let (local, mut remote) = tokio::io::duplex(capacity);
        let id = swarm.attach(fake_addr(n), local).await.unwrap();

        let mut ours = [0u8; 68];
        remote.read_exact(&mut ours).await.unwrap();
        assert_eq!(Handshake::deserialize(&ours).unwrap().info_hash, INFO_HASH);

        remote
            .write_all(&Handshake::new(INFO_HASH, [n; 20]).serialize())
            .await
            .unwrap();
        eventually("established", || {
            swarm.peer(id).map(|p| p.status.state) == Some(ConnectionState::Established)
        })
        .await;
        (id, remote)
    }

    async fn send(remote: &mut DuplexStream, message: Message) {
        remote.write_all(&message.serialize()).await.unwrap();
    }

    async fn expect_message(remote: &mut DuplexStream) -> Message {
        let mut len = [0u8; 4];
        remote.read_exact(&mut len).await.unwrap();
        let mut frame = len.to_vec();
        frame.resize(4 + u32::from_be_bytes(len) as usize, 0);
        remote.read_exact(&mut frame[4..]).await.unwrap();
        Message::deserialize(&frame).unwrap()
    }

    async fn expect_silence(remote: &mut DuplexStream) {
        let mut byte = [0u8; 1];
        assert!(
            timeout(Duration::from_millis(100), remote.read(&mut byte))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_add_peer_deduplicates() {
        let swarm = coordinator(Config::default());
        assert!(swarm.add_peer(fake_addr(1)));
        assert!(!swarm.add_peer(fake_addr(1)));
        assert!(swarm.add_peer(fake_addr(2)));
        assert_eq!(swarm.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_connection_limit_admits_in_order() {
        let mut listeners = Vec::new();
        for _ in 0..5 {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }

        let swarm = coordinator(Config {
            connection_limit: 3,
            ..Config::default()
        });
        for listener in &listeners {
            swarm.add_peer(listener.local_addr().unwrap());
        }

        assert_eq!(swarm.admit_pending().len(), 3);
        assert_eq!(swarm.peer_count(), 3);
        assert_eq!(swarm.pending_count(), 2);

        // nothing frees up, nothing more is admitted
        assert!(swarm.admit_pending().is_empty());

        let (socket, _) = listeners[0].accept().await.unwrap();
        drop(socket);
        eventually("disconnect", || swarm.peer_count() == 2).await;

        assert_eq!(swarm.admit_pending().len(), 1);
        assert_eq!(swarm.peer_count(), 3);
        assert_eq!(swarm.pending_count(), 1);

        let (_socket, _) = timeout(Duration::from_secs(2), listeners[3].accept())
            .await
            .unwrap()
            .unwrap();
        swarm.stop();
    }

    #[tokio::test]
    async fn test_failed_dial_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let swarm = coordinator(Config::default());
        let mut states = swarm.subscribe_states();
        swarm.add_peer(addr);
        swarm.admit_pending();

        eventually("eviction", || swarm.peer_count() == 0).await;
        let change = states.recv().await.unwrap();
        assert_eq!(change.addr, addr);
        assert_eq!(change.status.state, ConnectionState::Disconnected);
        assert_eq!(swarm.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unchoke_limit() {
        let swarm = coordinator(Config::default());
        let mut remotes = Vec::new();
        for n in 1..=10 {
            let (id, mut remote) = attach_remote(&swarm, n).await;
            send(&mut remote, Message::Interested).await;
            assert_eq!(expect_message(&mut remote).await, Message::Unchoke);
            remotes.push((id, remote));
        }
        assert_eq!(swarm.unchoked_count(), 10);

        let (late, mut late_remote) = attach_remote(&swarm, 11).await;
        send(&mut late_remote, Message::Interested).await;
        eventually("interest recorded", || {
            swarm.peer(late).is_some_and(|p| p.status.peer_interested)
        })
        .await;
        expect_silence(&mut late_remote).await;
        assert!(swarm.peer(late).unwrap().am_choking);
        assert_eq!(swarm.unchoked_count(), 10);

        // losing interest gives the slot back
        let (first, first_remote) = &mut remotes[0];
        send(first_remote, Message::NotInterested).await;
        assert_eq!(expect_message(first_remote).await, Message::Choke);
        assert!(swarm.peer(*first).unwrap().am_choking);
        assert_eq!(swarm.unchoked_count(), 9);
    }

    #[tokio::test]
    async fn test_disconnect_releases_unchoke_slot() {
        let swarm = coordinator(Config::default());
        let (id, mut remote) = attach_remote(&swarm, 1).await;
        send(&mut remote, Message::Interested).await;
        assert_eq!(expect_message(&mut remote).await, Message::Unchoke);
        assert_eq!(swarm.unchoked_count(), 1);

        drop(remote);
        eventually("eviction", || swarm.peer(id).is_none()).await;
        assert_eq!(swarm.unchoked_count(), 0);
    }

    #[tokio::test]
    async fn test_interested_sent_once() {
        let swarm = coordinator(Config::default());
        let (id, mut remote) = attach_remote(&swarm, 1).await;

        send(&mut remote, Message::Bitfield(Bitfield::from_bools(&[true, false, false, false]))).await;
        assert_eq!(expect_message(&mut remote).await, Message::Interested);
        assert!(swarm.peer(id).unwrap().am_interested);

        send(&mut remote, Message::Have(2)).await;
        expect_silence(&mut remote).await;
    }

    #[tokio::test]
    async fn test_no_interest_in_verified_chunks() {
        let swarm = SwarmCoordinator::new(
            Config::default(),
            INFO_HASH,
            4,
            Arc::new(Verified(vec![0, 1])),
        );
        let (id, mut remote) = attach_remote(&swarm, 1).await;

        send(&mut remote, Message::Have(1)).await;
        expect_silence(&mut remote).await;
        assert!(!swarm.peer(id).unwrap().am_interested);

        send(&mut remote, Message::Have(3)).await;
        assert_eq!(expect_message(&mut remote).await, Message::Interested);
    }

    #[tokio::test]
    async fn test_request_block_routes_to_holder() {
        let swarm = coordinator(Config::default());
        let (id, mut remote) = attach_remote(&swarm, 1).await;
        let request = BlockRequest {
            index: 0,
            offset: 0,
            length: 16384,
        };

        // choking us
        assert_eq!(swarm.request_block(request).await, None);

        send(&mut remote, Message::Have(0)).await;
        assert_eq!(expect_message(&mut remote).await, Message::Interested);
        send(&mut remote, Message::Unchoke).await;
        eventually("unchoked", || {
            swarm.peer(id).is_some_and(|p| !p.status.peer_choking)
        })
        .await;

        assert_eq!(swarm.request_block(request).await, Some(id));
        assert_eq!(expect_message(&mut remote).await, Message::Request(request));

        let elsewhere = BlockRequest { index: 1, ..request };
        assert_eq!(swarm.request_block(elsewhere).await, None);
    }

    #[tokio::test]
    async fn test_inbound_traffic_is_republished() {
        let swarm = coordinator(Config::default());
        let mut blocks = swarm.subscribe_blocks();
        let mut requests = swarm.subscribe_requests();
        let (id, mut remote) = attach_remote(&swarm, 1).await;

        let request = BlockRequest {
            index: 3,
            offset: 0,
            length: 10,
        };
        send(&mut remote, Message::Request(request)).await;
        let block = BlockData {
            index: 2,
            offset: 0,
            data: Bytes::from_static(b"xyz"),
        };
        send(&mut remote, Message::Piece(block.clone())).await;

        assert_eq!(requests.recv().await, Some(InboundRequest { peer: id, request }));
        assert_eq!(blocks.recv().await, Some(InboundBlock { peer: id, block }));
    }

    #[tokio::test]
    async fn test_serve_block_requires_unchoke() {
        let swarm = coordinator(Config::default());
        let (id, mut remote) = attach_remote(&swarm, 1).await;
        let data = Bytes::from_static(b"payload");

        assert!(!swarm.serve_block(id, 0, 0, data.clone()).await);

        send(&mut remote, Message::Interested).await;
        assert_eq!(expect_message(&mut remote).await, Message::Unchoke);
        assert!(swarm.serve_block(id, 0, 0, data.clone()).await);
        assert_eq!(
            expect_message(&mut remote).await,
            Message::Piece(BlockData {
                index: 0,
                offset: 0,
                data
            })
        );
    }

    #[tokio::test]
    async fn test_broadcast_have() {
        let swarm = coordinator(Config::default());
        let (_, mut a) = attach_remote(&swarm, 1).await;
        let (_, mut b) = attach_remote(&swarm, 2).await;

        swarm.broadcast_have(3).await;
        assert_eq!(expect_message(&mut a).await, Message::Have(3));
        assert_eq!(expect_message(&mut b).await, Message::Have(3));
    }

    #[tokio::test]
    async fn test_penalize_bans_at_strike_limit() {
        let swarm = coordinator(Config {
            strike_limit: 2,
            ..Config::default()
        });
        let (id, _remote) = attach_remote(&swarm, 1).await;

        swarm.penalize(id);
        assert_eq!(swarm.peer(id).unwrap().strikes, 1);
        assert!(!swarm.is_banned(&fake_addr(1)));

        swarm.penalize(id);
        assert!(swarm.is_banned(&fake_addr(1)));
        eventually("eviction", || swarm.peer(id).is_none()).await;
        assert!(!swarm.add_peer(fake_addr(1)));
    }

    #[tokio::test]
    async fn test_supervise_closes_silent_handshake() {
        let swarm = coordinator(Config {
            handshake_timeout: Duration::from_millis(20),
            ..Config::default()
        });
        let (local, _remote) = tokio::io::duplex(1024);
        let id = swarm.attach(fake_addr(1), local).await.unwrap();

        sleep(Duration::from_millis(40)).await;
        swarm.supervise();
        eventually("eviction", || swarm.peer(id).is_none()).await;
    }

    /// An unchoked peer holding chunk 0 behind a 128-byte pipe.
    async fn unchoked_holder(swarm: &SwarmCoordinator) -> (PeerId, DuplexStream) {
        let (id, mut remote) = attach_remote_with_capacity(swarm, 1, 128).await;
        send(&mut remote, Message::Have(0)).await;
        assert_eq!(expect_message(&mut remote).await, Message::Interested);
        send(&mut remote, Message::Unchoke).await;
        eventually("unchoked", || {
            swarm.peer(id).is_some_and(|p| !p.status.peer_choking)
        })
        .await;
        (id, remote)
    }

    const FIRST_BLOCK: BlockRequest = BlockRequest {
        index: 0,
        offset: 0,
        length: 16384,
    };

    #[tokio::test]
    async fn test_peer_that_stops_reading_is_dropped() {
        let swarm = coordinator(Config {
            write_timeout: Duration::from_millis(100),
            ..Config::default()
        });
        // the remote never reads again
        let (id, _remote) = unchoked_holder(&swarm).await;

        let mut sent = 0;
        for _ in 0..10 {
            let routed = timeout(Duration::from_secs(2), swarm.request_block(FIRST_BLOCK))
                .await
                .expect("request_block must not hang on a stalled peer");
            if routed.is_none() {
                break;
            }
            sent += 1;
        }
        // seven 17-byte requests fit in the pipe
        assert_eq!(sent, 7);

        eventually("eviction", || swarm.peer(id).is_none()).await;
        assert_eq!(swarm.request_block(FIRST_BLOCK).await, None);
    }

    #[tokio::test]
    async fn test_ban_releases_stalled_request() {
        let swarm = coordinator(Config {
            write_timeout: Duration::from_secs(60),
            ..Config::default()
        });
        let (id, _remote) = unchoked_holder(&swarm).await;
        for _ in 0..7 {
            assert_eq!(swarm.request_block(FIRST_BLOCK).await, Some(id));
        }

        let stalled = tokio::spawn({
            let swarm = swarm.handle();
            async move { swarm.request_block(FIRST_BLOCK).await }
        });
        sleep(Duration::from_millis(50)).await;
        assert!(!stalled.is_finished());

        for _ in 0..Config::default().strike_limit {
            swarm.penalize(id);
        }
        let routed = timeout(Duration::from_secs(2), stalled)
            .await
            .expect("closing the peer must cancel its pending write")
            .unwrap();
        assert_eq!(routed, None);
        eventually("eviction", || swarm.peer(id).is_none()).await;
    }

    #[tokio::test]
    async fn test_supervise_closes_idle_established_peer() {
        let swarm = coordinator(Config {
            idle_timeout: Duration::from_millis(200),
            ..Config::default()
        });
        let (id, _remote) = attach_remote(&swarm, 1).await;

        swarm.supervise();
        assert!(swarm.peer(id).is_some());

        sleep(Duration::from_millis(250)).await;
        swarm.supervise();
        eventually("eviction", || swarm.peer(id).is_none()).await;
    }

    #[tokio::test]
    async fn test_started_swarm_sends_periodic_keep_alives() {
        let swarm = coordinator(Config {
            keep_alive_interval: Duration::from_millis(30),
            ..Config::default()
        });
        let (_, mut remote) = attach_remote(&swarm, 1).await;
        swarm.start();

        for _ in 0..2 {
            let message = timeout(Duration::from_secs(2), expect_message(&mut remote))
                .await
                .unwrap();
            assert_eq!(message, Message::KeepAlive);
        }
        swarm.stop();
    }

    #[tokio::test]
    async fn test_keep_alive_reaches_connected_peers() {
        let swarm = coordinator(Config::default());
        let (_, mut remote) = attach_remote(&swarm, 1).await;

        swarm.send_keep_alives().await;
        assert_eq!(expect_message(&mut remote).await, Message::KeepAlive);
    }
}
