use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::PeerError;
use crate::events::EventBus;
use crate::peer::codec::{Frame, FrameDecoder};
use crate::peer::handshake::Handshake;
use crate::peer::message::{Bitfield, BlockData, BlockRequest, Message};
use crate::peer::{ConnectionState, PeerStatus};
use crate::torrent::Sha1Hash;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything a connection reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    State(PeerStatus),
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockRequest),
    Piece(BlockData),
}

/// Wire-protocol engine for one remote peer.
///
/// Reads run on a dedicated task that reassembles frames and publishes
/// [`PeerEvent`]s; writes are serialized through an async mutex on the write
/// half. Any I/O failure closes the connection for good, and so does a write
/// that does not finish within the write timeout.
pub struct PeerConnection {
    addr: SocketAddr,
    local_peer_id: [u8; 20],
    write_timeout: Duration,
    shared: Arc<Shared>,
}

struct Shared {
    info_hash: Sha1Hash,
    status: Mutex<PeerStatus>,
    remote_peer_id: Mutex<Option<[u8; 20]>>,
    last_activity: Mutex<Instant>,
    state_since: Mutex<Instant>,
    opened: AtomicBool,
    closed: AtomicBool,
    /// Flips to `true` on close and cancels writes still in flight.
    shutdown: watch::Sender<bool>,
    writer: Mutex<Option<Arc<tokio::sync::Mutex<Writer>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: EventBus<PeerEvent>,
}

impl PeerConnection {
    pub fn new(addr: SocketAddr, info_hash: Sha1Hash, local_peer_id: [u8; 20]) -> Self {
        let now = Instant::now();
        Self {
            addr,
            local_peer_id,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shared: Arc::new(Shared {
                info_hash,
                status: Mutex::new(PeerStatus::default()),
                remote_peer_id: Mutex::new(None),
                last_activity: Mutex::new(now),
                state_since: Mutex::new(now),
                opened: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: watch::Sender::new(false),
                writer: Mutex::new(None),
                reader: Mutex::new(None),
                events: EventBus::new(),
            }),
        }
    }

    /// Upper bound on a single outbound frame reaching the socket.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn status(&self) -> PeerStatus {
        *self.shared.status.lock()
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        *self.shared.remote_peer_id.lock()
    }

    /// Time since the last fully parsed inbound message.
    pub fn idle_for(&self) -> Duration {
        self.shared.last_activity.lock().elapsed()
    }

    /// Time spent in the current [`ConnectionState`].
    pub fn in_state_for(&self) -> Duration {
        self.shared.state_since.lock().elapsed()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    /// Dial the peer. On success the read loop is running and the connection
    /// waits for the remote handshake.
    pub async fn connect(&self, connect_timeout: Duration) -> Result<(), PeerError> {
        if !self.shared.open() {
            return Err(PeerError::NotConnected);
        }
        self.shared.set_state(ConnectionState::Connecting);

        let stream = match timeout(connect_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                self.shared.close();
                return Err(PeerError::Connect {
                    addr: self.addr,
                    source,
                });
            }
            Err(_) => {
                self.shared.close();
                return Err(PeerError::ConnectTimeout(self.addr));
            }
        };

        self.start(stream);
        Ok(())
    }

    /// Adopt an already-connected stream, e.g. an accepted socket.
    pub fn attach<S>(&self, stream: S) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if !self.shared.open() {
            return Err(PeerError::NotConnected);
        }
        self.start(stream);
        Ok(())
    }

    fn start<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let writer: Writer = Box::new(writer);
        *self.shared.writer.lock() = Some(Arc::new(tokio::sync::Mutex::new(writer)));
        *self.shared.last_activity.lock() = Instant::now();
        self.shared.set_state(ConnectionState::HandshakePending);

        let shared = Arc::clone(&self.shared);
        let addr = self.addr;
        let handle = tokio::spawn(async move {
            read_loop(&shared, reader, addr).await;
            shared.close();
        });
        *self.shared.reader.lock() = Some(handle);
    }

    /// Tear the connection down. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub async fn send_handshake(&self) -> Result<(), PeerError> {
        let handshake = Handshake::new(self.shared.info_hash, self.local_peer_id);
        self.write_bytes(&handshake.serialize()).await
    }

    pub async fn send_keep_alive(&self) -> Result<(), PeerError> {
        self.send(&Message::KeepAlive).await
    }

    pub async fn send_choke(&self) -> Result<(), PeerError> {
        self.send(&Message::Choke).await
    }

    pub async fn send_unchoke(&self) -> Result<(), PeerError> {
        self.send(&Message::Unchoke).await
    }

    pub async fn send_interested(&self) -> Result<(), PeerError> {
        self.send(&Message::Interested).await
    }

    pub async fn send_not_interested(&self) -> Result<(), PeerError> {
        self.send(&Message::NotInterested).await
    }

    pub async fn send_have(&self, index: u32) -> Result<(), PeerError> {
        self.send(&Message::Have(index)).await
    }

    pub async fn send_bitfield(&self, bits: Bitfield) -> Result<(), PeerError> {
        self.send(&Message::Bitfield(bits)).await
    }

    pub async fn send_request(&self, request: BlockRequest) -> Result<(), PeerError> {
        self.send(&Message::Request(request)).await
    }

    pub async fn send_piece(&self, block: BlockData) -> Result<(), PeerError> {
        self.send(&Message::Piece(block)).await
    }

    pub async fn send(&self, message: &Message) -> Result<(), PeerError> {
        self.write_bytes(&message.serialize()).await
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), PeerError> {
        let writer = self
            .shared
            .writer
            .lock()
            .clone()
            .ok_or(PeerError::NotConnected)?;

        let mut shutdown = self.shared.shutdown.subscribe();

        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(bytes).await?;
            writer.flush().await
        };

        let err = tokio::select! {
            result = timeout(self.write_timeout, write) => match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    debug!("write to {} failed: {}", self.addr, e);
                    PeerError::Write(e)
                }
                Err(_) => {
                    debug!("write to {} stalled for {:?}", self.addr, self.write_timeout);
                    PeerError::WriteTimeout(self.addr)
                }
            },
            _ = shutdown.wait_for(|closed| *closed) => PeerError::NotConnected,
        };

        self.shared.close();
        Err(err)
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl Shared {
    /// Marks the connection as used; a connection opens at most once.
    fn open(&self) -> bool {
        !self.opened.swap(true, Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        let status = {
            let mut status = self.status.lock();
            status.state = state;
            *status
        };
        *self.state_since.lock() = Instant::now();
        self.events.publish(PeerEvent::State(status));
    }

    fn update_status(&self, update: impl FnOnce(&mut PeerStatus)) {
        let status = {
            let mut status = self.status.lock();
            update(&mut status);
            *status
        };
        self.events.publish(PeerEvent::State(status));
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.opened.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        self.writer.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Returns `false` when the connection must be torn down.
    fn handle_frame(&self, frame: Frame, decoder: &mut FrameDecoder, addr: SocketAddr) -> bool {
        match frame {
            Frame::Handshake(Some(handshake)) if handshake.info_hash == self.info_hash => {
                decoder.confirm_handshake();
                self.touch();
                *self.remote_peer_id.lock() = Some(handshake.peer_id);
                *self.state_since.lock() = Instant::now();
                self.update_status(|status| {
                    status.state = ConnectionState::Established;
                    status.peer_choking = true;
                    status.peer_interested = false;
                });
                debug!("handshake completed with {}", addr);
            }
            Frame::Handshake(_) => {
                debug!("dropping unknown handshake from {}", addr);
            }
            Frame::Message(Ok(message)) => {
                self.touch();
                trace!("{} sent {:?}", addr, message.id());
                self.dispatch(message);
            }
            Frame::Message(Err(malformed)) => {
                debug!("dropping unknown message from {}: {}", addr, malformed);
            }
            Frame::Oversized(len) => {
                warn!("{} announced a {} byte frame, closing", addr, len);
                return false;
            }
        }
        true
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::KeepAlive => {}
            Message::Choke => self.update_status(|s| s.peer_choking = true),
            Message::Unchoke => self.update_status(|s| s.peer_choking = false),
            Message::Interested => self.update_status(|s| s.peer_interested = true),
            Message::NotInterested => self.update_status(|s| s.peer_interested = false),
            Message::Have(index) => self.events.publish(PeerEvent::Have(index)),
            Message::Bitfield(bits) => self.events.publish(PeerEvent::Bitfield(bits)),
            Message::Request(request) => self.events.publish(PeerEvent::Request(request)),
            Message::Piece(block) => self.events.publish(PeerEvent::Piece(block)),
        }
    }
}

async fn read_loop<R>(shared: &Shared, mut reader: R, addr: SocketAddr)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("{} closed the connection", addr);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("read from {} failed: {}", addr, e);
                return;
            }
        };

        decoder.extend(&buf[..n]);
        while let Some(frame) = decoder.next_frame() {
            if !shared.handle_frame(frame, &mut decoder, addr) {
                return;
            }
        }
    }
}
