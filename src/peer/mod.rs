use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub mod codec;
pub mod connection;
pub mod handshake;
pub mod message;

pub use connection::{PeerConnection, PeerEvent};
pub use message::{Bitfield, BlockData, BlockRequest, Message};

const PSTR: &str = "BitTorrent protocol";
const PSTR_LEN: u8 = PSTR.len() as u8; // always 19

pub const HANDSHAKE_LEN: usize = 68;
pub const BLOCK_SIZE: u32 = 16384; // 16KB blocks

/// A peer address as handed out by trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip_addr: Ipv4Addr,
    pub port: u16,
}

impl From<Peer> for SocketAddr {
    fn from(peer: Peer) -> Self {
        SocketAddr::V4(SocketAddrV4::new(peer.ip_addr, peer.port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip_addr, self.port)
    }
}

/// Lifecycle of a single peer connection.
///
/// `Disconnected` is both the initial and the terminal state; a connection
/// that has been closed is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    HandshakePending,
    Established,
}

/// Snapshot of what the remote side has told us, published on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus {
    pub state: ConnectionState,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl PeerStatus {
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::HandshakePending | ConnectionState::Established
        )
    }
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            peer_choking: true,
            peer_interested: false,
        }
    }
}
