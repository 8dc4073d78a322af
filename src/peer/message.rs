use bytes::{BufMut, Bytes};
use thiserror::Error;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            _ => Err(()),
        }
    }
}

/// A block request: `length` bytes of chunk `index` starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Block payload of a `piece` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub index: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl BlockData {
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.data.len() as u64
    }
}

/// Why a complete frame could not be turned into a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Malformed {
    #[error("frame shorter than its length prefix")]
    Truncated,
    #[error("unknown message id {0}")]
    UnknownId(u8),
    #[error("{id:?} payload has invalid length {len}")]
    BadPayload { id: MessageId, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockRequest),
    Piece(BlockData),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have(_) => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece(_) => Some(MessageId::Piece),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Have(_) => 4,
            Message::Bitfield(bits) => bits.bits.len(),
            Message::Request(_) => 12,
            Message::Piece(block) => 8 + block.data.len(),
            _ => 0,
        }
    }

    /// Encode as `[u32 length][u8 id][payload]`; keep-alive is just `[0; 4]`.
    pub fn serialize(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return vec![0; 4];
        };

        let total_len = 1 + self.payload_len(); // 1 byte for ID
        let mut buf = Vec::with_capacity(4 + total_len);

        buf.put_u32(total_len as u32);
        buf.put_u8(id as u8);
        match self {
            Message::Have(index) => buf.put_u32(*index),
            Message::Bitfield(bits) => buf.put_slice(&bits.bits),
            Message::Request(req) => {
                buf.put_u32(req.index);
                buf.put_u32(req.offset);
                buf.put_u32(req.length);
            }
            Message::Piece(block) => {
                buf.put_u32(block.index);
                buf.put_u32(block.offset);
                buf.put_slice(&block.data);
            }
            _ => {}
        }

        buf
    }

    /// Decode one complete frame, length prefix included.
    pub fn deserialize(buf: &[u8]) -> Result<Self, Malformed> {
        if buf.len() < 4 {
            return Err(Malformed::Truncated);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return Err(Malformed::Truncated);
        }
        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        let raw_id = buf[4];
        let id = MessageId::try_from(raw_id).map_err(|_| Malformed::UnknownId(raw_id))?;
        let payload = &buf[5..4 + len];
        let bad = || Malformed::BadPayload {
            id,
            len: payload.len(),
        };

        let message = match id {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested
                if !payload.is_empty() =>
            {
                return Err(bad());
            }
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(bad());
                }
                Message::Have(read_u32(payload, 0))
            }
            MessageId::Bitfield => Message::Bitfield(Bitfield {
                bits: payload.to_vec(),
            }),
            MessageId::Request => {
                if payload.len() != 12 {
                    return Err(bad());
                }
                Message::Request(BlockRequest {
                    index: read_u32(payload, 0),
                    offset: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(bad());
                }
                Message::Piece(BlockData {
                    index: read_u32(payload, 0),
                    offset: read_u32(payload, 4),
                    data: Bytes::copy_from_slice(&payload[8..]),
                })
            }
        };

        Ok(message)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Chunk availability packed MSB-first, as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    pub bits: Vec<u8>, // raw bytes
}

impl Bitfield {
    pub fn has_piece(&self, index: usize) -> bool {
        let byte = index / 8;
        let bit = 7 - (index % 8); // MSB first
        if byte >= self.bits.len() {
            return false;
        }
        self.bits[byte] & (1 << bit) != 0
    }

    pub fn set_piece(&mut self, index: usize) {
        let byte = index / 8;
        let bit = 7 - (index % 8);
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << bit;
        }
    }

    pub fn from_piece_count(count: usize) -> Self {
        let num_bytes = count.div_ceil(8);
        Bitfield {
            bits: vec![0; num_bytes],
        }
    }

    pub fn from_bools(flags: &[bool]) -> Self {
        let mut bitfield = Self::from_piece_count(flags.len());
        for (index, _) in flags.iter().enumerate().filter(|(_, set)| **set) {
            bitfield.set_piece(index);
        }
        bitfield
    }

    /// The first `count` flags; pad bits past `count` are ignored.
    pub fn to_bools(&self, count: usize) -> Vec<bool> {
        (0..count).map(|i| self.has_piece(i)).collect()
    }

    /// Indices below `count` that are set.
    pub fn pieces(&self, count: usize) -> impl Iterator<Item = usize> + '_ {
        (0..count).filter(move |&i| self.has_piece(i))
    }
}
