//! Reassembly of wire frames from arbitrarily split reads.

use bytes::{Buf, BytesMut};

use crate::peer::HANDSHAKE_LEN;
use crate::peer::handshake::Handshake;
use crate::peer::message::{Malformed, Message};

/// Largest length prefix accepted before the stream is considered corrupt.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// 68 bytes taken while waiting for the handshake; `None` if malformed.
    Handshake(Option<Handshake>),
    Message(Result<Message, Malformed>),
    /// Declared length above [`MAX_FRAME_LEN`]; the stream cannot be resynced.
    Oversized(usize),
}

/// Buffers inbound bytes and yields complete frames.
///
/// Until [`FrameDecoder::confirm_handshake`] is called every frame is 68
/// bytes; afterwards frames are `4 + length prefix` bytes long.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    handshake_confirmed: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn confirm_handshake(&mut self) {
        self.handshake_confirmed = true;
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes the next frame needs in total, if that is known yet.
    fn required_len(&self) -> Option<usize> {
        if !self.handshake_confirmed {
            return Some(HANDSHAKE_LEN);
        }
        if self.buf.len() < 4 {
            return None;
        }
        let prefix = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        Some(4 + prefix as usize)
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        let required = self.required_len()?;

        if self.handshake_confirmed && required - 4 > MAX_FRAME_LEN {
            return Some(Frame::Oversized(required - 4));
        }
        if self.buf.len() < required {
            return None;
        }

        let frame = self.buf.split_to(required);
        if !self.handshake_confirmed {
            return Some(Frame::Handshake(Handshake::deserialize(&frame)));
        }
        Some(Frame::Message(Message::deserialize(frame.chunk())))
    }
}
