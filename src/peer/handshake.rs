use crate::peer::{HANDSHAKE_LEN, PSTR, PSTR_LEN};
use crate::torrent::Sha1Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PSTR_LEN;
        buf[1..20].copy_from_slice(PSTR.as_bytes());
        // buf[20..28] is already zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);

        buf
    }

    /// Reserved bytes are ignored; anything else that is off yields `None`.
    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() != HANDSHAKE_LEN || buf[0] != PSTR_LEN {
            return None;
        }
        if &buf[1..20] != PSTR.as_bytes() {
            return None;
        }

        let info_hash = <[u8; 20]>::try_from(&buf[28..48]).ok()?;
        let peer_id = <[u8; 20]>::try_from(&buf[48..68]).ok()?;

        Some(Self { info_hash, peer_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialize() {
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        let serialized = Handshake::new(info_hash, peer_id).serialize();

        assert_eq!(serialized.len(), 68);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &[0u8; 8]);
        assert_eq!(&serialized[28..48], &info_hash);
        assert_eq!(&serialized[48..68], &peer_id);
    }

    #[test]
    fn test_handshake_roundtrip_keeps_identifiers() {
        let original = Handshake::new([7u8; 20], *b"-RS0100-abcdefghijkl");
        let parsed = Handshake::deserialize(&original.serialize()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_handshake_deserialize_invalid_length() {
        assert!(Handshake::deserialize(&[0u8; 67]).is_none());
        assert!(Handshake::deserialize(&[0u8; 69]).is_none());
    }

    #[test]
    fn test_handshake_deserialize_invalid_pstr_len() {
        let mut buf = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        buf[0] = PSTR_LEN + 1;
        assert!(Handshake::deserialize(&buf).is_none());
    }

    #[test]
    fn test_handshake_deserialize_invalid_pstr() {
        let mut buf = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        buf[1..20].copy_from_slice(b"Invalid protocol!!X");
        assert!(Handshake::deserialize(&buf).is_none());
    }

    #[test]
    fn test_handshake_deserialize_with_non_zero_reserved_bytes() {
        let mut buf = Handshake::new([17u8; 20], [18u8; 20]).serialize();
        buf[20..28].fill(0xFF);

        let handshake = Handshake::deserialize(&buf).unwrap();
        assert_eq!(handshake.info_hash, [17u8; 20]);
        assert_eq!(handshake.peer_id, [18u8; 20]);
    }
}
