use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::debug;

use crate::bencode_parser::parser::{Value, parse_single};
use crate::error::TrackerError;
use crate::peer::Peer;

/// Decoded body of a successful announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    /// Seeders, when the tracker reports them
    pub complete: Option<u64>,
    /// Leechers, when the tracker reports them
    pub incomplete: Option<u64>,
    pub peers: Vec<Peer>,
    pub warning: Option<String>,
}

impl AnnounceResponse {
    /// A `failure reason` key turns the whole response into
    /// [`TrackerError::Failure`].
    pub fn from_bytes(body: &[u8]) -> Result<Self, TrackerError> {
        let root = parse_single(body).map_err(|e| TrackerError::Decode(e.to_string()))?;
        if root.as_dict().is_none() {
            return Err(TrackerError::Malformed("response is not a dictionary"));
        }

        if let Some(reason) = root.get(b"failure reason") {
            let reason = reason
                .as_bytes()
                .map(|r| String::from_utf8_lossy(r).into_owned())
                .unwrap_or_default();
            return Err(TrackerError::Failure(reason));
        }

        let interval = root
            .get(b"interval")
            .and_then(Value::as_integer)
            .ok_or(TrackerError::Malformed("missing interval"))?;

        let peers = match root.get(b"peers") {
            Some(Value::Bytes(compact)) => {
                extract_peers(compact).ok_or(TrackerError::Malformed("compact peers length"))?
            }
            Some(Value::List(entries)) => entries.iter().filter_map(dictionary_peer).collect(),
            Some(_) => return Err(TrackerError::Malformed("peers has the wrong type")),
            None => Vec::new(),
        };

        Ok(Self {
            interval: seconds(interval),
            min_interval: root.get(b"min interval").and_then(Value::as_integer).map(seconds),
            complete: count(&root, b"complete"),
            incomplete: count(&root, b"incomplete"),
            peers,
            warning: root
                .get(b"warning message")
                .and_then(Value::as_bytes)
                .map(|w| String::from_utf8_lossy(w).into_owned()),
        })
    }
}

fn seconds(value: i64) -> Duration {
    Duration::from_secs(value.max(0) as u64)
}

fn count(root: &Value<'_>, key: &[u8]) -> Option<u64> {
    root.get(key)
        .and_then(Value::as_integer)
        .and_then(|n| u64::try_from(n).ok())
}

/// Compact form: 4 bytes of IPv4 address and 2 bytes of port per peer.
pub(crate) fn extract_peers(bytes: &[u8]) -> Option<Vec<Peer>> {
    if bytes.len() % 6 != 0 {
        return None;
    }
    let peers = bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer { ip_addr: ip, port }
        })
        .collect();

    Some(peers)
}

/// Dictionary form: `{ip, port}`. Entries we cannot dial are skipped.
fn dictionary_peer(entry: &Value<'_>) -> Option<Peer> {
    let ip = entry.get(b"ip")?.as_str()?;
    let port = entry.get(b"port")?.as_integer()?;

    let (Ok(ip_addr), Ok(port)) = (ip.parse::<Ipv4Addr>(), u16::try_from(port)) else {
        debug!("skipping tracker peer {}:{}", ip, port);
        return None;
    };
    Some(Peer { ip_addr, port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_extract_peers_valid() {
        // 192.168.1.1:6881 and 10.0.0.1:8080
        let peer_data = vec![192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 1, 0x1F, 0x90];

        let peers = extract_peers(&peer_data).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip_addr, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].ip_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(peers[1].port, 8080);
    }

    #[test]
    fn test_extract_peers_empty() {
        assert_eq!(extract_peers(&[]), Some(vec![]));
    }

    #[test]
    fn test_extract_peers_invalid_length() {
        assert!(extract_peers(&[192, 168, 1, 1, 0x1A]).is_none());
    }

    #[test]
    fn test_extract_peers_port_endianness() {
        let peers = extract_peers(&[192, 168, 1, 1, 0x01, 0x00]).unwrap();
        assert_eq!(peers[0].port, 256);

        let peers = extract_peers(&[192, 168, 1, 1, 0x00, 0x01]).unwrap();
        assert_eq!(peers[0].port, 1);
    }

    #[test]
    fn test_compact_response() {
        let mut body = b"d8:completei5e10:incompletei3e8:intervali1800e12:min intervali60e5:peers12:".to_vec();
        body.extend([127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2]);
        body.push(b'e');

        let response = AnnounceResponse::from_bytes(&body).unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.min_interval, Some(Duration::from_secs(60)));
        assert_eq!(response.complete, Some(5));
        assert_eq!(response.incomplete, Some(3));
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[1].to_string(), "10.0.0.2:6882");
        assert_eq!(response.warning, None);
    }

    #[test]
    fn test_dictionary_peers() {
        let body = b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip7:::1:abc4:porti6881eeee";
        let response = AnnounceResponse::from_bytes(body).unwrap();
        assert_eq!(
            response.peers,
            vec![Peer {
                ip_addr: Ipv4Addr::LOCALHOST,
                port: 6881,
            }]
        );
        assert_eq!(response.complete, None);
    }

    #[test]
    fn test_failure_reason_short_circuits() {
        let body = b"d14:failure reason12:unknown hash8:intervali60ee";
        assert_matches!(
            AnnounceResponse::from_bytes(body),
            Err(TrackerError::Failure(reason)) if reason == "unknown hash"
        );
    }

    #[test]
    fn test_warning_is_kept() {
        let body = b"d8:intervali60e15:warning message4:slowe";
        let response = AnnounceResponse::from_bytes(body).unwrap();
        assert_eq!(response.warning.as_deref(), Some("slow"));
        assert!(response.peers.is_empty());
    }

    #[test]
    fn test_malformed_responses() {
        assert_matches!(
            AnnounceResponse::from_bytes(b"not bencode"),
            Err(TrackerError::Decode(_))
        );
        assert_matches!(
            AnnounceResponse::from_bytes(b"li1ee"),
            Err(TrackerError::Malformed(_))
        );
        assert_matches!(
            AnnounceResponse::from_bytes(b"d5:peers0:e"),
            Err(TrackerError::Malformed("missing interval"))
        );
        assert_matches!(
            AnnounceResponse::from_bytes(b"d8:intervali60e5:peers5:abcdee"),
            Err(TrackerError::Malformed("compact peers length"))
        );
    }
}
