//! Client configuration
//!
//! Limits and timer periods for the swarm, the scheduler and the tracker
//! announces. The defaults mirror common client behaviour.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::error::{Error, Result};

pub const DEFAULT_PEER_ID_PREFIX: &str = "-RS0100-";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the torrent's files are written under
    pub download_dir: PathBuf,

    /// Port reported to trackers
    pub listen_port: u16,

    /// Our 20-byte peer id
    pub peer_id: [u8; 20],

    /// Maximum simultaneously admitted peers (dialing or connected)
    pub connection_limit: usize,

    /// Maximum peers we unchoke at once
    pub unchoke_limit: usize,

    /// Period of the admission/housekeeping tick
    pub admission_interval: Duration,

    /// Period between keep-alives sent to each peer
    pub keep_alive_interval: Duration,

    /// Inbound silence after which a connection is closed
    pub idle_timeout: Duration,

    /// Upper bound on a single TCP dial
    pub connect_timeout: Duration,

    /// Time a dialed peer gets to answer our handshake
    pub handshake_timeout: Duration,

    /// Upper bound on one outbound message; a peer that stops reading is
    /// closed once it passes
    pub write_timeout: Duration,

    /// Period of the block request tick
    pub request_interval: Duration,

    /// Random chunk picks per request tick before giving up
    pub request_retries: usize,

    /// Age after which an unanswered block request may be sent again
    pub request_timeout: Duration,

    /// Verification failures a peer may contribute to before it is banned
    pub strike_limit: u32,

    /// Verification failures of one chunk before the download is abandoned
    pub chunk_failure_limit: u32,

    /// Upper bound on the tracker re-announce period
    pub max_announce_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            listen_port: 6881,
            peer_id: generate_peer_id(DEFAULT_PEER_ID_PREFIX),
            connection_limit: 30,
            unchoke_limit: 10,
            admission_interval: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(4 * 60),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            request_interval: Duration::from_millis(15),
            request_retries: 15,
            request_timeout: Duration::from_secs(10),
            strike_limit: 3,
            chunk_failure_limit: 8,
            max_announce_interval: Duration::from_secs(120),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 11] = [
            ("connection_limit", self.connection_limit > 0),
            ("admission_interval", !self.admission_interval.is_zero()),
            ("keep_alive_interval", !self.keep_alive_interval.is_zero()),
            ("idle_timeout", !self.idle_timeout.is_zero()),
            ("connect_timeout", !self.connect_timeout.is_zero()),
            ("handshake_timeout", !self.handshake_timeout.is_zero()),
            ("write_timeout", !self.write_timeout.is_zero()),
            ("request_interval", !self.request_interval.is_zero()),
            ("request_retries", self.request_retries > 0),
            ("strike_limit", self.strike_limit > 0),
            ("chunk_failure_limit", self.chunk_failure_limit > 0),
        ];

        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(Error::Config(format!("{field} must be non-zero"))),
            None => Ok(()),
        }
    }
}

/// Azureus-style peer id: `prefix` followed by random alphanumerics, always
/// exactly 20 bytes. Prefixes longer than 20 bytes are cut.
pub fn generate_peer_id(prefix: &str) -> [u8; 20] {
    let mut id = [0u8; 20];
    let prefix = &prefix.as_bytes()[..prefix.len().min(20)];
    id[..prefix.len()].copy_from_slice(prefix);

    let mut rng = rand::thread_rng();
    for byte in id.iter_mut().skip(prefix.len()) {
        *byte = rng.sample(Alphanumeric);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection_limit, 30);
        assert_eq!(config.unchoke_limit, 10);
        assert_eq!(config.request_interval, Duration::from_millis(15));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = Config {
            connection_limit: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("connection_limit"));
    }

    #[test]
    fn test_generate_peer_id() {
        let id = generate_peer_id(DEFAULT_PEER_ID_PREFIX);
        assert_eq!(&id[..8], b"-RS0100-");
        assert!(id[8..].iter().all(u8::is_ascii_alphanumeric));
        assert_ne!(id, generate_peer_id(DEFAULT_PEER_ID_PREFIX));
    }
}
