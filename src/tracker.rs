use std::fmt;

use once_cell::sync::Lazy;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::error::TrackerError;
use crate::torrent::Sha1Hash;

pub mod response;

pub use response::AnnounceResponse;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("rs_swarm/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    /// Periodic re-announce; the `event` parameter is omitted.
    Regular,
}

impl AnnounceEvent {
    fn as_param(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Regular => None,
        }
    }
}

impl fmt::Display for AnnounceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_param().unwrap_or("regular"))
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub compact: bool,
}

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

/// Appends the announce parameters to `announce`, keeping any query it
/// already carries.
pub fn build_announce_url(announce: &str, request: &AnnounceRequest) -> Result<Url, TrackerError> {
    let mut url = Url::parse(announce)?;

    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}",
        encode_bytes(&request.info_hash),
        encode_bytes(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
        u8::from(request.compact),
    );
    if let Some(event) = request.event.as_param() {
        query.push_str("&event=");
        query.push_str(event);
    }

    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
        _ => query,
    };
    url.set_query(Some(&query));
    Ok(url)
}

/// HTTP tracker client sharing one connection pool across announces.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    http: Client,
}

impl TrackerClient {
    pub fn new() -> Self {
        Self {
            http: HTTP_CLIENT.clone(),
        }
    }

    pub async fn announce(
        &self,
        announce: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = build_announce_url(announce, request)?;
        debug!("announcing {} to {}", request.event, announce);

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TrackerError::Status(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        let parsed = AnnounceResponse::from_bytes(&body)?;
        if let Some(warning) = &parsed.warning {
            warn!("tracker {} warns: {}", announce, warning);
        }
        debug!(
            "{} returned {} peers, interval {:?}",
            announce,
            parsed.peers.len(),
            parsed.interval
        );
        Ok(parsed)
    }
}

impl Default for TrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [
                1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
            ],
            peer_id: *b"-RS0100-f52c3727bfe8",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1048576,
            event: AnnounceEvent::Started,
            compact: true,
        }
    }

    fn query_value(url: &Url, key: &str) -> Option<String> {
        let raw = url.query()?;
        raw.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    }

    #[test]
    fn test_build_announce_url() {
        let url = build_announce_url("http://tracker.example.com:8080/announce", &request()).unwrap();
        let text = url.as_str();

        assert!(text.starts_with("http://tracker.example.com:8080/announce?"));
        assert_eq!(query_value(&url, "port").as_deref(), Some("6881"));
        assert_eq!(query_value(&url, "uploaded").as_deref(), Some("0"));
        assert_eq!(query_value(&url, "downloaded").as_deref(), Some("0"));
        assert_eq!(query_value(&url, "left").as_deref(), Some("1048576"));
        assert_eq!(query_value(&url, "compact").as_deref(), Some("1"));
        assert_eq!(query_value(&url, "event").as_deref(), Some("started"));
    }

    #[test]
    fn test_build_announce_url_invalid_announce() {
        assert_matches!(
            build_announce_url("invalid_url", &request()),
            Err(TrackerError::Url(_))
        );
    }

    #[test]
    fn test_binary_fields_are_percent_encoded() {
        let url = build_announce_url("http://t.example/announce", &request()).unwrap();

        let info_hash = query_value(&url, "info_hash").unwrap();
        assert!(info_hash.starts_with("%01%02%03"));
        assert_eq!(
            query_value(&url, "peer_id").as_deref(),
            Some("%2DRS0100%2Df52c3727bfe8")
        );
    }

    #[test]
    fn test_regular_announce_omits_event() {
        let regular = AnnounceRequest {
            event: AnnounceEvent::Regular,
            compact: false,
            ..request()
        };
        let url = build_announce_url("http://t.example/announce", &regular).unwrap();
        assert_eq!(query_value(&url, "event"), None);
        assert_eq!(query_value(&url, "compact").as_deref(), Some("0"));
    }

    #[test]
    fn test_existing_query_is_preserved() {
        let url = build_announce_url(
            "http://tracker.example.com:8080/announce?passkey=abc",
            &request(),
        )
        .unwrap();
        assert_eq!(query_value(&url, "passkey").as_deref(), Some("abc"));
        assert_eq!(query_value(&url, "port").as_deref(), Some("6881"));
    }

    /// Serves one canned HTTP response and returns the announce URL.
    async fn one_shot_tracker(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });
        format!("http://{addr}/announce")
    }

    #[tokio::test]
    async fn test_announce_returns_peers() {
        let announce = one_shot_tracker(
            "200 OK",
            b"d8:intervali120e5:peers6:\x7f\x00\x00\x01\x1a\xe1e",
        )
        .await;

        let response = TrackerClient::new().announce(&announce, &request()).await.unwrap();
        assert_eq!(response.interval.as_secs(), 120);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].to_string(), "127.0.0.1:6881");
    }

    #[tokio::test]
    async fn test_announce_http_error() {
        let announce = one_shot_tracker("500 Internal Server Error", b"").await;
        assert_matches!(
            TrackerClient::new().announce(&announce, &request()).await,
            Err(TrackerError::Status(500))
        );
    }
}
