//! Client for the tracker service that stores manifests and hands out peer lists.

use serde::Deserialize;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Debug)]
pub enum TrackerError {
    Build(reqwest::Error),
    Request(reqwest::Error),
    Status(u16),
    Rejected(String),
    Decode(serde_json::Error),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Build(source) => write!(f, "failed to build tracker client: {source}"),
            Self::Request(source) => write!(f, "tracker request failed: {source}"),
            Self::Status(code) => write!(f, "tracker answered http {code}"),
            Self::Rejected(msg) => write!(f, "tracker rejected request: {msg}"),
            Self::Decode(source) => write!(f, "undecodable tracker response: {source}"),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Build(source) | Self::Request(source) => Some(source),
            Self::Decode(source) => Some(source),
            Self::Status(_) | Self::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerPeer {
    pub peer_id: String,
    /// `ip:port` of the peer's bt listener.
    pub addr: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(default)]
    peers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TrackerClient {
    client: reqwest::Client,
    base_url: String,
    peer_id: String,
    port: u16,
}

impl TrackerClient {
    /// `port` is our own bt listener port, reported to the tracker on every call.
    pub fn new(host: &str, tracker_port: u16, peer_id: &str, port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TrackerError::Build)?;
        Ok(Self {
            client,
            base_url: format!("http://{host}:{tracker_port}"),
            peer_id: peer_id.to_string(),
            port,
        })
    }

    /// Downloads the manifest bytes registered for `content_hash`.
    pub async fn fetch_manifest(&self, content_hash: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(format!("{}/torrent", self.base_url))
            .query(&self.identity_query(content_hash))
            .send()
            .await
            .map_err(TrackerError::Request)?;
        let body = checked_body(resp).await?;
        if let Some(msg) = rejection(&body) {
            return Err(TrackerError::Rejected(msg));
        }
        Ok(body)
    }

    pub async fn upload_manifest(&self, content_hash: &str, manifest: &[u8]) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/torrent", self.base_url))
            .query(&self.identity_query(content_hash))
            .body(manifest.to_vec())
            .send()
            .await
            .map_err(TrackerError::Request)?;
        let body = checked_body(resp).await?;
        if body.is_empty() {
            return Ok(());
        }
        let envelope: Envelope = serde_json::from_slice(&body).map_err(TrackerError::Decode)?;
        if envelope.status < 0 {
            return Err(TrackerError::Rejected(envelope.msg));
        }
        Ok(())
    }

    /// Announces ourselves for `content_hash` and returns the other peers in the swarm.
    pub async fn announce(&self, content_hash: &str) -> Result<Vec<TrackerPeer>> {
        let port = self.port.to_string();
        let resp = self
            .client
            .get(format!("{}/node", self.base_url))
            .query(&[
                ("info_hash", content_hash),
                ("peer_id", self.peer_id.as_str()),
                ("port", port.as_str()),
                ("compact", "0"),
            ])
            .send()
            .await
            .map_err(TrackerError::Request)?;
        let body = checked_body(resp).await?;
        if let Some(msg) = rejection(&body) {
            return Err(TrackerError::Rejected(msg));
        }
        let announce: AnnounceResponse =
            serde_json::from_slice(&body).map_err(TrackerError::Decode)?;
        Ok(announce
            .peers
            .iter()
            .filter_map(|p| parse_peer(p))
            .filter(|p| p.peer_id != self.peer_id)
            .collect())
    }

    fn identity_query(&self, content_hash: &str) -> [(&'static str, String); 3] {
        [
            ("infohash", content_hash.to_string()),
            ("peer_id", self.peer_id.clone()),
            ("port", self.port.to_string()),
        ]
    }
}

async fn checked_body(resp: reqwest::Response) -> Result<Vec<u8>> {
    let status = resp.status();
    if !status.is_success() {
        return Err(TrackerError::Status(status.as_u16()));
    }
    let body = resp.bytes().await.map_err(TrackerError::Request)?;
    Ok(body.to_vec())
}

/// The tracker answers errors with `{status<0, msg}` even on http 200.
fn rejection(body: &[u8]) -> Option<String> {
    let envelope: Envelope = serde_json::from_slice(body).ok()?;
    (envelope.status < 0).then_some(envelope.msg)
}

/// Parses the tracker's `peer_id:ip:port` peer notation.
pub fn parse_peer(value: &str) -> Option<TrackerPeer> {
    let (peer_id, addr) = value.split_once(':')?;
    let (host, port) = addr.rsplit_once(':')?;
    if peer_id.is_empty() || host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(TrackerPeer {
        peer_id: peer_id.to_string(),
        addr: addr.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_notation() {
        assert_eq!(
            parse_peer("0123456789abcdef0123:10.0.0.7:8088"),
            Some(TrackerPeer {
                peer_id: "0123456789abcdef0123".to_string(),
                addr: "10.0.0.7:8088".to_string(),
            })
        );
        assert_eq!(parse_peer("id:10.0.0.7"), None);
        assert_eq!(parse_peer("id:10.0.0.7:notaport"), None);
        assert_eq!(parse_peer(":10.0.0.7:80"), None);
    }

    #[test]
    fn detects_error_envelope_but_not_manifests() {
        assert_eq!(
            rejection(br#"{"status":-1,"msg":"infoHash parameter err"}"#),
            Some("infoHash parameter err".to_string())
        );
        assert_eq!(rejection(br#"{"status":0,"msg":"ok","result":{}}"#), None);
        assert_eq!(
            rejection(br#"{"version":"1.0","contenttype":"singlefile"}"#),
            None
        );
        assert_eq!(rejection(b"not json"), None);
    }
}
