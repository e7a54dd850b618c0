use crate::tracker::TrackerClient;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchFailure>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub content_hash: String,
    pub block_index: usize,
    pub offset: u64,
    pub length: u64,
}

/// One failed attempt at retrieving a block. Absorbed into block state by the
/// collector, never returned to callers.
#[derive(Debug)]
pub enum FetchFailure {
    NoPeers,
    Http(reqwest::Error),
    Status { peer: String, code: u16 },
    Length { expected: u64, actual: u64 },
    HashMismatch { expected: String, actual: String },
    Write(std::io::Error),
    Other(String),
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPeers => write!(f, "no peers known for block"),
            Self::Http(source) => write!(f, "block request failed: {source}"),
            Self::Status { peer, code } => write!(f, "peer {peer} answered http {code}"),
            Self::Length { expected, actual } => {
                write!(f, "expected {expected} bytes, got {actual}")
            }
            Self::HashMismatch { expected, actual } => {
                write!(f, "block md5 mismatch: expected {expected}, got {actual}")
            }
            Self::Write(source) => write!(f, "failed to store block: {source}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for FetchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(source) => Some(source),
            Self::Write(source) => Some(source),
            _ => None,
        }
    }
}

/// Retrieves the raw bytes of one block. The network mechanics live behind
/// this trait so the engine can be driven by any transport.
pub trait BlockFetcher: Send + Sync {
    fn fetch<'a>(&'a self, req: &'a FetchRequest) -> FetchFuture<'a>;
}

#[derive(Debug)]
struct PeerCache {
    refreshed_at: Instant,
    peers: Vec<String>,
}

/// Fetches blocks over HTTP from other nodes' `/api/block` endpoint.
///
/// Peers come from tracker announces, refreshed every `announce_every`, plus
/// a static seed list. Requests rotate across the known peers.
pub struct HttpBlockFetcher {
    client: reqwest::Client,
    tracker: Option<TrackerClient>,
    seed_peers: Vec<String>,
    announce_every: Duration,
    peers: Mutex<HashMap<String, PeerCache>>,
    next: AtomicUsize,
}

impl HttpBlockFetcher {
    pub fn new(
        tracker: Option<TrackerClient>,
        seed_peers: Vec<String>,
        announce_every: Duration,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            tracker,
            seed_peers,
            announce_every,
            peers: Mutex::new(HashMap::new()),
            next: AtomicUsize::new(0),
        })
    }

    async fn peers_for(&self, content_hash: &str) -> Vec<String> {
        let cached = self.cached_peers(content_hash);
        let mut peers = match (cached, &self.tracker) {
            (Some(peers), _) => peers,
            (None, Some(tracker)) => match tracker.announce(content_hash).await {
                Ok(found) => {
                    let found: Vec<String> = found.into_iter().map(|p| p.addr).collect();
                    self.store_peers(content_hash, found.clone());
                    found
                }
                Err(err) => {
                    if crate::logging::warn_throttled("tracker_announce", Duration::from_secs(30)) {
                        tracing::warn!(
                            content_hash = %crate::logging::redact_hex(content_hash),
                            error = %err,
                            "tracker announce failed"
                        );
                    }
                    // Remember the failure so every worker does not re-announce.
                    self.store_peers(content_hash, Vec::new());
                    Vec::new()
                }
            },
            (None, None) => Vec::new(),
        };
        for seed in &self.seed_peers {
            if !peers.contains(seed) {
                peers.push(seed.clone());
            }
        }
        peers
    }

    fn cached_peers(&self, content_hash: &str) -> Option<Vec<String>> {
        let guard = self.lock_peers();
        let entry = guard.get(content_hash)?;
        (entry.refreshed_at.elapsed() < self.announce_every).then(|| entry.peers.clone())
    }

    /// Caches `peers` for `content_hash` and evicts every expired list, so
    /// hashes that are no longer fetched do not pile up.
    fn store_peers(&self, content_hash: &str, peers: Vec<String>) {
        let mut cache = self.lock_peers();
        cache.retain(|_, entry| entry.refreshed_at.elapsed() < self.announce_every);
        cache.insert(
            content_hash.to_string(),
            PeerCache {
                refreshed_at: Instant::now(),
                peers,
            },
        );
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerCache>> {
        match self.peers.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("peer cache lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    async fn fetch_from_peers(&self, req: &FetchRequest) -> Result<Vec<u8>, FetchFailure> {
        let peers = self.peers_for(&req.content_hash).await;
        if peers.is_empty() {
            return Err(FetchFailure::NoPeers);
        }
        let peer = &peers[self.next.fetch_add(1, Ordering::Relaxed) % peers.len()];
        let index = req.block_index.to_string();
        let resp = self
            .client
            .get(format!("http://{peer}/api/block"))
            .query(&[("infohash", req.content_hash.as_str()), ("index", index.as_str())])
            .send()
            .await
            .map_err(FetchFailure::Http)?;
        if !resp.status().is_success() {
            return Err(FetchFailure::Status {
                peer: peer.clone(),
                code: resp.status().as_u16(),
            });
        }
        let body = resp.bytes().await.map_err(FetchFailure::Http)?;
        if body.len() as u64 != req.length {
            return Err(FetchFailure::Length {
                expected: req.length,
                actual: body.len() as u64,
            });
        }
        Ok(body.to_vec())
    }
}

impl BlockFetcher for HttpBlockFetcher {
    fn fetch<'a>(&'a self, req: &'a FetchRequest) -> FetchFuture<'a> {
        Box::pin(self.fetch_from_peers(req))
    }
}
