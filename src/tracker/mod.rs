//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - Announce requests and responses
//! - Peer parsing (compact and non-compact)
//! - The binary fallback parse for trackers whose replies do not decode as
//!   bencode
//! - Peer ID generation and URL encoding helpers
//!
//! Used by the client to discover peers for a torrent.
use crate::bencode::{self, BencodeValue};
use crate::torrent::file::TorrentFile;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Re-announce interval used until the tracker supplies one.
pub const DEFAULT_INTERVAL: u64 = 1800;

/// Consecutive failed announce rounds tolerated before the announce task
/// gives up. Peers already connected keep downloading.
const MAX_FAILED_ROUNDS: u32 = 8;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Url Parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Tracker returned failure: {0}")]
    Failure(String),

    #[error("Unparseable tracker response: {0}")]
    InvalidResponse(&'static str),

    #[error("No announce URL produced a usable response")]
    AllTrackersFailed,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Progress counters reported on every announce. Published by the reactor
/// over a watch channel; the announce task reads the latest snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

/// Announce event, sent as the `event` query parameter. Periodic
/// re-announces carry no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
    Periodic,
}

impl Event {
    fn as_param(&self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Completed => Some("completed"),
            Event::Stopped => Some("stopped"),
            Event::Periodic => None,
        }
    }
}

/// Contains the parsed response from a tracker.
#[derive(Debug, Default)]
pub struct AnnounceResponse {
    pub interval: Option<i64>,
    pub min_interval: Option<i64>,
    pub tracker_id: Option<Vec<u8>>,
    pub complete: Option<i64>,
    pub incomplete: Option<i64>,
    pub warning: Option<String>,
    /// Peers the client can connect to.
    pub peers: Vec<SocketAddr>,
}

// Represents a client communicating with a bittorrent tracker
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Self {
            peer_id: generate_peer_id(),
            port,
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Announces to the torrent's trackers and returns the first usable
    /// response.
    ///
    /// URLs are tried in `announce-list` tier order, falling back to the
    /// plain `announce` URL when no list is present. A tracker that fails
    /// (transport error or a bencoded `failure reason`) is skipped and the
    /// next URL is tried.
    #[tracing::instrument(skip(self, torrent, stats), level = "debug")]
    pub async fn announce(
        &self,
        torrent: &TorrentFile,
        stats: Stats,
        event: Event,
    ) -> TrackerResult<AnnounceResponse> {
        let mut urls: Vec<&str> = Vec::new();
        for tier in &torrent.announce_list {
            for url in tier {
                urls.push(url);
            }
        }
        if urls.is_empty() {
            urls.push(&torrent.announce);
        }

        for announce_url in urls {
            match self
                .announce_url(announce_url, torrent.info_hash, stats, event)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(url = announce_url, error = %e, "announce failed, trying next tracker");
                }
            }
        }
        Err(TrackerError::AllTrackersFailed)
    }

    /// Sends one announce GET to a single tracker URL.
    async fn announce_url(
        &self,
        announce: &str,
        info_hash: [u8; 20],
        stats: Stats,
        event: Event,
    ) -> TrackerResult<AnnounceResponse> {
        // The info_hash and peer_id parameters are raw bytes and must be
        // percent-encoded by hand; reqwest's query builder would encode the
        // percent signs a second time.
        let base = url::Url::parse(announce)?;
        let separator = if base.query().is_some() { '&' } else { '?' };
        let mut query = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            announce,
            separator,
            url_encode(&info_hash),
            url_encode(&self.peer_id),
            self.port,
            stats.uploaded,
            stats.downloaded,
            stats.left,
        );
        if let Some(event_param) = event.as_param() {
            query.push_str("&event=");
            query.push_str(event_param);
        }

        debug!(url = %query, "making announce request to tracker");
        let response = reqwest::get(query).await?;
        let response_bytes = response.bytes().await?;
        parse_announce_response(&response_bytes)
    }
}

/// Parses the response from a BitTorrent tracker announce request.
///
/// The response is normally a bencoded dictionary; both peer list shapes
/// are accepted:
/// - **Compact format**: the "peers" value is a byte string where each peer
///   is 6 bytes (4-byte IPv4 address and 2-byte port, network byte order).
/// - **Non-compact format**: the "peers" value is a list of dictionaries,
///   each containing "ip" and "port".
///
/// Some trackers emit responses that are not valid bencode at all; those
/// fall back to [`parse_binary_response`], which scans for the known keys
/// as literal substrings.
pub fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let value = match bencode::decode(bytes) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "response is not bencode, trying binary parse");
            return parse_binary_response(bytes);
        }
    };

    let dict = value
        .as_dict()
        .ok_or(TrackerError::InvalidResponse("response is not a dictionary"))?;

    if let Some(reason) = dict.get(b"failure reason") {
        let text = reason
            .as_str()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_else(|| "unspecified".to_string());
        return Err(TrackerError::Failure(text));
    }

    let peers = match dict.get(b"peers") {
        // Compact: each peer is 6 bytes (4 for IP, 2 for port)
        Some(BencodeValue::String(bytes)) => parse_compact_peers(bytes)?,
        // Non-compact: each peer is a dictionary with "ip" and "port"
        Some(BencodeValue::List(entries)) => {
            let mut peers = Vec::new();
            for entry in entries {
                let Some(peer) = entry.as_dict() else {
                    continue;
                };
                let ip = peer
                    .get(b"ip")
                    .and_then(|v| v.as_str())
                    .and_then(|s| std::str::from_utf8(s).ok())
                    .and_then(|s| s.parse::<IpAddr>().ok());
                let port = peer
                    .get(b"port")
                    .and_then(|v| v.as_int())
                    .and_then(|p| u16::try_from(p).ok());
                if let (Some(ip), Some(port)) = (ip, port) {
                    peers.push(SocketAddr::new(ip, port));
                }
            }
            peers
        }
        _ => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: dict.get(b"interval").and_then(|v| v.as_int()),
        min_interval: dict.get(b"min interval").and_then(|v| v.as_int()),
        tracker_id: dict
            .get(b"tracker id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_vec()),
        complete: dict.get(b"complete").and_then(|v| v.as_int()),
        incomplete: dict.get(b"incomplete").and_then(|v| v.as_int()),
        warning: dict
            .get(b"warning message")
            .and_then(|v| v.as_str())
            .map(|s| String::from_utf8_lossy(s).into_owned()),
        peers,
    })
}

/// Decodes the compact peer encoding: a byte string whose length is a
/// multiple of 6, each chunk a 4-byte IPv4 address and a 2-byte port, both
/// big-endian.
fn parse_compact_peers(bytes: &[u8]) -> TrackerResult<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidResponse(
            "compact peers length not a multiple of 6",
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

/// Last-resort parse for trackers whose response does not decode as
/// bencode: each known key is located as a literal substring (with its
/// bencode length prefix, which disambiguates "interval" from
/// "min interval" and "complete" from "incomplete") and its value parsed
/// according to its expected type.
fn parse_binary_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
            .map(|pos| pos + needle.len())
    }

    fn int_after(bytes: &[u8], key: &[u8]) -> Option<i64> {
        let mut pos = find(bytes, key)?;
        if bytes.get(pos) != Some(&b'i') {
            return None;
        }
        pos += 1;
        let mut digits = String::new();
        while let Some(&byte) = bytes.get(pos) {
            if byte == b'e' {
                return digits.parse().ok();
            }
            digits.push(byte as char);
            pos += 1;
        }
        None
    }

    fn str_after<'a>(bytes: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
        let mut pos = find(bytes, key)?;
        let mut length = 0usize;
        while let Some(&byte) = bytes.get(pos) {
            match byte {
                b'0'..=b'9' => {
                    length = length.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
                    pos += 1;
                }
                b':' => {
                    pos += 1;
                    return bytes.get(pos..pos + length);
                }
                _ => return None,
            }
        }
        None
    }

    let peers = str_after(bytes, b"5:peers")
        .map(parse_compact_peers)
        .transpose()?
        .unwrap_or_default();

    let response = AnnounceResponse {
        interval: int_after(bytes, b"8:interval"),
        min_interval: int_after(bytes, b"12:min interval"),
        tracker_id: str_after(bytes, b"10:tracker id").map(|s| s.to_vec()),
        complete: int_after(bytes, b"8:complete"),
        incomplete: int_after(bytes, b"10:incomplete"),
        warning: str_after(bytes, b"15:warning message")
            .map(|s| String::from_utf8_lossy(s).into_owned()),
        peers,
    };

    if response.interval.is_none() && response.peers.is_empty() {
        return Err(TrackerError::InvalidResponse(
            "no recognizable keys in binary response",
        ));
    }
    Ok(response)
}

/// Generates a unique peer ID for this client.
///
/// The peer ID follows the common azureus-style convention: an 8-byte
/// client prefix ("-PC0001-") followed by 12 random ASCII digits.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-PC0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    for byte in peer_id[prefix.len()..].iter_mut() {
        *byte = b'0' + rng.random_range(0..10u8);
    }
    peer_id
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// Unreserved characters (a-z, A-Z, 0-9, -, ., _, ~) are left as-is, all
/// other bytes become %XX.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

/// Periodic announce task.
///
/// Announces `started`, then re-announces every interval the tracker asks
/// for, pushing discovered peer addresses into `addr_tx`. Announces
/// `completed` once the stats snapshot reports nothing left, and `stopped`
/// on shutdown. Announce failures back off exponentially up to the default
/// interval.
#[tracing::instrument(skip_all)]
pub async fn run_announcer(
    client: Client,
    torrent: Arc<TorrentFile>,
    addr_tx: mpsc::Sender<SocketAddr>,
    mut stats_rx: watch::Receiver<Stats>,
    shutdown: CancellationToken,
) {
    let mut interval = Duration::from_secs(DEFAULT_INTERVAL);
    let mut backoff = Duration::from_secs(5);
    let mut failed_rounds = 0u32;
    let mut completed_sent = false;

    let mut pending_event = Event::Started;
    loop {
        let stats = *stats_rx.borrow();
        match client.announce(&torrent, stats, pending_event).await {
            Ok(response) => {
                failed_rounds = 0;
                if let Some(warning) = &response.warning {
                    warn!(warning = %warning, "tracker warning");
                }
                if let Some(secs) = response.interval.filter(|&secs| secs > 0) {
                    interval = Duration::from_secs(secs as u64);
                }
                info!(
                    peers = response.peers.len(),
                    interval = interval.as_secs(),
                    "announce ok"
                );
                for addr in response.peers {
                    if addr_tx.send(addr).await.is_err() {
                        // reactor is gone, nothing left to do
                        return;
                    }
                }
                backoff = Duration::from_secs(5);
                pending_event = Event::Periodic;
            }
            Err(e) => {
                failed_rounds += 1;
                if failed_rounds >= MAX_FAILED_ROUNDS {
                    warn!(error = %e, rounds = failed_rounds, "giving up on the tracker");
                    return;
                }
                warn!(error = %e, retry_in = backoff.as_secs(), "announce round failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(DEFAULT_INTERVAL));
                continue;
            }
        }

        // Wait out the interval, but wake early for shutdown or for the
        // moment the download completes (to send the `completed` event).
        let deadline = tokio::time::sleep(interval);
        tokio::pin!(deadline);
        let mut stats_closed = false;
        let stop = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break true,
                _ = &mut deadline => break false,
                changed = stats_rx.changed(), if !stats_closed => {
                    if changed.is_err() {
                        stats_closed = true;
                        continue;
                    }
                    if !completed_sent && stats_rx.borrow().left == 0 {
                        completed_sent = true;
                        pending_event = Event::Completed;
                        break false;
                    }
                }
            }
        };
        if stop {
            break;
        }
    }

    // Best-effort goodbye so the tracker can drop us from the swarm.
    let stats = *stats_rx.borrow();
    if let Err(e) = client.announce(&torrent, stats, Event::Stopped).await {
        debug!(error = %e, "stopped announce failed");
    }
}
