//! Peer discovery through the trackers listed in a manifest.

pub mod http;
pub mod udp;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{bencode_parser::DecodeError, config::ClientConfig, torrent::Manifest};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported tracker scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker answered with HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error("tracker response is not valid bencode: {0}")]
    Decode(#[from] DecodeError),

    #[error("malformed tracker response: {0}")]
    Malformed(&'static str),

    #[error("tracker refused the announce: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("could not resolve tracker host {0}")]
    Unresolved(String),
}

/// Source of peer endpoints. Failures are absorbed: an implementation that
/// finds nothing returns an empty list.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self, manifest: &Manifest) -> Vec<SocketAddr>;
}

/// What we tell a tracker about ourselves.
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub peer_id: [u8; 20],
    pub port: u16,
    pub numwant: u32,
    pub timeout: Duration,
}

/// Announces to each tracker of the manifest in order and keeps the first
/// non-empty peer list.
#[derive(Debug, Clone)]
pub struct TrackerDiscovery {
    params: AnnounceParams,
}

impl TrackerDiscovery {
    pub fn new(params: AnnounceParams) -> Self {
        TrackerDiscovery { params }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(AnnounceParams {
            peer_id: config.peer_id,
            port: config.port,
            numwant: config.numwant,
            timeout: config.tracker_timeout,
        })
    }

    /// Announces to a single tracker, picking the transport from the URL.
    pub async fn announce(
        &self,
        announce: &str,
        manifest: &Manifest,
    ) -> Result<Vec<SocketAddr>, TrackerError> {
        let url = url::Url::parse(announce)?;
        match url.scheme() {
            "http" | "https" => http::announce(&url, manifest, &self.params).await,
            "udp" => udp::announce(&url, manifest, &self.params).await,
            other => Err(TrackerError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[async_trait]
impl Discovery for TrackerDiscovery {
    async fn discover(&self, manifest: &Manifest) -> Vec<SocketAddr> {
        for announce in manifest.trackers() {
            match self.announce(announce, manifest).await {
                Ok(peers) if !peers.is_empty() => {
                    info!(tracker = %announce, count = peers.len(), "tracker returned peers");
                    return peers;
                }
                Ok(_) => debug!(tracker = %announce, "tracker returned no peers"),
                Err(e) => warn!(tracker = %announce, error = %e, "announce failed"),
            }
        }
        warn!("no tracker returned any peers");
        Vec::new()
    }
}

/// Decodes the compact peer format: 4 address bytes and a big-endian port per
/// peer.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::Malformed("compact peer list length"));
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
