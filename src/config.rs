use std::{path::PathBuf, time::Duration};

use rand::Rng;

/// Client identifier prefix, Azureus style.
pub const CLIENT_PREFIX: &[u8; 8] = b"-RS0100-";

/// Settings shared by discovery, connections, the scheduler and storage.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root directory for downloaded content
    pub download_dir: PathBuf,
    /// Directory holding one completion bitmap per manifest
    pub checkpoint_dir: PathBuf,
    pub peer_id: [u8; 20],
    /// Port advertised to trackers
    pub port: u16,
    pub connect_timeout: Duration,
    /// Upper bound for any single read or write on a peer socket
    pub read_timeout: Duration,
    pub tracker_timeout: Duration,
    /// Peers requested per announce
    pub numwant: u32,
    /// Wait before asking the scheduler again when a piece has no free block
    pub retry_backoff: Duration,
    /// Delay before rediscovering when a round left no peers
    pub discovery_retry: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            checkpoint_dir: PathBuf::from(".torrents_info"),
            peer_id: generate_peer_id(),
            port: 6881,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            tracker_timeout: Duration::from_secs(5),
            numwant: 75,
            retry_backoff: Duration::from_millis(250),
            discovery_retry: Duration::from_secs(15),
        }
    }
}

/// `-RS0100-` followed by twelve random decimal digits.
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::rng();
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_PREFIX);
    for byte in &mut id[8..] {
        *byte = b'0' + rng.random_range(0..10u8);
    }
    id
}
