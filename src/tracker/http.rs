use std::net::{IpAddr, SocketAddr};

use once_cell::sync::Lazy;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::{
    bencode_parser::{Value, decode},
    torrent::Manifest,
    tracker::{AnnounceParams, TrackerError, parse_compact_peers},
};

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("rs_swarm/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
});

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

/// Appends the announce query to `announce`, keeping any query it already has.
pub fn build_tracker_url(announce: &Url, manifest: &Manifest, params: &AnnounceParams) -> Url {
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&no_peer_id=1&numwant={}",
        encode_bytes(manifest.info_hash()),
        encode_bytes(&params.peer_id),
        params.port,
        manifest.total_length(),
        params.numwant,
    );

    let mut url = announce.clone();
    let full = match announce.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
        _ => query,
    };
    url.set_query(Some(&full));
    url
}

pub async fn announce(
    announce: &Url,
    manifest: &Manifest,
    params: &AnnounceParams,
) -> Result<Vec<SocketAddr>, TrackerError> {
    let url = build_tracker_url(announce, manifest, params);
    debug!(%url, "HTTP announce");

    let response = HTTP_CLIENT
        .get(url)
        .timeout(params.timeout)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(TrackerError::Status(response.status()));
    }
    let body = response.bytes().await?;
    parse_announce_response(&body)
}

/// Extracts peers from a bencoded announce response. Both the compact string
/// form and the list of `{ip, port}` dictionaries are accepted.
pub fn parse_announce_response(body: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    let value = decode(body)?;
    let dict = value
        .as_dictionary()
        .ok_or(TrackerError::Malformed("response is not a dictionary"))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()) {
        let reason = reason.as_bytes().unwrap_or_default();
        return Err(TrackerError::Rejected(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    match dict.get(b"peers".as_slice()) {
        Some(Value::Bytes(compact)) => parse_compact_peers(compact),
        Some(Value::List(entries)) => entries.iter().map(peer_from_dict).collect(),
        Some(_) => Err(TrackerError::Malformed("peers has the wrong type")),
        None => Err(TrackerError::Malformed("missing peers")),
    }
}

fn peer_from_dict(entry: &Value) -> Result<SocketAddr, TrackerError> {
    let ip = entry
        .get(b"ip")
        .and_then(Value::as_bytes)
        .ok_or(TrackerError::Malformed("peer entry without ip"))?;
    let ip: IpAddr = std::str::from_utf8(ip)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(TrackerError::Malformed("peer ip is not an address"))?;
    let port = entry
        .get(b"port")
        .and_then(Value::as_integer)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or(TrackerError::Malformed("peer entry without valid port"))?;
    Ok(SocketAddr::new(ip, port))
}
