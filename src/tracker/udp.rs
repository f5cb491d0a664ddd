//! UDP tracker protocol (BEP 15): a connect exchange followed by one announce.

use std::net::SocketAddr;

use rand::Rng as _;
use tokio::{net::UdpSocket, time::timeout};
use tracing::debug;
use url::Url;

use crate::{
    torrent::Manifest,
    tracker::{AnnounceParams, TrackerError, parse_compact_peers},
};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const ATTEMPTS: u32 = 2;

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

async fn resolve(url: &Url) -> Result<SocketAddr, TrackerError> {
    let host = url
        .host_str()
        .ok_or_else(|| TrackerError::Unresolved(url.to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| TrackerError::Unresolved(url.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .next()
        .ok_or_else(|| TrackerError::Unresolved(host.to_string()))
}

/// Sends `request` and waits for a reply of at least `min_len` bytes, sending
/// again once if nothing arrives in time.
async fn exchange(
    socket: &UdpSocket,
    request: &[u8],
    min_len: usize,
    params: &AnnounceParams,
) -> Result<Vec<u8>, TrackerError> {
    let mut buf = vec![0u8; 2048];
    for _ in 0..ATTEMPTS {
        socket.send(request).await?;
        match timeout(params.timeout, socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= min_len => return Ok(buf[..n].to_vec()),
            Ok(Ok(n)) if n >= 8 && read_u32(&buf, 0) == ACTION_ERROR => {
                return Err(TrackerError::Rejected(
                    String::from_utf8_lossy(&buf[8..n]).into_owned(),
                ));
            }
            Ok(Ok(_)) => return Err(TrackerError::Malformed("short UDP reply")),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
    Err(TrackerError::Timeout(params.timeout))
}

fn check_header(reply: &[u8], action: u32, transaction_id: u32) -> Result<(), TrackerError> {
    let got = read_u32(reply, 0);
    if got == ACTION_ERROR {
        return Err(TrackerError::Rejected(
            String::from_utf8_lossy(&reply[8..]).into_owned(),
        ));
    }
    if got != action {
        return Err(TrackerError::Malformed("unexpected UDP action"));
    }
    if read_u32(reply, 4) != transaction_id {
        return Err(TrackerError::Malformed("transaction id mismatch"));
    }
    Ok(())
}

pub fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    manifest: &Manifest,
    params: &AnnounceParams,
) -> Vec<u8> {
    let mut request = Vec::with_capacity(98);
    request.extend_from_slice(&connection_id.to_be_bytes());
    request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request.extend_from_slice(manifest.info_hash());
    request.extend_from_slice(&params.peer_id);
    request.extend_from_slice(&0u64.to_be_bytes()); // downloaded
    request.extend_from_slice(&manifest.total_length().to_be_bytes()); // left
    request.extend_from_slice(&0u64.to_be_bytes()); // uploaded
    request.extend_from_slice(&0u32.to_be_bytes()); // event: none
    request.extend_from_slice(&0u32.to_be_bytes()); // ip: sender's
    request.extend_from_slice(&key.to_be_bytes());
    request.extend_from_slice(&params.numwant.to_be_bytes());
    request.extend_from_slice(&params.port.to_be_bytes());
    request
}

pub async fn announce(
    url: &Url,
    manifest: &Manifest,
    params: &AnnounceParams,
) -> Result<Vec<SocketAddr>, TrackerError> {
    let addr = resolve(url).await?;
    let bind: SocketAddr = if addr.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    debug!(%addr, "UDP announce");

    let transaction_id: u32 = rand::rng().random();
    let mut connect = Vec::with_capacity(16);
    connect.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    connect.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    connect.extend_from_slice(&transaction_id.to_be_bytes());

    let reply = exchange(&socket, &connect, 16, params).await?;
    check_header(&reply, ACTION_CONNECT, transaction_id)?;
    let mut connection_id = [0u8; 8];
    connection_id.copy_from_slice(&reply[8..16]);
    let connection_id = u64::from_be_bytes(connection_id);

    let transaction_id: u32 = rand::rng().random();
    let key: u32 = rand::rng().random();
    let request = announce_request(connection_id, transaction_id, key, manifest, params);
    let reply = exchange(&socket, &request, 20, params).await?;
    check_header(&reply, ACTION_ANNOUNCE, transaction_id)?;

    parse_compact_peers(&reply[20..])
}
