use crate::peer::{PSTR, PSTR_LEN, error::PeerError};
use crate::torrent::Sha1Hash;

pub const HANDSHAKE_LEN: usize = 49 + PSTR_LEN as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PSTR_LEN;
        buf[1..20].copy_from_slice(PSTR.as_bytes());
        // buf[20..28] reserved, left zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a handshake from the front of `buf`, which may hold more data.
    ///
    /// Returns `Ok(None)` until `49 + pstrlen` bytes are available, then the
    /// handshake and the number of bytes it used. Reserved bytes are ignored.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, PeerError> {
        let Some(&pstrlen) = buf.first() else {
            return Ok(None);
        };
        let pstrlen = pstrlen as usize;
        let total = 49 + pstrlen;
        if buf.len() < total {
            return Ok(None);
        }

        let pstr = &buf[1..1 + pstrlen];
        if pstr != PSTR.as_bytes() {
            return Err(PeerError::UnexpectedProtocol(
                String::from_utf8_lossy(pstr).into_owned(),
            ));
        }

        let hash_start = 1 + pstrlen + 8;
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[hash_start..hash_start + 20]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[hash_start + 20..total]);

        Ok(Some((Handshake { info_hash, peer_id }, total)))
    }
}
