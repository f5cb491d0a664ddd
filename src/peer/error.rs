use std::{io, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer closed the connection")]
    Disconnected,

    #[error("unexpected protocol string {0:?}")]
    UnexpectedProtocol(String),

    #[error("handshake info hash does not match")]
    InfoHashMismatch,

    #[error("unknown message id {0}")]
    UnknownMessage(u8),

    #[error("malformed {kind} message ({len} byte payload)")]
    MalformedMessage { kind: &'static str, len: usize },

    #[error("bitfield received after other messages")]
    UnexpectedBitfield,

    #[error("frame length {0} exceeds the limit")]
    FrameTooLarge(usize),

    #[error("block {index}:{begin} carried {actual} bytes, requested {expected}")]
    BlockLength {
        index: u32,
        begin: u32,
        expected: u32,
        actual: usize,
    },

    #[error("peer did not unchoke us")]
    StillChoked,

    #[error("connection is closed")]
    Closed,
}

impl PeerError {
    /// Errors caused by the remote breaking the protocol, as opposed to
    /// network trouble or a clean disconnect.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PeerError::UnexpectedProtocol(_)
                | PeerError::InfoHashMismatch
                | PeerError::UnknownMessage(_)
                | PeerError::MalformedMessage { .. }
                | PeerError::UnexpectedBitfield
                | PeerError::FrameTooLarge(_)
                | PeerError::BlockLength { .. }
        )
    }
}
