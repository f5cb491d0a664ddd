use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, trace};

use crate::{
    bitfield::Bitfield,
    peer::{
        error::PeerError,
        handshake::Handshake,
        message::{Message, parse_frame},
    },
    torrent::{BlockInfo, Sha1Hash},
};

const READ_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    RequestPending,
    Closed,
}

/// Everything a connection needs to know about the local side.
#[derive(Debug, Clone)]
pub struct PeerParams {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    pub piece_count: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// One peer link: handshake, framing and the choke/interest state, with at
/// most one block requested at a time.
#[derive(Debug)]
pub struct PeerConnection<S = TcpStream> {
    addr: SocketAddr,
    stream: Option<S>,
    buffer: Vec<u8>,
    state: ConnectionState,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    bitfield: Option<Bitfield>,
    piece_count: usize,
    read_timeout: Duration,
    awaiting_first_message: bool,
    in_flight: Option<BlockInfo>,
    delivered: Option<Vec<u8>>,
}

impl PeerConnection<TcpStream> {
    /// Opens a TCP connection to `addr` and runs the handshake.
    pub async fn connect(addr: SocketAddr, params: &PeerParams) -> Result<Self, PeerError> {
        trace!(%addr, "connecting");
        let stream = timeout(params.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout(params.connect_timeout))??;
        Self::establish(stream, addr, params).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerConnection<S> {
    /// Runs the handshake over an already connected stream, declares
    /// interest and takes in whatever the peer sends first.
    pub async fn establish(stream: S, addr: SocketAddr, params: &PeerParams) -> Result<Self, PeerError> {
        let mut conn = PeerConnection {
            addr,
            stream: Some(stream),
            buffer: Vec::with_capacity(READ_CHUNK),
            state: ConnectionState::Handshaking,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: None,
            piece_count: params.piece_count,
            read_timeout: params.read_timeout,
            awaiting_first_message: true,
            in_flight: None,
            delivered: None,
        };

        let ours = Handshake {
            info_hash: params.info_hash,
            peer_id: params.peer_id,
        };
        conn.write_raw(&ours.serialize()).await?;

        let theirs = loop {
            if let Some((handshake, used)) = Handshake::parse(&conn.buffer)? {
                conn.buffer.drain(..used);
                break handshake;
            }
            conn.read_chunk().await?;
        };
        if theirs.info_hash != ours.info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        conn.state = ConnectionState::Ready;
        debug!(%addr, "handshake complete");

        conn.send(&Message::Interested).await?;
        conn.am_interested = true;

        conn.drain_frames()?;
        if conn.awaiting_first_message || !conn.buffer.is_empty() {
            match conn.pump().await {
                Ok(()) | Err(PeerError::Timeout(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(conn)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_choked(&self) -> bool {
        self.peer_choking
    }

    pub fn is_interested(&self) -> bool {
        self.am_interested
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn has_bitfield(&self) -> bool {
        self.bitfield.is_some()
    }

    /// Without a bitfield every piece is assumed available.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield
            .as_ref()
            .is_none_or(|bitfield| bitfield.has_piece(index as usize))
    }

    /// Requests `block` and waits for its bytes. If the peer is choking us,
    /// interest is re-declared and the connection fails unless an unchoke
    /// arrives. Any error leaves the connection closed.
    pub async fn fetch_block(&mut self, block: BlockInfo) -> Result<Vec<u8>, PeerError> {
        let result = self.request_block(block).await;
        if result.is_err() {
            self.close();
        }
        result
    }

    async fn request_block(&mut self, block: BlockInfo) -> Result<Vec<u8>, PeerError> {
        if self.state == ConnectionState::Closed {
            return Err(PeerError::Closed);
        }

        if self.peer_choking {
            self.send(&Message::Interested).await?;
            self.am_interested = true;
            self.pump().await?;
            if self.peer_choking {
                return Err(PeerError::StillChoked);
            }
        }

        self.send(&Message::Request {
            index: block.piece_index,
            begin: block.offset,
            length: block.length,
        })
        .await?;
        self.in_flight = Some(block);
        self.delivered = None;
        self.state = ConnectionState::RequestPending;

        while self.delivered.is_none() {
            self.pump().await?;
        }

        self.in_flight = None;
        self.state = ConnectionState::Ready;
        self.delivered.take().ok_or(PeerError::Closed)
    }

    /// Drops the socket. Idempotent.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(addr = %self.addr, "connection closed");
        }
        self.state = ConnectionState::Closed;
        self.in_flight = None;
        self.buffer.clear();
    }

    async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        trace!(addr = %self.addr, ?message, "send");
        self.write_raw(&message.serialize()).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        let limit = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(PeerError::Closed)?;
        timeout(limit, stream.write_all(bytes))
            .await
            .map_err(|_| PeerError::Timeout(limit))??;
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<(), PeerError> {
        let limit = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(PeerError::Closed)?;
        self.buffer.reserve(READ_CHUNK);
        let read = timeout(limit, stream.read_buf(&mut self.buffer))
            .await
            .map_err(|_| PeerError::Timeout(limit))??;
        if read == 0 {
            return Err(PeerError::Disconnected);
        }
        Ok(())
    }

    /// Reads once, handles every whole frame, and keeps reading while a
    /// partial frame is left in the buffer.
    async fn pump(&mut self) -> Result<(), PeerError> {
        loop {
            self.read_chunk().await?;
            self.drain_frames()?;
            if self.buffer.is_empty() {
                return Ok(());
            }
        }
    }

    fn drain_frames(&mut self) -> Result<(), PeerError> {
        let mut consumed = 0;
        while let Some((message, used)) = parse_frame(&self.buffer[consumed..])? {
            consumed += used;
            self.handle(message)?;
        }
        self.buffer.drain(..consumed);
        Ok(())
    }

    fn handle(&mut self, message: Message) -> Result<(), PeerError> {
        if message == Message::KeepAlive {
            return Ok(());
        }
        let first = std::mem::replace(&mut self.awaiting_first_message, false);

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                debug!(addr = %self.addr, "choked");
                self.peer_choking = true;
            }
            Message::Unchoke => {
                debug!(addr = %self.addr, "unchoked");
                self.peer_choking = false;
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => {
                if let Some(bitfield) = self.bitfield.as_mut() {
                    bitfield.set_piece(index as usize);
                }
            }
            Message::Bitfield(bytes) => {
                if !first {
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.bitfield = Some(Bitfield::from_bytes(&bytes, self.piece_count));
            }
            Message::Piece {
                index,
                begin,
                block,
            } => match self.in_flight {
                Some(wanted) if wanted.piece_index == index && wanted.offset == begin => {
                    if block.len() != wanted.length as usize {
                        return Err(PeerError::BlockLength {
                            index,
                            begin,
                            expected: wanted.length,
                            actual: block.len(),
                        });
                    }
                    self.delivered = Some(block);
                }
                _ => debug!(addr = %self.addr, index, begin, "dropping unrequested block"),
            },
            // We do not upload.
            Message::Request { .. } | Message::Cancel { .. } | Message::Port(_) => {}
            Message::Unknown { id } => return Err(PeerError::UnknownMessage(id)),
        }
        Ok(())
    }
}
