use crate::peer::error::PeerError;

/// Largest accepted length prefix: a 1 MiB block plus the piece header.
pub const MAX_FRAME_LEN: usize = (1 << 20) + 13;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            other => Err(other),
        }
    }
}

/// A decoded wire message. Ids outside 0..=9 decode to `Unknown` so the
/// connection can treat them as a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Unknown { id: u8 },
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn expect_len(kind: &'static str, payload: &[u8], len: usize) -> Result<(), PeerError> {
    if payload.len() != len {
        return Err(PeerError::MalformedMessage {
            kind,
            len: payload.len(),
        });
    }
    Ok(())
}

fn triple(kind: &'static str, payload: &[u8]) -> Result<(u32, u32, u32), PeerError> {
    expect_len(kind, payload, 12)?;
    Ok((
        be_u32(&payload[0..4]),
        be_u32(&payload[4..8]),
        be_u32(&payload[8..12]),
    ))
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Unknown { .. } => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have(_) => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
        };
        Some(id)
    }

    /// Length-prefixed wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::KeepAlive => return vec![0, 0, 0, 0],
            Message::Unknown { id } => {
                let mut buf = 1u32.to_be_bytes().to_vec();
                buf.push(*id);
                return buf;
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have(index) => payload.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bits) => payload.extend_from_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            Message::Port(port) => payload.extend_from_slice(&port.to_be_bytes()),
        }

        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        // Every arm that reaches here has an id.
        buf.push(self.id().map_or(0, |id| id as u8));
        buf.extend_from_slice(&payload);
        buf
    }

    fn from_parts(id: u8, payload: &[u8]) -> Result<Self, PeerError> {
        let Ok(kind) = MessageId::try_from(id) else {
            return Ok(Message::Unknown { id });
        };
        let message = match kind {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                expect_len("have", payload, 4)?;
                Message::Have(be_u32(payload))
            }
            MessageId::Bitfield => Message::Bitfield(payload.to_vec()),
            MessageId::Request => {
                let (index, begin, length) = triple("request", payload)?;
                Message::Request {
                    index,
                    begin,
                    length,
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(PeerError::MalformedMessage {
                        kind: "piece",
                        len: payload.len(),
                    });
                }
                Message::Piece {
                    index: be_u32(&payload[0..4]),
                    begin: be_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                }
            }
            MessageId::Cancel => {
                let (index, begin, length) = triple("cancel", payload)?;
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
            MessageId::Port => {
                expect_len("port", payload, 2)?;
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
        };
        Ok(message)
    }
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete, otherwise the
/// message and the number of bytes it occupied.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Message, usize)>, PeerError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = be_u32(buf) as usize;
    if len == 0 {
        return Ok(Some((Message::KeepAlive, 4)));
    }
    if len > MAX_FRAME_LEN {
        return Err(PeerError::FrameTooLarge(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }

    let message = Message::from_parts(buf[4], &buf[5..4 + len])?;
    Ok(Some((message, 4 + len)))
}
