pub mod connection;
pub mod error;
pub mod handshake;
pub mod message;

pub use connection::{ConnectionState, PeerConnection, PeerParams};
pub use error::PeerError;
pub use handshake::Handshake;
pub use message::{Message, MessageId};

pub const PSTR: &str = "BitTorrent protocol";
pub const PSTR_LEN: u8 = PSTR.len() as u8; // always 19
