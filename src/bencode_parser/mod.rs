//! Bencode, the self-describing binary format used by manifests and tracker
//! responses.

pub mod encoder;
pub mod errors;
pub mod parser;

pub use encoder::encode;
pub use errors::DecodeError;
pub use parser::{Located, Value, decode, decode_with_span};
