use thiserror::Error;

/// Reasons a bencoded buffer is rejected. Offsets are byte positions in the
/// original input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("unknown type tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("malformed integer at offset {offset}")]
    MalformedInteger { offset: usize },

    #[error("malformed byte string length at offset {offset}")]
    MalformedLength { offset: usize },

    #[error(
        "byte string at offset {offset} declares {declared} bytes but only {remaining} remain"
    )]
    LengthOverrun {
        offset: usize,
        declared: usize,
        remaining: usize,
    },

    #[error("value starting at offset {offset} is missing its terminator")]
    MissingTerminator { offset: usize },

    #[error("dictionary key at offset {offset} is not a byte string")]
    NonStringKey { offset: usize },

    #[error("duplicate dictionary key at offset {offset}")]
    DuplicateKey { offset: usize },

    #[error("nesting deeper than {limit} levels at offset {offset}")]
    NestingTooDeep { limit: usize, offset: usize },

    #[error("trailing data after top-level value at offset {offset}")]
    TrailingData { offset: usize },

    #[error("key {0:?} not found in input")]
    KeyNotFound(String),
}
