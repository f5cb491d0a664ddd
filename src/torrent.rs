use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode_parser::{DecodeError, Value, decode_with_span};

/// Size of a SHA-1 digest, used for both the info hash and piece hashes.
pub const HASH_LEN: usize = 20;

/// Unit actually requested over the wire.
pub const BLOCK_SIZE: u32 = 16384;

pub type Sha1Hash = [u8; HASH_LEN];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not read manifest file: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest is not valid bencode: {0}")]
    Decode(#[from] DecodeError),

    #[error("manifest top level is not a dictionary")]
    NotADictionary,

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' has the wrong type")]
    WrongType(&'static str),

    #[error("field '{0}' is out of range")]
    OutOfRange(&'static str),

    #[error("field '{0}' is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("'pieces' length {0} is not a multiple of 20")]
    BadPiecesLength(usize),

    #[error("manifest lists {listed} piece hashes but {expected} pieces are needed")]
    PieceCountMismatch { listed: usize, expected: u64 },

    #[error("unsafe path segment {0:?}")]
    UnsafePath(String),

    #[error("manifest describes no content")]
    Empty,
}

/// A destination file of a multi-file manifest, relative to the download root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLayout {
    Single { length: u64 },
    Multi { files: Vec<FileEntry> },
}

/// Addresses one block of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub block_index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Parsed, validated manifest. Immutable once built.
#[derive(Debug, Clone)]
pub struct Manifest {
    info_hash: Sha1Hash,
    name: String,
    trackers: Vec<String>,
    piece_length: u64,
    total_length: u64,
    pieces: Vec<Sha1Hash>,
    layout: FileLayout,
}

pub fn sha1_digest(data: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(data);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

fn get_string(
    dict: &HashMap<Vec<u8>, Value>,
    key: &'static str,
) -> Result<String, ManifestError> {
    let bytes = dict
        .get(key.as_bytes())
        .ok_or(ManifestError::MissingField(key))?
        .as_bytes()
        .ok_or(ManifestError::WrongType(key))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ManifestError::InvalidUtf8(key))
}

fn get_u64(dict: &HashMap<Vec<u8>, Value>, key: &'static str) -> Result<u64, ManifestError> {
    let value = dict
        .get(key.as_bytes())
        .ok_or(ManifestError::MissingField(key))?
        .as_integer()
        .ok_or(ManifestError::WrongType(key))?;
    u64::try_from(value).map_err(|_| ManifestError::OutOfRange(key))
}

fn get_dict<'v>(
    dict: &'v HashMap<Vec<u8>, Value>,
    key: &'static str,
) -> Result<&'v HashMap<Vec<u8>, Value>, ManifestError> {
    dict.get(key.as_bytes())
        .ok_or(ManifestError::MissingField(key))?
        .as_dictionary()
        .ok_or(ManifestError::WrongType(key))
}

fn checked_segment(segment: &str) -> Result<&str, ManifestError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\'])
    {
        return Err(ManifestError::UnsafePath(segment.to_string()));
    }
    Ok(segment)
}

fn collect_trackers(root: &HashMap<Vec<u8>, Value>) -> Result<Vec<String>, ManifestError> {
    let mut trackers = Vec::new();
    if root.contains_key(b"announce".as_slice()) {
        trackers.push(get_string(root, "announce")?);
    }

    if let Some(tiers) = root.get(b"announce-list".as_slice()) {
        let tiers = tiers.as_list().ok_or(ManifestError::WrongType("announce-list"))?;
        for tier in tiers {
            let tier = tier.as_list().ok_or(ManifestError::WrongType("announce-list"))?;
            for url in tier {
                let url = url
                    .as_bytes()
                    .ok_or(ManifestError::WrongType("announce-list"))?;
                let url = String::from_utf8(url.to_vec())
                    .map_err(|_| ManifestError::InvalidUtf8("announce-list"))?;
                if !trackers.contains(&url) {
                    trackers.push(url);
                }
            }
        }
    }

    if trackers.is_empty() {
        return Err(ManifestError::MissingField("announce"));
    }
    Ok(trackers)
}

fn parse_files(info: &HashMap<Vec<u8>, Value>) -> Result<Option<Vec<FileEntry>>, ManifestError> {
    let Some(files) = info.get(b"files".as_slice()) else {
        return Ok(None);
    };
    let files = files.as_list().ok_or(ManifestError::WrongType("files"))?;

    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let file = file.as_dictionary().ok_or(ManifestError::WrongType("files"))?;
        let length = get_u64(file, "length")?;
        let segments = file
            .get(b"path".as_slice())
            .ok_or(ManifestError::MissingField("path"))?
            .as_list()
            .ok_or(ManifestError::WrongType("path"))?;
        if segments.is_empty() {
            return Err(ManifestError::UnsafePath(String::new()));
        }

        let mut path = PathBuf::new();
        for segment in segments {
            let segment = segment.as_bytes().ok_or(ManifestError::WrongType("path"))?;
            let segment =
                std::str::from_utf8(segment).map_err(|_| ManifestError::InvalidUtf8("path"))?;
            path.push(checked_segment(segment)?);
        }
        entries.push(FileEntry { path, length });
    }
    Ok(Some(entries))
}

impl Manifest {
    /// Parse a manifest from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Parse a manifest from its encoded bytes. The info hash is the SHA-1 of
    /// the exact `info` value bytes as they appear in `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ManifestError> {
        let located = decode_with_span(data, b"info")?;
        let info_hash = sha1_digest(&data[located.span.clone()]);

        let root = located
            .value
            .as_dictionary()
            .ok_or(ManifestError::NotADictionary)?;
        let trackers = collect_trackers(root)?;
        let info = get_dict(root, "info")?;

        let name = get_string(info, "name")?;
        checked_segment(&name)?;

        let piece_length = get_u64(info, "piece length")?;
        if piece_length == 0 || piece_length > u64::from(u32::MAX) {
            return Err(ManifestError::OutOfRange("piece length"));
        }

        let pieces_bytes = info
            .get(b"pieces".as_slice())
            .ok_or(ManifestError::MissingField("pieces"))?
            .as_bytes()
            .ok_or(ManifestError::WrongType("pieces"))?;
        if pieces_bytes.len() % HASH_LEN != 0 {
            return Err(ManifestError::BadPiecesLength(pieces_bytes.len()));
        }
        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (layout, total_length) = match parse_files(info)? {
            Some(files) => {
                let total = files
                    .iter()
                    .try_fold(0u64, |acc, f| acc.checked_add(f.length))
                    .ok_or(ManifestError::OutOfRange("length"))?;
                (FileLayout::Multi { files }, total)
            }
            None => {
                let length = get_u64(info, "length")?;
                (FileLayout::Single { length }, length)
            }
        };

        if total_length == 0 {
            return Err(ManifestError::Empty);
        }
        let expected = total_length.div_ceil(piece_length);
        if pieces.len() as u64 != expected || expected > u64::from(u32::MAX) {
            return Err(ManifestError::PieceCountMismatch {
                listed: pieces.len(),
                expected,
            });
        }

        Ok(Manifest {
            info_hash,
            name,
            trackers,
            piece_length,
            total_length,
            pieces,
            layout,
        })
    }

    pub fn info_hash(&self) -> &Sha1Hash {
        &self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Announce URLs in the order they should be tried.
    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_hash(&self, index: u32) -> Option<&Sha1Hash> {
        self.pieces.get(index as usize)
    }

    /// Length of piece `index`: the nominal piece length except for the last
    /// piece, which holds whatever remains.
    pub fn piece_len(&self, index: u32) -> u64 {
        let last = self.pieces.len() as u64 - 1;
        if u64::from(index) < last {
            self.piece_length
        } else {
            self.total_length - last * self.piece_length
        }
    }

    pub fn block_count(&self, piece_index: u32) -> u32 {
        self.piece_len(piece_index).div_ceil(u64::from(BLOCK_SIZE)) as u32
    }

    pub fn block(&self, piece_index: u32, block_index: u32) -> BlockInfo {
        let offset = block_index * BLOCK_SIZE;
        let remaining = self.piece_len(piece_index) - u64::from(offset);
        BlockInfo {
            piece_index,
            block_index,
            offset,
            length: remaining.min(u64::from(BLOCK_SIZE)) as u32,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::bencode_parser::encode;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dictionary(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }

    fn piece_hashes(content: &[u8], piece_length: usize) -> Vec<u8> {
        content
            .chunks(piece_length)
            .flat_map(|chunk| sha1_digest(chunk))
            .collect()
    }

    /// Encodes a manifest whose piece hashes match `content`. `files` empty
    /// means a single-file layout named `name`.
    pub fn manifest_bytes(
        name: &str,
        content: &[u8],
        piece_length: usize,
        files: &[(&str, u64)],
    ) -> Vec<u8> {
        let mut info = vec![
            ("name", bytes(name)),
            ("piece length", Value::Integer(piece_length as i64)),
            (
                "pieces",
                Value::Bytes(piece_hashes(content, piece_length)),
            ),
        ];
        if files.is_empty() {
            info.push(("length", Value::Integer(content.len() as i64)));
        } else {
            let list = files
                .iter()
                .map(|(path, length)| {
                    dict(vec![
                        ("length", Value::Integer(*length as i64)),
                        (
                            "path",
                            Value::List(path.split('/').map(bytes).collect()),
                        ),
                    ])
                })
                .collect();
            info.push(("files", Value::List(list)));
        }

        encode(&dict(vec![
            ("announce", bytes("http://tracker.example.com/announce")),
            ("info", dict(info)),
        ]))
    }

    pub fn manifest(
        name: &str,
        content: &[u8],
        piece_length: usize,
        files: &[(&str, u64)],
    ) -> Manifest {
        Manifest::from_bytes(&manifest_bytes(name, content, piece_length, files))
            .expect("fixture manifest is valid")
    }
}
