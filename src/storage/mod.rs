//! Piece-to-file mapping and the resumable completion checkpoint.
//!
//! Destination files are pre-sized when the writer is opened so every piece
//! can be written in place with a seek. Files are opened per operation.

pub mod checkpoint;
pub mod layout;

use std::{
    fs::{self, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::torrent::Manifest;
pub use checkpoint::Checkpoint;
pub use layout::{FileSpan, Layout, TargetFile};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("piece {0} is out of range")]
    PieceOutOfRange(u32),

    #[error("piece {index} is {actual} bytes, expected {expected}")]
    LengthMismatch {
        index: u32,
        expected: u64,
        actual: usize,
    },
}

pub(crate) fn io_error(path: &Path) -> impl Fn(io::Error) -> StorageError + use<> {
    let path = path.to_path_buf();
    move |source| StorageError::Io {
        path: path.clone(),
        source,
    }
}

/// Writes verified pieces into their destination files and records them in
/// the checkpoint.
#[derive(Debug)]
pub struct PieceWriter {
    layout: Layout,
    checkpoint: Checkpoint,
    piece_length: u64,
    piece_sizes: Vec<u64>,
}

impl PieceWriter {
    /// Allocates every destination file under `download_dir` and opens the
    /// checkpoint under `checkpoint_dir`.
    ///
    /// # Errors
    /// Any failure to create directories, size files or read the checkpoint.
    pub fn open(
        manifest: &Manifest,
        download_dir: &Path,
        checkpoint_dir: &Path,
    ) -> Result<Self, StorageError> {
        let layout = Layout::resolve(manifest, download_dir);
        let mut rebuilt = false;
        for file in layout.files() {
            rebuilt |= allocate(file)?;
        }
        if rebuilt {
            debug!("destination files were (re)allocated, checkpoint starts clear");
        }

        let checkpoint = Checkpoint::open(
            checkpoint_dir.join(manifest.info_hash_hex()),
            manifest.piece_count(),
            rebuilt,
        )?;

        let piece_sizes = (0..manifest.piece_count() as u32)
            .map(|i| manifest.piece_len(i))
            .collect();

        Ok(PieceWriter {
            layout,
            checkpoint,
            piece_length: manifest.piece_length(),
            piece_sizes,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Pieces not yet recorded as durably written.
    pub fn incomplete_pieces(&self) -> Result<Vec<u32>, StorageError> {
        self.checkpoint.incomplete()
    }

    /// Writes a verified piece and then marks it complete. The checkpoint bit
    /// is only set once the piece bytes are flushed.
    pub fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        let expected = *self
            .piece_sizes
            .get(index as usize)
            .ok_or(StorageError::PieceOutOfRange(index))?;
        if data.len() as u64 != expected {
            return Err(StorageError::LengthMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }

        self.write_range(u64::from(index) * self.piece_length, data)?;
        self.checkpoint.mark(index)?;
        debug!(piece = index, bytes = data.len(), "piece persisted");
        Ok(())
    }

    /// Writes `data` at absolute content offset `start`, split across files.
    pub fn write_range(&self, start: u64, data: &[u8]) -> Result<(), StorageError> {
        for span in self.layout.spans(start, data.len()) {
            let path = &self.layout.files()[span.file_index].path;
            let io = io_error(path);
            let mut file = OpenOptions::new().write(true).open(path).map_err(&io)?;
            file.seek(SeekFrom::Start(span.file_offset)).map_err(&io)?;
            file.write_all(&data[span.data_range]).map_err(&io)?;
            file.sync_data().map_err(&io)?;
        }
        Ok(())
    }
}

/// Makes sure `file` exists at its final length. Returns true when the file
/// had to be created or resized.
fn allocate(file: &TargetFile) -> Result<bool, StorageError> {
    if let Some(parent) = file.path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let io = io_error(&file.path);
    match fs::metadata(&file.path) {
        Ok(meta) if meta.len() == file.length => Ok(false),
        Ok(meta) => {
            warn!(
                path = %file.path.display(),
                found = meta.len(),
                expected = file.length,
                "destination file has the wrong size, resizing"
            );
            let handle = OpenOptions::new().write(true).open(&file.path).map_err(&io)?;
            handle.set_len(file.length).map_err(&io)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %file.path.display(), length = file.length, "allocating destination file");
            let handle = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&file.path)
                .map_err(&io)?;
            handle.set_len(file.length).map_err(&io)?;
            Ok(true)
        }
        Err(e) => Err(io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::fixtures::manifest;
    use assert_matches::assert_matches;

    struct Dirs {
        _root: tempfile::TempDir,
        downloads: PathBuf,
        state: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempfile::tempdir().unwrap();
        Dirs {
            downloads: root.path().join("downloads"),
            state: root.path().join(".torrents_info"),
            _root: root,
        }
    }

    #[test]
    fn test_allocation_presizes_files_and_checkpoint() {
        let d = dirs();
        let m = manifest("set", &[0u8; 8], 4, &[("a", 5), ("sub/b", 3)]);
        let writer = PieceWriter::open(&m, &d.downloads, &d.state).unwrap();

        assert_eq!(fs::metadata(d.downloads.join("set/a")).unwrap().len(), 5);
        assert_eq!(fs::metadata(d.downloads.join("set/sub/b")).unwrap().len(), 3);
        assert_eq!(
            writer.checkpoint().path(),
            d.state.join(m.info_hash_hex()).as_path()
        );
        assert_eq!(fs::read(writer.checkpoint().path()).unwrap(), vec![0]);
        assert_eq!(writer.incomplete_pieces().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_single_piece_single_file() {
        let d = dirs();
        let content = b"0123456789";
        let m = manifest("ten.bin", content, 10, &[]);
        let writer = PieceWriter::open(&m, &d.downloads, &d.state).unwrap();

        writer.write_piece(0, content).unwrap();
        assert_eq!(fs::read(d.downloads.join("ten.bin")).unwrap(), content);
        assert_eq!(fs::read(writer.checkpoint().path()).unwrap(), vec![0x80]);
        assert!(writer.incomplete_pieces().unwrap().is_empty());
    }

    #[test]
    fn test_range_split_across_two_files() {
        let d = dirs();
        let m = manifest("set", &[0u8; 8], 4, &[("a", 5), ("b", 3)]);
        let writer = PieceWriter::open(&m, &d.downloads, &d.state).unwrap();

        writer.write_range(3, b"VWXYZ").unwrap();
        assert_eq!(fs::read(d.downloads.join("set/a")).unwrap(), b"\0\0\0VW");
        assert_eq!(fs::read(d.downloads.join("set/b")).unwrap(), b"XYZ");
    }

    #[test]
    fn test_straddling_piece_then_resume_list() {
        let d = dirs();
        let content = b"ABCDEFGH";
        let m = manifest("set", content, 4, &[("a", 5), ("b", 3)]);
        let writer = PieceWriter::open(&m, &d.downloads, &d.state).unwrap();

        writer.write_piece(1, &content[4..]).unwrap();
        assert_eq!(fs::read(d.downloads.join("set/a")).unwrap(), b"\0\0\0\0E");
        assert_eq!(fs::read(d.downloads.join("set/b")).unwrap(), b"FGH");
        assert_eq!(writer.incomplete_pieces().unwrap(), vec![0]);

        // Reopening keeps the files and the checkpoint.
        let reopened = PieceWriter::open(&m, &d.downloads, &d.state).unwrap();
        assert_eq!(reopened.incomplete_pieces().unwrap(), vec![0]);
        assert_eq!(fs::read(d.downloads.join("set/b")).unwrap(), b"FGH");
    }

    #[test]
    fn test_missing_destination_resets_checkpoint() {
        let d = dirs();
        let content = b"0123456789";
        let m = manifest("ten.bin", content, 5, &[]);
        let writer = PieceWriter::open(&m, &d.downloads, &d.state).unwrap();
        writer.write_piece(0, &content[..5]).unwrap();

        fs::remove_file(d.downloads.join("ten.bin")).unwrap();
        let reopened = PieceWriter::open(&m, &d.downloads, &d.state).unwrap();
        assert_eq!(reopened.incomplete_pieces().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_rejects_wrong_piece_length() {
        let d = dirs();
        let m = manifest("ten.bin", &[1u8; 10], 10, &[]);
        let writer = PieceWriter::open(&m, &d.downloads, &d.state).unwrap();
        assert_matches!(
            writer.write_piece(0, &[1u8; 9]),
            Err(StorageError::LengthMismatch {
                index: 0,
                expected: 10,
                actual: 9
            })
        );
        assert_matches!(writer.write_piece(1, &[]), Err(StorageError::PieceOutOfRange(1)));
        assert_eq!(writer.incomplete_pieces().unwrap(), vec![0]);
    }
}
