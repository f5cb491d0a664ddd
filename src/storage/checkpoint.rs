use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::bitfield::Bitfield;
use crate::storage::{StorageError, io_error};

/// Completion bitmap persisted one bit per piece, MSB first.
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    piece_count: usize,
}

impl Checkpoint {
    /// Opens the bitmap at `path`, creating it all-clear if it is absent, has
    /// the wrong size, or `reset` is set.
    pub fn open(path: PathBuf, piece_count: usize, reset: bool) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let expected = piece_count.div_ceil(8) as u64;
        let current = fs::metadata(&path).ok().map(|meta| meta.len());
        match current {
            Some(len) if len == expected && !reset => {
                debug!(path = %path.display(), "resuming from existing checkpoint");
            }
            Some(len) => {
                if len != expected {
                    warn!(
                        path = %path.display(),
                        len, expected, "checkpoint has the wrong size, starting over"
                    );
                }
                write_clear(&path, expected)?;
            }
            None => write_clear(&path, expected)?,
        }

        Ok(Checkpoint { path, piece_count })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Bitfield, StorageError> {
        let bytes = fs::read(&self.path).map_err(io_error(&self.path))?;
        Ok(Bitfield::from_bytes(&bytes, self.piece_count))
    }

    /// Pieces whose bit is clear, ascending.
    pub fn incomplete(&self) -> Result<Vec<u32>, StorageError> {
        Ok(self.load()?.missing().map(|i| i as u32).collect())
    }

    /// Sets the bit for `index` with a read-modify-write of its byte, then
    /// flushes to disk.
    pub fn mark(&self, index: u32) -> Result<(), StorageError> {
        if index as usize >= self.piece_count {
            return Err(StorageError::PieceOutOfRange(index));
        }
        let byte_index = u64::from(index / 8);
        let mask = 1u8 << (7 - index % 8);

        let io = io_error(&self.path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(&io)?;
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(byte_index)).map_err(&io)?;
        file.read_exact(&mut byte).map_err(&io)?;
        byte[0] |= mask;
        file.seek(SeekFrom::Start(byte_index)).map_err(&io)?;
        file.write_all(&byte).map_err(&io)?;
        file.sync_data().map_err(&io)?;
        Ok(())
    }
}

fn write_clear(path: &Path, len: u64) -> Result<(), StorageError> {
    let io = io_error(path);
    let mut file = File::create(path).map_err(&io)?;
    file.write_all(&vec![0u8; len as usize]).map_err(&io)?;
    file.sync_all().map_err(&io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_new_checkpoint_is_clear() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::open(dir.path().join("state/abc"), 10, false).unwrap();
        assert_eq!(fs::read(checkpoint.path()).unwrap(), vec![0, 0]);
        assert_eq!(checkpoint.incomplete().unwrap(), (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn test_mark_sets_single_bit() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::open(dir.path().join("c"), 10, false).unwrap();
        checkpoint.mark(0).unwrap();
        checkpoint.mark(9).unwrap();
        assert_eq!(fs::read(checkpoint.path()).unwrap(), vec![0x80, 0x40]);
        assert_eq!(
            checkpoint.incomplete().unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_matches!(checkpoint.mark(10), Err(StorageError::PieceOutOfRange(10)));
    }

    #[test]
    fn test_reopen_resumes_unless_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c");
        Checkpoint::open(path.clone(), 4, false).unwrap().mark(2).unwrap();

        let resumed = Checkpoint::open(path.clone(), 4, false).unwrap();
        assert_eq!(resumed.incomplete().unwrap(), vec![0, 1, 3]);

        let reset = Checkpoint::open(path, 4, true).unwrap();
        assert_eq!(reset.incomplete().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_wrong_size_checkpoint_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c");
        fs::write(&path, [0xFF; 5]).unwrap();
        let checkpoint = Checkpoint::open(path, 9, false).unwrap();
        assert_eq!(checkpoint.incomplete().unwrap().len(), 9);
    }
}
