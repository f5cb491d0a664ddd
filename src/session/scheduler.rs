use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::{
    session::stats::ThroughputMeter,
    storage::{PieceWriter, StorageError},
    torrent::{BlockInfo, Manifest, sha1_digest},
};

/// Answer to "what should this peer fetch next".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Block(BlockInfo),
    /// Every piece the peer has is fully handed out already.
    Retry,
    /// Nothing left that this peer can provide.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    /// Block buffered, piece still incomplete.
    Stored,
    /// Piece verified and written. `complete` is set once no piece is pending.
    Verified { complete: bool },
    /// Digest mismatch, every block of the piece is back in the table.
    Corrupt,
    /// The piece is no longer pending.
    Stale,
}

#[derive(Debug)]
struct PieceBuffer {
    blocks: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl PieceBuffer {
    fn new(block_count: u32) -> Self {
        PieceBuffer {
            blocks: vec![None; block_count as usize],
            received: 0,
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.blocks.into_iter().flatten().flatten().collect()
    }
}

#[derive(Debug, Default)]
struct AssignmentTable {
    /// Unassigned blocks per incomplete piece.
    pending: BTreeMap<u32, HashSet<u32>>,
    buffers: HashMap<u32, PieceBuffer>,
}

/// Hands out blocks exclusively, accumulates them into pieces and persists
/// verified pieces.
#[derive(Debug)]
pub struct PieceScheduler {
    manifest: Arc<Manifest>,
    writer: PieceWriter,
    table: Mutex<AssignmentTable>,
    work_available: Notify,
    meter: ThroughputMeter,
}

impl PieceScheduler {
    /// Builds the table from the pieces the writer reports as incomplete.
    pub fn new(manifest: Arc<Manifest>, writer: PieceWriter) -> Result<Self, StorageError> {
        let pending = writer
            .incomplete_pieces()?
            .into_iter()
            .map(|piece| (piece, (0..manifest.block_count(piece)).collect()))
            .collect();
        Ok(PieceScheduler {
            manifest,
            writer,
            table: Mutex::new(AssignmentTable {
                pending,
                buffers: HashMap::new(),
            }),
            work_available: Notify::new(),
            meter: ThroughputMeter::default(),
        })
    }

    pub fn writer(&self) -> &PieceWriter {
        &self.writer
    }

    /// Any unassigned block of the lowest pending piece the peer has. Pieces
    /// whose blocks are all handed out are skipped; `Retry` means every piece
    /// the peer has is in that state.
    pub fn next_block(&self, has_piece: impl Fn(u32) -> bool) -> Assignment {
        let mut table = self.table.lock();
        let mut available = false;
        for (&piece, free) in table.pending.iter_mut() {
            if !has_piece(piece) {
                continue;
            }
            available = true;
            if let Some(&block) = free.iter().next() {
                free.remove(&block);
                return Assignment::Block(self.manifest.block(piece, block));
            }
        }
        if available {
            Assignment::Retry
        } else {
            Assignment::Exhausted
        }
    }

    /// Buffers a received block. When the piece is full it is hashed; a match
    /// is written to disk and dropped from the table, a mismatch puts every
    /// block back. A write failure also puts the piece back.
    pub fn on_block_received(
        &self,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<PieceOutcome, StorageError> {
        let piece = block.piece_index;
        let mut table = self.table.lock();
        if !table.pending.contains_key(&piece) {
            debug!(piece, block = block.block_index, "block for a piece no longer pending");
            return Ok(PieceOutcome::Stale);
        }
        self.meter.record(data.len());

        let block_count = self.manifest.block_count(piece);
        let buffer = table
            .buffers
            .entry(piece)
            .or_insert_with(|| PieceBuffer::new(block_count));
        let Some(slot) = buffer.blocks.get_mut(block.block_index as usize) else {
            return Ok(PieceOutcome::Stale);
        };
        if slot.is_none() {
            buffer.received += 1;
        }
        *slot = Some(data);
        if buffer.received < block_count as usize {
            return Ok(PieceOutcome::Stored);
        }

        let bytes = table
            .buffers
            .remove(&piece)
            .map(PieceBuffer::into_bytes)
            .unwrap_or_default();
        let all_blocks: HashSet<u32> = (0..block_count).collect();

        if self.manifest.piece_hash(piece) != Some(&sha1_digest(&bytes)) {
            warn!(piece, "piece failed verification, requeueing");
            table.pending.insert(piece, all_blocks);
            self.work_available.notify_waiters();
            return Ok(PieceOutcome::Corrupt);
        }

        if let Err(e) = self.writer.write_piece(piece, &bytes) {
            error!(piece, error = %e, "could not persist piece, requeueing");
            table.pending.insert(piece, all_blocks);
            self.work_available.notify_waiters();
            return Err(e);
        }

        table.pending.remove(&piece);
        let remaining = table.pending.len();
        drop(table);
        info!(piece, remaining, "piece verified");
        self.work_available.notify_waiters();
        Ok(PieceOutcome::Verified {
            complete: remaining == 0,
        })
    }

    /// Returns a block whose fetch failed to the table.
    pub fn on_block_not_received(&self, block: BlockInfo) {
        let mut table = self.table.lock();
        if let Some(free) = table.pending.get_mut(&block.piece_index) {
            free.insert(block.block_index);
            drop(table);
            self.work_available.notify_waiters();
        }
    }

    /// Waits until blocks are returned or a piece finishes, at most `max`.
    pub async fn wait_for_work(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.work_available.notified()).await;
    }

    pub fn pending_pieces(&self) -> usize {
        self.table.lock().pending.len()
    }

    pub fn is_complete(&self) -> bool {
        self.pending_pieces() == 0
    }

    /// Fraction of pieces done, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        let total = self.manifest.piece_count();
        if total == 0 {
            return 1.0;
        }
        1.0 - self.pending_pieces() as f64 / total as f64
    }

    pub fn throughput(&self) -> f64 {
        self.meter.sample()
    }
}
