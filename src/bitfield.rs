/// One bit per piece, most significant bit first. Shared by the wire
/// protocol's `bitfield` message and the on-disk completion checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    pub fn from_piece_count(count: usize) -> Self {
        Bitfield {
            bits: vec![0; count.div_ceil(8)],
            len: count,
        }
    }

    /// Builds a bitfield for `count` pieces from raw bytes. Extra bytes and
    /// spare trailing bits are dropped, missing bytes read as zero.
    pub fn from_bytes(bytes: &[u8], count: usize) -> Self {
        let mut bitfield = Self::from_piece_count(count);
        let copied = bytes.len().min(bitfield.bits.len());
        bitfield.bits[..copied].copy_from_slice(&bytes[..copied]);

        let spare = bitfield.bits.len() * 8 - count;
        if spare > 0 {
            if let Some(last) = bitfield.bits.last_mut() {
                *last &= 0xFF << spare;
            }
        }
        bitfield
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let bit = 7 - (index % 8);
        self.bits[index / 8] & (1 << bit) != 0
    }

    pub fn set_piece(&mut self, index: usize) {
        if index < self.len {
            let bit = 7 - (index % 8);
            self.bits[index / 8] |= 1 << bit;
        }
    }

    /// Indices whose bit is clear, ascending.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| !self.has_piece(i))
    }

    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn to_bools(&self) -> Vec<bool> {
        (0..self.len).map(|i| self.has_piece(i)).collect()
    }
}
