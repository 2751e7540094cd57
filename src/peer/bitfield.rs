use bytes::Bytes;

/// A have-set: one bit per piece, high bit of the first byte is piece 0.
///
/// The number of set bits is tracked incrementally so seed and interest
/// checks stay cheap on large swarms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
    set: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
            set: 0,
        }
    }

    /// Creates a bitfield with every piece present.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self::new(piece_count);
        bf.set_all();
        bf
    }

    /// Parses a bitfield message body.
    ///
    /// Returns `None` when the length does not match the piece count. Spare
    /// bits in the final byte are ignored.
    pub fn from_wire(bytes: &[u8], piece_count: usize) -> Option<Self> {
        if bytes.len() != piece_count.div_ceil(8) {
            return None;
        }
        let mut bf = Self {
            bits: bytes.to_vec(),
            piece_count,
            set: 0,
        };
        bf.clear_spare_bits();
        bf.set = bf.bits.iter().map(|b| b.count_ones() as usize).sum();
        Some(bf)
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Sets a bit; returns whether it was previously clear.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count || self.has(index) {
            return false;
        }
        self.bits[index / 8] |= 0x80 >> (index % 8);
        self.set += 1;
        true
    }

    /// Clears a bit; returns whether it was previously set.
    pub fn clear(&mut self, index: usize) -> bool {
        if !self.has(index) {
            return false;
        }
        self.bits[index / 8] &= !(0x80 >> (index % 8));
        self.set -= 1;
        true
    }

    pub fn set_all(&mut self) {
        self.bits.fill(0xFF);
        self.clear_spare_bits();
        self.set = self.piece_count;
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
        self.set = 0;
    }

    /// Number of pieces present.
    pub fn count(&self) -> usize {
        self.set
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// True when every piece is present and there is at least one piece.
    pub fn is_full(&self) -> bool {
        self.piece_count > 0 && self.set == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.set == 0
    }

    /// Indices of present pieces, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.has(i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}
