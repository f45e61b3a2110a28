//! Byte-backed bit maps. Bit `k` lives in byte `k / 8` at position `k % 8`.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteBitMap {
    bits: usize,
    bytes: Vec<u8>,
}

impl ByteBitMap {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            bytes: vec![0; Self::bytes_for(bits)],
        }
    }

    pub fn from_bytes(bits: usize, bytes: &[u8]) -> Self {
        let mut map = Self::new(bits);
        let n = map.bytes.len().min(bytes.len());
        map.bytes[..n].copy_from_slice(&bytes[..n]);
        map
    }

    /// Whole bytes needed for `bits` bits.
    pub fn bytes_for(bits: usize) -> usize {
        bits.div_ceil(8)
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.bits, "bit {bit} out of range {}", self.bits);
        if let Some(byte) = self.bytes.get_mut(bit / 8) {
            *byte |= 1 << (bit % 8);
        }
    }

    pub fn clear(&mut self, bit: usize) {
        if let Some(byte) = self.bytes.get_mut(bit / 8) {
            *byte &= !(1 << (bit % 8));
        }
    }

    pub fn get(&self, bit: usize) -> bool {
        bit < self.bits && self.bytes[bit / 8] & (1 << (bit % 8)) != 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Indices of set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits).filter(|&i| self.get(i))
    }

    pub fn cardinality(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }
}

impl fmt::Display for ByteBitMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (n, i) in self.iter_set().enumerate() {
            if n > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{i}")?;
        }
        f.write_str("}")
    }
}
