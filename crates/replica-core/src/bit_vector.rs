//! Fixed-width bit vectors backed by u64 words
//!
//! Bit `i` lives in word `i / 64` at position `i % 64` (least significant
//! first). Used for block `IsGood` flags and the count sketch.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const WORD_BITS: usize = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BitVector(Vec<u64>);

impl BitVector {
    /// Vector able to hold `n` bits, all clear
    pub fn new(n: usize) -> Self {
        Self(vec![0; n.div_ceil(WORD_BITS)])
    }

    /// Number of addressable bits (a multiple of 64)
    pub fn capacity(&self) -> usize {
        self.0.len() * WORD_BITS
    }

    fn ensure(&mut self, i: usize) {
        let need = i / WORD_BITS + 1;
        if self.0.len() < need {
            self.0.resize(need, 0);
        }
    }

    pub fn set(&mut self, i: usize) {
        self.ensure(i);
        self.0[i / WORD_BITS] |= 1 << (i % WORD_BITS);
    }

    /// Set bit `i`, returning true iff it was previously clear
    pub fn set_with_is_new(&mut self, i: usize) -> bool {
        self.ensure(i);
        let mask = 1u64 << (i % WORD_BITS);
        let word = &mut self.0[i / WORD_BITS];
        let is_new = *word & mask == 0;
        *word |= mask;
        is_new
    }

    pub fn get(&self, i: usize) -> bool {
        self.0
            .get(i / WORD_BITS)
            .map(|w| w & (1 << (i % WORD_BITS)) != 0)
            .unwrap_or(false)
    }

    pub fn clear(&mut self, i: usize) {
        if let Some(w) = self.0.get_mut(i / WORD_BITS) {
            *w &= !(1 << (i % WORD_BITS));
        }
    }

    pub fn pop_count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True iff bits `0..n` are all set
    pub fn all_set(&self, n: usize) -> bool {
        (0..n).all(|i| self.get(i))
    }

    /// In-place union with `other`
    pub fn union(&mut self, other: &BitVector) {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), 0);
        }
        for (w, o) in self.0.iter_mut().zip(other.0.iter()) {
            *w |= o;
        }
    }

    /// In-place intersection with `other`
    pub fn intersect(&mut self, other: &BitVector) {
        for (i, w) in self.0.iter_mut().enumerate() {
            *w &= other.0.get(i).copied().unwrap_or(0);
        }
    }

    /// Words as big-endian bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 8 != 0 {
            return Err(Error::InvalidBitVector);
        }
        let words = bytes
            .chunks_exact(8)
            .map(|c| {
                let mut w = [0u8; 8];
                w.copy_from_slice(c);
                u64::from_be_bytes(w)
            })
            .collect();
        Ok(Self(words))
    }
}

impl fmt::Display for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.capacity() {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}
