//! Packet identifier allocation.

use crate::error::{Error, Result};

const WORD_BITS: usize = 64;

/// Pool of 16-bit packet identifiers in `1..=max`.
///
/// Always hands out the lowest free identifier. A bitset tracks allocation;
/// `lowest_free` is a word-granular hint so allocation skips full words
/// without rescanning them.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    words: Vec<u64>,
    max: u16,
    in_use: usize,
    lowest_free: usize,
}

impl PacketIdAllocator {
    /// Create a pool covering `1..=max`. `max == 0` yields a pool that is
    /// always exhausted.
    pub fn new(max: u16) -> Self {
        let bits = max as usize + 1;
        Self {
            words: vec![0; bits.div_ceil(WORD_BITS)],
            max,
            in_use: 0,
            lowest_free: 0,
        }
    }

    /// Allocate the lowest free identifier.
    pub fn allocate(&mut self) -> Result<u16> {
        if self.in_use >= self.max as usize {
            return Err(Error::IdentifierSpaceExhausted);
        }
        for word_idx in self.lowest_free..self.words.len() {
            let mut word = self.words[word_idx];
            if word_idx == 0 {
                // Identifier 0 is never handed out.
                word |= 1;
            }
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let id = word_idx * WORD_BITS + bit;
            if id > self.max as usize {
                break;
            }
            self.words[word_idx] |= 1u64 << bit;
            self.in_use += 1;
            self.lowest_free = word_idx;
            return Ok(id as u16);
        }
        Err(Error::IdentifierSpaceExhausted)
    }

    /// Return an identifier to the pool.
    ///
    /// Releasing an identifier that is not allocated is a caller bug and is
    /// reported rather than ignored.
    pub fn release(&mut self, id: u16) -> Result<()> {
        if !self.is_allocated(id) {
            return Err(Error::IdentifierNotAllocated(id));
        }
        let (word_idx, bit) = split(id);
        self.words[word_idx] &= !(1u64 << bit);
        self.in_use -= 1;
        self.lowest_free = self.lowest_free.min(word_idx);
        Ok(())
    }

    /// Whether `id` is currently allocated.
    pub fn is_allocated(&self, id: u16) -> bool {
        if id == 0 || id > self.max {
            return false;
        }
        let (word_idx, bit) = split(id);
        self.words[word_idx] & (1u64 << bit) != 0
    }

    /// Number of identifiers in use.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Size of the pool.
    pub fn capacity(&self) -> usize {
        self.max as usize
    }
}

fn split(id: u16) -> (usize, usize) {
    let id = id as usize;
    (id / WORD_BITS, id % WORD_BITS)
}
