// Author: Lukas Bower
// Purpose: Versioned bloom filter and mask arithmetic for broadcast matching.

//! Bloom filters carry a generation so senders and receivers built against
//! different hash-element sets keep interoperating: generation g+1 hashes a
//! superset of generation g's elements, so a mask installed at a lower
//! generation still admits every message it should at higher generations.
//! The core never interprets bit meanings; it only performs word-wise tests.

use alloc::vec;
use alloc::vec::Vec;

use crate::types::WireError;

/// Default bloom bit-array size in bytes when a bus does not choose one.
pub const BLOOM_DEFAULT_BYTES: u64 = 64;

/// Largest accepted bloom bit-array size in bytes.
pub const BLOOM_MAX_BYTES: u64 = 4096;

/// A fixed-size bit array tagged with the generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    generation: u64,
    words: Vec<u64>,
}

impl BloomFilter {
    /// Construct a zeroed filter of `size_bytes` (a non-zero multiple of 8
    /// up to [`BLOOM_MAX_BYTES`]) for the given generation.
    pub fn new(generation: u64, size_bytes: u64) -> Result<Self, WireError> {
        validate_bloom_size(size_bytes)?;
        Ok(Self {
            generation,
            words: vec![0; (size_bytes / 8) as usize],
        })
    }

    /// Construct a filter from existing words.
    pub fn from_words(generation: u64, words: Vec<u64>) -> Result<Self, WireError> {
        validate_bloom_size(words.len() as u64 * 8)?;
        Ok(Self { generation, words })
    }

    /// Return the generation tag.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Return the bit-array size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.words.len() as u64 * 8
    }

    /// Borrow the bit-array words.
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Set bit `index` counted from word 0, bit 0.
    pub fn set_bit(&mut self, index: u64) {
        let word = (index / 64) as usize;
        if word < self.words.len() {
            self.words[word] |= 1 << (index % 64);
        }
    }

    /// Return whether bit `index` is set.
    #[must_use]
    pub fn bit(&self, index: u64) -> bool {
        let word = (index / 64) as usize;
        word < self.words.len() && self.words[word] & (1 << (index % 64)) != 0
    }
}

/// Word-wise admission test: the filter passes iff every filter bit is also
/// present in the mask, i.e. `(filter & !mask) == 0` for every word.
///
/// Mismatched widths never admit; false positives are acceptable, false
/// negatives are not, and width mismatches are rejected before installation.
#[must_use]
pub fn mask_admits(filter: &[u64], mask: &[u64]) -> bool {
    if filter.len() != mask.len() {
        return false;
    }
    filter
        .iter()
        .zip(mask.iter())
        .all(|(f, m)| f & !m == 0)
}

/// An array of per-generation bit arrays installed by a receiver.
///
/// Entries are kept in strictly increasing generation order; the selection
/// rule picks the exact generation of an incoming filter, or the nearest
/// lower one when the filter is newer than anything installed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BloomMask {
    entries: Vec<BloomFilter>,
}

/// Errors raised when assembling a mask array.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BloomMaskError {
    /// Generations were not strictly increasing.
    #[error("mask generations must be strictly increasing")]
    GenerationOrder,
    /// Entry widths differ from each other.
    #[error("mask entries must share one width")]
    WidthMismatch,
}

impl BloomMask {
    /// Construct an empty mask array, which admits every broadcast that
    /// carries no filter and nothing else.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Construct a mask array from entries ordered oldest generation first.
    pub fn from_entries(entries: Vec<BloomFilter>) -> Result<Self, BloomMaskError> {
        for pair in entries.windows(2) {
            if pair[1].generation() <= pair[0].generation() {
                return Err(BloomMaskError::GenerationOrder);
            }
            if pair[1].size_bytes() != pair[0].size_bytes() {
                return Err(BloomMaskError::WidthMismatch);
            }
        }
        Ok(Self { entries })
    }

    /// Return whether no entries are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Borrow the installed entries, oldest generation first.
    #[must_use]
    pub fn entries(&self) -> &[BloomFilter] {
        &self.entries
    }

    /// Return the bit-array width in bytes, if any entry is installed.
    #[must_use]
    pub fn size_bytes(&self) -> Option<u64> {
        self.entries.first().map(BloomFilter::size_bytes)
    }

    /// Select the mask words for an incoming filter generation: the exact
    /// generation, or the nearest lower one. Returns `None` when every
    /// installed generation is newer than the filter's.
    #[must_use]
    pub fn select(&self, generation: u64) -> Option<&[u64]> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.generation() <= generation)
            .map(BloomFilter::words)
    }

    /// Apply the full match procedure to an incoming filter.
    #[must_use]
    pub fn admits(&self, filter: &BloomFilter) -> bool {
        match self.select(filter.generation()) {
            Some(mask) => mask_admits(filter.words(), mask),
            None => false,
        }
    }
}

pub(crate) fn validate_bloom_size(size_bytes: u64) -> Result<(), WireError> {
    if size_bytes == 0 || size_bytes % 8 != 0 || size_bytes > BLOOM_MAX_BYTES {
        return Err(WireError::InvalidBloomSize(size_bytes));
    }
    Ok(())
}
