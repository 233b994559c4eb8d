//! Bit-packed arrays of sub-byte unsigned integers.
//!
//! The cache stores one small counter per slot and one clock hand per set.
//! At one, two, or four bits each, packing them into `u64` words keeps the
//! whole metadata array a few cache lines wide, which is what makes the
//! CLOCK sweep cheap.
//!
//! Bit order is little-endian within each word: index 0 occupies the least
//! significant bits of word 0. This layout is part of the on-wire/on-disk
//! contract for anyone serializing the words; big-endian hosts must swap
//! words on serialization, never in memory.

/// A packed array of `BITS`-wide unsigned integers over `u64` words.
///
/// `BITS` must be 1, 2, or 4: a power of two below 8, so that
/// `uints_per_word` is itself a power of two and no element straddles a
/// word boundary.
#[derive(Debug, Clone)]
pub struct PackedIntArray<const BITS: usize> {
    words: Vec<u64>,
}

impl<const BITS: usize> PackedIntArray<BITS> {
    const WORD_BITS: usize = 64;

    const fn uints_per_word() -> usize {
        Self::WORD_BITS / BITS
    }

    const fn mask() -> u64 {
        (1u64 << BITS) - 1
    }

    /// Returns the number of `u64` words needed to hold `len` elements.
    #[must_use]
    pub const fn words_for(len: usize) -> usize {
        len.div_ceil(Self::uints_per_word())
    }

    /// Creates a zeroed array with room for `len` elements.
    ///
    /// # Panics
    ///
    /// Panics if `BITS` is not 1, 2, or 4.
    #[must_use]
    pub fn new_zeroed(len: usize) -> Self {
        assert!(
            matches!(BITS, 1 | 2 | 4),
            "element width must be 1, 2, or 4 bits"
        );
        Self {
            words: vec![0u64; Self::words_for(len)],
        }
    }

    /// Creates an array over existing words.
    #[must_use]
    pub fn from_words(words: Vec<u64>) -> Self {
        assert!(
            matches!(BITS, 1 | 2 | 4),
            "element width must be 1, 2, or 4 bits"
        );
        Self { words }
    }

    /// Returns the backing words.
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Zeroes every element in O(words).
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Returns the element at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> u8 {
        let word = self.words[index / Self::uints_per_word()];
        let shift = BITS * (index % Self::uints_per_word());
        ((word >> shift) & Self::mask()) as u8
    }

    /// Sets the element at `index` to `value`.
    ///
    /// Behavior is defined only for `value < 2^BITS` (debug-asserted).
    pub fn set(&mut self, index: usize, value: u8) {
        debug_assert!(u64::from(value) <= Self::mask(), "value exceeds element width");
        let word = &mut self.words[index / Self::uints_per_word()];
        let shift = BITS * (index % Self::uints_per_word());
        *word &= !(Self::mask() << shift);
        *word |= u64::from(value) << shift;
    }
}
