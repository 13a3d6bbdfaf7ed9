//! Fixed-size bitmaps used to find the highest ready priority in constant
//! time.
use core::fmt;

use num_traits::PrimInt;

use super::Init;

/// Bit array with an efficient "find the highest set bit" operation.
///
/// Bit `i` corresponds to priority level `i`; higher numeric levels take
/// precedence, so the scheduler queries [`PrioBitmap::find_set_highest`].
pub trait PrioBitmap: Init + Send + Sync + fmt::Debug + 'static {
    /// The number of bits this bitmap can hold.
    const LEN: usize;

    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Get the position of the most significant set bit, if any.
    fn find_set_highest(&self) -> Option<usize>;
}

/// Bitmap of `WORDS * size_of::<Word>() * 8` bits stored in an array of
/// primitive integer words.
pub struct FixedPrioBitmap<Word, const WORDS: usize> {
    words: [Word; WORDS],
}

impl<Word: Init, const WORDS: usize> Init for FixedPrioBitmap<Word, WORDS> {
    const INIT: Self = Self {
        words: [Word::INIT; WORDS],
    };
}

impl<Word: PrimInt, const WORDS: usize> FixedPrioBitmap<Word, WORDS> {
    const WORD_BITS: usize = core::mem::size_of::<Word>() * 8;

    #[inline]
    fn split(i: usize) -> (usize, usize) {
        (i / Self::WORD_BITS, i % Self::WORD_BITS)
    }
}

impl<Word, const WORDS: usize> PrioBitmap for FixedPrioBitmap<Word, WORDS>
where
    Word: PrimInt + Init + Send + Sync + fmt::Debug + 'static,
{
    const LEN: usize = core::mem::size_of::<Word>() * 8 * WORDS;

    #[inline]
    fn get(&self, i: usize) -> bool {
        let (word, bit) = Self::split(i);
        !(self.words[word] & (Word::one() << bit)).is_zero()
    }

    #[inline]
    fn set(&mut self, i: usize) {
        let (word, bit) = Self::split(i);
        self.words[word] = self.words[word] | (Word::one() << bit);
    }

    #[inline]
    fn clear(&mut self, i: usize) {
        let (word, bit) = Self::split(i);
        self.words[word] = self.words[word] & !(Word::one() << bit);
    }

    #[inline]
    fn find_set_highest(&self) -> Option<usize> {
        for (i, word) in self.words.iter().enumerate().rev() {
            if !word.is_zero() {
                let bit = Self::WORD_BITS - 1 - word.leading_zeros() as usize;
                return Some(i * Self::WORD_BITS + bit);
            }
        }
        None
    }
}

impl<Word: PrimInt + fmt::Debug, const WORDS: usize> fmt::Debug for FixedPrioBitmap<Word, WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("FixedPrioBitmap").field(&self.words).finish()
    }
}
