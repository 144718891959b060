//! The in-arena boundary word.
//!
//! Every block starts with a one-word header. Free blocks additionally end
//! with a one-word footer that repeats the block's size. The word packs the
//! block size (always a multiple of 8, so its low three bits are free) with
//! two status bits:
//!
//! ```text
//!   31                                   3   2   1   0
//!  +---------------------------------------+---+---+---+
//!  |                 size                  | 0 | p | a |
//!  +---------------------------------------+---+---+---+
//!
//!   a: this block is allocated
//!   p: the block just below this one is allocated
//! ```
//!
//! A word whose size field is zero can only be the end marker, which is
//! written as `1` just past the last block.
//!
//! Nothing outside this module sees the packed form.

use core::mem;

/// The raw in-arena word.
pub(crate) type Word = u32;

/// Bytes in a header or footer.
pub(crate) const WORD_BYTES: usize = mem::size_of::<Word>();

/// Every payload is aligned to this, and every block size is a multiple of
/// it.
pub(crate) const BLOCK_ALIGN: usize = 8;

/// The smallest block that can be free: a header plus a footer.
pub(crate) const MIN_FREE_BLOCK: usize = 2 * WORD_BYTES;

/// The largest block size a header can describe.
pub(crate) const MAX_BLOCK_SIZE: usize = (Word::MAX & SIZE_MASK) as usize;

const ALLOCATED_BIT: Word = 0b01;
const PREV_ALLOCATED_BIT: Word = 0b10;
const SIZE_MASK: Word = !0b111;
const END_MARKER: Word = ALLOCATED_BIT;

/// The decoded form of a block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    /// Total size of the block, including its header and, when free, its
    /// footer.
    pub size: usize,
    /// Is this block allocated?
    pub allocated: bool,
    /// Is the physically preceding block allocated?
    pub prev_allocated: bool,
}

/// What a header-position word turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tag {
    Block(BlockHeader),
    End,
}

impl BlockHeader {
    #[inline]
    pub(crate) const fn free(size: usize, prev_allocated: bool) -> Self {
        BlockHeader {
            size,
            allocated: false,
            prev_allocated,
        }
    }

    #[inline]
    pub(crate) const fn allocated(size: usize, prev_allocated: bool) -> Self {
        BlockHeader {
            size,
            allocated: true,
            prev_allocated,
        }
    }

    #[inline]
    pub(crate) fn encode(self) -> Word {
        debug_assert!(self.size > 0);
        debug_assert!(self.size <= MAX_BLOCK_SIZE);
        debug_assert_eq!(self.size % BLOCK_ALIGN, 0);

        let mut word = self.size as Word;
        if self.allocated {
            word |= ALLOCATED_BIT;
        }
        if self.prev_allocated {
            word |= PREV_ALLOCATED_BIT;
        }
        word
    }
}

impl Tag {
    #[inline]
    pub(crate) fn decode(word: Word) -> Tag {
        let size = (word & SIZE_MASK) as usize;
        if size == 0 {
            debug_assert_eq!(word, END_MARKER, "corrupt header word {word:#x}");
            return Tag::End;
        }
        Tag::Block(BlockHeader {
            size,
            allocated: word & ALLOCATED_BIT != 0,
            prev_allocated: word & PREV_ALLOCATED_BIT != 0,
        })
    }

    #[inline]
    pub(crate) const fn end_marker() -> Word {
        END_MARKER
    }
}

/// Encode a free block's footer.
#[inline]
pub(crate) fn encode_footer(size: usize) -> Word {
    debug_assert_eq!(size % BLOCK_ALIGN, 0);
    size as Word
}

/// Decode a free block's footer.
#[inline]
pub(crate) fn decode_footer(word: Word) -> usize {
    (word & SIZE_MASK) as usize
}
