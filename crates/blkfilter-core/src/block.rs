//! Core block types for the filter framework.
//!
//! Names follow one convention throughout the crate: `bitoff`/`bitlen` count
//! bits, `offset`/`length` count bytes, and `blkoff`/`blklen` count blocks.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Size in bytes of a filter block. The parent's block size must divide it.
pub const BLOCK_SIZE: u64 = 8192;

/// Number of bits in one bitmap chunk: one block's worth.
pub const BITS_PER_CHUNK: u64 = BLOCK_SIZE * 8;

/// Returns the block containing byte `offset`.
#[inline]
pub fn block_of(offset: u64) -> u64 {
    offset / BLOCK_SIZE
}

/// Returns true if `offset` falls on a block boundary.
#[inline]
pub fn is_block_aligned(offset: u64) -> bool {
    offset % BLOCK_SIZE == 0
}

/// The `[blkoff, blkoff + blklen)` data region negotiated by a driver's
/// `prepare` hook. Blocks below `blkoff` form the metadata region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRange {
    /// First data block.
    pub blkoff: u64,
    /// Number of data blocks.
    pub blklen: u64,
}

impl DataRange {
    /// Creates a new data range.
    pub fn new(blkoff: u64, blklen: u64) -> Self {
        Self { blkoff, blklen }
    }

    /// One past the last data block.
    pub fn blkmax(&self) -> u64 {
        self.blkoff + self.blklen
    }

    /// Returns true if `blkoff` lies in the data region.
    pub fn contains(&self, blkoff: u64) -> bool {
        self.blkoff <= blkoff && blkoff < self.blkmax()
    }

    /// Byte offset of the data region on the parent device.
    pub fn byte_offset(&self) -> u64 {
        self.blkoff * BLOCK_SIZE
    }

    /// Byte length of the data region.
    pub fn byte_length(&self) -> u64 {
        self.blklen * BLOCK_SIZE
    }
}

impl fmt::Display for DataRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.blkoff, self.blkmax())
    }
}

/// Progress cursor over the blocks of a transaction.
///
/// Hooks advance `blkoff` toward `blkmax` as they finish blocks, so a
/// transaction needing several passes (e.g. waiting on more than one metadata
/// block) resumes where it left off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCursor {
    /// Next block to process (inclusive).
    pub blkoff: u64,
    /// End of the range (exclusive).
    pub blkmax: u64,
}

impl BlockCursor {
    /// Creates a cursor over `[blkoff, blkmax)`.
    pub fn new(blkoff: u64, blkmax: u64) -> Self {
        Self { blkoff, blkmax }
    }

    /// Cursor covering every block touched by `[offset, offset + length)`.
    pub fn for_bytes(offset: u64, length: u64) -> Self {
        let blkoff = block_of(offset);
        let blkmax = if length == 0 {
            blkoff
        } else {
            block_of(offset + length - 1) + 1
        };
        Self { blkoff, blkmax }
    }

    /// Marks every block as processed.
    pub fn finish(&mut self) {
        self.blkoff = self.blkmax;
    }

    /// True once every block has been processed.
    pub fn is_done(&self) -> bool {
        self.blkoff >= self.blkmax
    }

    /// Blocks left to process.
    pub fn remaining(&self) -> u64 {
        self.blkmax.saturating_sub(self.blkoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_per_chunk() {
        assert_eq!(BITS_PER_CHUNK, 65536);
    }

    #[test]
    fn test_block_alignment() {
        assert!(is_block_aligned(0));
        assert!(is_block_aligned(3 * BLOCK_SIZE));
        assert!(!is_block_aligned(512));
        assert_eq!(block_of(BLOCK_SIZE * 5 + 17), 5);
    }

    #[test]
    fn test_data_range_contains() {
        let range = DataRange::new(1, 131071);
        assert!(!range.contains(0));
        assert!(range.contains(1));
        assert!(range.contains(131071));
        assert!(!range.contains(131072));
        assert_eq!(range.byte_offset(), BLOCK_SIZE);
        assert_eq!(range.byte_length(), 131071 * BLOCK_SIZE);
        assert_eq!(format!("{}", range), "[1, 131072)");
    }

    #[test]
    fn test_cursor_for_bytes() {
        let cursor = BlockCursor::for_bytes(BLOCK_SIZE, 4 * BLOCK_SIZE);
        assert_eq!(cursor, BlockCursor::new(1, 5));
        assert_eq!(cursor.remaining(), 4);

        let partial = BlockCursor::for_bytes(BLOCK_SIZE, 1);
        assert_eq!(partial, BlockCursor::new(1, 2));
    }

    #[test]
    fn test_cursor_finish() {
        let mut cursor = BlockCursor::new(3, 9);
        assert!(!cursor.is_done());
        cursor.finish();
        assert!(cursor.is_done());
        assert_eq!(cursor.blkoff, 9);
        assert_eq!(cursor.remaining(), 0);
    }
}
