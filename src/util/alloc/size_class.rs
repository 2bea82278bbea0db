//! Size classes of the segregated free list.
//!
//! Sizes up to 32 words get one class per word. Above that every power-of-two
//! range is split in four, so a cell wastes at most a quarter of its size. The
//! mapping is closed form in both directions so both inline into the fast path.

use crate::util::constants::*;
use crate::util::conversions::bytes_to_words_up;

/// The number of size classes.
pub const NUM_SIZE_CLASSES: usize = 42;

/// Bytes of every segregated page taken by its [`super::page_header::PageHeader`].
pub const PAGE_HEADER_BYTES: usize = 64;

/// The payload of a segregated page.
pub const PAGE_PAYLOAD_BYTES: usize = BYTES_IN_PAGE - PAGE_HEADER_BYTES;

const SMALL_WORDS: usize = 32;
const LOG_SMALL_WORDS: usize = 5;

/// The cell size of the largest class. Anything larger is a large object.
pub const LARGE_OBJECT_THRESHOLD: usize = cell_size(NUM_SIZE_CLASSES - 1);

/// The class of an allocation of `bytes` bytes (pre-header included).
#[inline(always)]
pub const fn size_class(bytes: usize) -> usize {
    debug_assert!(bytes <= LARGE_OBJECT_THRESHOLD);
    let words = bytes_to_words_up(bytes);
    let words = if words < 2 { 2 } else { words };
    if words <= SMALL_WORDS {
        words - 2
    } else {
        let w = words - 1;
        let b = (usize::BITS - 1 - w.leading_zeros()) as usize;
        SMALL_WORDS - 1 + (b - LOG_SMALL_WORDS) * 4 + ((w >> (b - 2)) & 3)
    }
}

/// The size in bytes of the cells of `class`.
#[inline(always)]
pub const fn cell_size(class: usize) -> usize {
    cell_words(class) << LOG_BYTES_IN_WORD
}

const fn cell_words(class: usize) -> usize {
    if class <= SMALL_WORDS - 2 {
        class + 2
    } else {
        let k = class - (SMALL_WORDS - 1);
        let b = LOG_SMALL_WORDS + k / 4;
        let q = k % 4;
        (1 << b) + ((q + 1) << (b - 2))
    }
}

/// How many cells of `class` fit in one page.
pub const fn cells_per_page(class: usize) -> usize {
    PAGE_PAYLOAD_BYTES / cell_size(class)
}
