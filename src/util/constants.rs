/****************************************************************************
 *
 * Generic constants
 */

/// log_2 of the addressable unit (byte)
pub const LOG_BYTES_IN_BYTE: u8 = 0;
/// The addressable unit
pub const BYTES_IN_BYTE: usize = 1;

/// log_2 of 1 KB
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// 1 KB
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log_2 of 1 MB
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// 1 MB
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/****************************************************************************
 *
 * Machine-level constants. Only 64-bit targets are supported.
 */

/// log_2 of the number of bytes in a machine word
pub const LOG_BYTES_IN_WORD: u8 = 3;
/// The number of bytes in a machine word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log_2 of the number of bits in a machine word
pub const LOG_BITS_IN_WORD: u8 = LOG_BYTES_IN_WORD + 3;
/// The number of bits in a machine word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log_2 of the number of bytes in a heap page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a heap page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;
/// The number of words in a heap page
pub const WORDS_IN_PAGE: usize = BYTES_IN_PAGE >> LOG_BYTES_IN_WORD;

/****************************************************************************
 *
 * Object layout
 */

/// Every object is preceded by one word used as an intrusive link (the thread header
/// queue and the allocators' free lists). An object reference points just after it.
pub const PREHEADER_BYTES: usize = BYTES_IN_WORD;

/// Objects are word aligned.
pub const MIN_ALIGNMENT: usize = BYTES_IN_WORD;

/// The largest alignment an allocation request may ask for.
pub const MAX_ALIGNMENT: usize = BYTES_IN_PAGE;

/// The smallest allocation: the pre-header plus the type word.
pub const MIN_OBJECT_BYTES: usize = PREHEADER_BYTES + BYTES_IN_WORD;

/// The number of generations the page table can encode.
pub const MAX_GENERATIONS: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_word_geometry() {
        assert_eq!(BYTES_IN_PAGE, 4096);
        assert_eq!(WORDS_IN_PAGE, 512);
        assert_eq!(BITS_IN_WORD, 64);
        assert_eq!(MIN_OBJECT_BYTES, 16);
    }
}
