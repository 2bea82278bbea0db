use crate::util::constants::*;
use crate::util::Address;

/* Alignment */

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

pub const fn page_align_down(address: Address) -> Address {
    address.align_down(BYTES_IN_PAGE)
}

pub const fn is_page_aligned(address: Address) -> bool {
    address.is_aligned_to(BYTES_IN_PAGE)
}

/* Conversion */

pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE
}

pub const fn bytes_to_pages_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_PAGE - 1) >> LOG_BYTES_IN_PAGE
}

pub const fn bytes_to_words_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_WORD - 1) >> LOG_BYTES_IN_WORD
}

pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_BYTES_IN_WORD
}

/// Round a byte size up to whole words.
pub const fn word_align_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_WORD)
}

pub fn bytes_to_formatted_string(bytes: usize) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut i = 0;
    let mut num = bytes;
    while i < UNITS.len() - 1 {
        let new_num = num >> 10;
        if new_num == 0 {
            return format!("{}{}", num, UNITS[i]);
        }
        num = new_num;
        i += 1;
    }
    format!("{}{}", num, UNITS.last().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up_down() {
        assert_eq!(raw_align_up(0, 8), 0);
        assert_eq!(raw_align_up(1, 8), 8);
        assert_eq!(raw_align_up(8, 8), 8);
        assert_eq!(raw_align_down(15, 8), 8);
        assert!(raw_is_aligned(4096, BYTES_IN_PAGE));
        assert!(!raw_is_aligned(4097, BYTES_IN_PAGE));
    }

    #[test]
    fn test_page_conversion() {
        assert_eq!(bytes_to_pages_up(0), 0);
        assert_eq!(bytes_to_pages_up(1), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE + 1), 2);
        assert_eq!(pages_to_bytes(3), 3 * BYTES_IN_PAGE);
    }

    #[test]
    fn test_word_conversion() {
        assert_eq!(bytes_to_words_up(9), 2);
        assert_eq!(words_to_bytes(3), 24);
        assert_eq!(word_align_up(17), 24);
    }

    #[test]
    fn test_bytes_to_formatted_string() {
        assert_eq!(bytes_to_formatted_string(0), "0B");
        assert_eq!(bytes_to_formatted_string(1023), "1023B");
        assert_eq!(bytes_to_formatted_string(1024), "1KiB");
        assert_eq!(bytes_to_formatted_string(1025), "1KiB");
        assert_eq!(bytes_to_formatted_string(1 << 20), "1MiB");
    }
}
