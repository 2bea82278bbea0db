//! Frame descriptors emitted by the compiler for every call site.
//!
//! A compact descriptor is one 64-bit word:
//!
//! | bits | field |
//! |---|---|
//! | 0 | escape: the descriptor is a [`FullDescriptor`] |
//! | 1 | omit frame pointer |
//! | 2..7 | callee-saved registers the frame saves |
//! | 7..12 | callee-saved registers holding live references at the call site |
//! | 12..20 | frame size in words, stack pointer to return address (frame-pointer-less frames) |
//! | 24..32 | argument bitmap |
//! | 32..64 | local bitmap |
//!
//! Frame layout, from high to low addresses:
//!
//! ```text
//!  arg[i]           base + 8 + 8 * i
//!  return address   base
//!  saved fp         base - 8          (frames with a frame pointer; fp points here)
//!  saved reg[j]     top - 8 * (j + 1) (top is fp, or base without a frame pointer)
//!  local[i]         top - 8 * (saved + i + 1)
//! ```
//!
//! A full descriptor carries the same header bits and a list of signed word
//! offsets from `top` instead of the two bitmaps.

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// The callee-saved registers, in descriptor bit order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CalleeSaved {
    Rbx,
    R12,
    R13,
    R14,
    R15,
}

pub const NUM_CALLEE_SAVED: usize = 5;

impl CalleeSaved {
    pub const ALL: [CalleeSaved; NUM_CALLEE_SAVED] = [
        CalleeSaved::Rbx,
        CalleeSaved::R12,
        CalleeSaved::R13,
        CalleeSaved::R14,
        CalleeSaved::R15,
    ];

    pub const fn bit(self) -> u8 {
        1 << self as u8
    }
}

const ESCAPE_BIT: u64 = 1;
const OMIT_FP_BIT: u64 = 1 << 1;
const SAVED_SHIFT: u32 = 2;
const LIVE_SHIFT: u32 = 7;
const REG_MASK: u64 = 0x1F;
const FRAME_WORDS_SHIFT: u32 = 12;
const FRAME_WORDS_MASK: u64 = 0xFF;
const ARGS_SHIFT: u32 = 24;
const LOCALS_SHIFT: u32 = 32;

pub const MAX_FRAME_WORDS: usize = FRAME_WORDS_MASK as usize;
pub const MAX_COMPACT_ARGS: usize = 8;
pub const MAX_COMPACT_LOCALS: usize = 32;

/// The header fields shared by both descriptor kinds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub omit_fp: bool,
    pub saved: u8,
    pub live: u8,
    pub frame_words: usize,
}

impl FrameHeader {
    fn encode(&self) -> u64 {
        debug_assert!(self.saved as u64 <= REG_MASK && self.live as u64 <= REG_MASK);
        assert!(self.frame_words <= MAX_FRAME_WORDS, "frame too large for a descriptor");
        (if self.omit_fp { OMIT_FP_BIT } else { 0 })
            | (self.saved as u64) << SAVED_SHIFT
            | (self.live as u64) << LIVE_SHIFT
            | (self.frame_words as u64) << FRAME_WORDS_SHIFT
    }

    fn decode(word: u64) -> Self {
        FrameHeader {
            omit_fp: word & OMIT_FP_BIT != 0,
            saved: ((word >> SAVED_SHIFT) & REG_MASK) as u8,
            live: ((word >> LIVE_SHIFT) & REG_MASK) as u8,
            frame_words: ((word >> FRAME_WORDS_SHIFT) & FRAME_WORDS_MASK) as usize,
        }
    }

    pub fn saved_count(&self) -> usize {
        self.saved.count_ones() as usize
    }

    /// The save slot of `reg` below `top`, if this frame saves it.
    pub fn save_slot(&self, top: Address, reg: CalleeSaved) -> Option<Address> {
        if self.saved & reg.bit() == 0 {
            return None;
        }
        let j = (self.saved & (reg.bit() - 1)).count_ones() as usize;
        Some(top - (j + 1) * BYTES_IN_WORD)
    }
}

/// Encode a compact descriptor.
pub fn compact(header: FrameHeader, args: u8, locals: u32) -> u64 {
    header.encode() | (args as u64) << ARGS_SHIFT | (locals as u64) << LOCALS_SHIFT
}

/// The word standing for full descriptor number `index` of a code module.
pub const fn escape(index: usize) -> u64 {
    (index as u64) << 1 | ESCAPE_BIT
}

pub const fn is_escape(word: u64) -> bool {
    word & ESCAPE_BIT != 0
}

pub const fn escape_index(word: u64) -> usize {
    (word >> 1) as usize
}

/// The byte width of the offsets of a full descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OffsetWidth {
    W8,
    W16,
    W32,
}

impl OffsetWidth {
    pub fn bytes(self) -> usize {
        match self {
            OffsetWidth::W8 => 1,
            OffsetWidth::W16 => 2,
            OffsetWidth::W32 => 4,
        }
    }

    /// The narrowest width that holds every offset.
    pub fn for_offsets(offsets: &[i32]) -> Self {
        let (lo, hi) = offsets
            .iter()
            .fold((0i32, 0i32), |(lo, hi), &o| (lo.min(o), hi.max(o)));
        if lo >= i8::MIN as i32 && hi <= i8::MAX as i32 {
            OffsetWidth::W8
        } else if lo >= i16::MIN as i32 && hi <= i16::MAX as i32 {
            OffsetWidth::W16
        } else {
            OffsetWidth::W32
        }
    }
}

/// A descriptor for frames the compact word cannot describe: many slots,
/// large frames, or slots above the arguments the bitmaps cover.
#[derive(Clone, Debug)]
pub struct FullDescriptor {
    header: u64,
    width: OffsetWidth,
    encoded: Box<[u8]>,
}

impl FullDescriptor {
    /// `offsets` are signed word offsets from the frame's `top`.
    pub fn new(header: FrameHeader, offsets: &[i32]) -> Self {
        let width = OffsetWidth::for_offsets(offsets);
        let mut encoded = Vec::with_capacity(offsets.len() * width.bytes());
        for &o in offsets {
            match width {
                OffsetWidth::W8 => encoded.extend_from_slice(&(o as i8).to_le_bytes()),
                OffsetWidth::W16 => encoded.extend_from_slice(&(o as i16).to_le_bytes()),
                OffsetWidth::W32 => encoded.extend_from_slice(&o.to_le_bytes()),
            }
        }
        FullDescriptor {
            header: header.encode(),
            width,
            encoded: encoded.into_boxed_slice(),
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::decode(self.header)
    }

    pub fn width(&self) -> OffsetWidth {
        self.width
    }

    pub fn offsets(&self) -> impl Iterator<Item = i32> + '_ {
        self.encoded
            .chunks_exact(self.width.bytes())
            .map(move |c| match self.width {
                OffsetWidth::W8 => c[0] as i8 as i32,
                OffsetWidth::W16 => i16::from_le_bytes([c[0], c[1]]) as i32,
                OffsetWidth::W32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            })
    }
}

/// A decoded descriptor.
pub enum FrameDescriptor<'a> {
    Compact(u64),
    Full(&'a FullDescriptor),
}

impl FrameDescriptor<'_> {
    pub fn header(&self) -> FrameHeader {
        match self {
            FrameDescriptor::Compact(word) => FrameHeader::decode(*word),
            FrameDescriptor::Full(full) => full.header(),
        }
    }

    /// Call `f` with every stack slot of the frame that holds a reference.
    pub fn visit_slots(&self, base: Address, top: Address, mut f: impl FnMut(Address)) {
        match self {
            FrameDescriptor::Compact(word) => {
                let header = FrameHeader::decode(*word);
                let args = (word >> ARGS_SHIFT) as u8;
                for i in 0..MAX_COMPACT_ARGS {
                    if args & (1 << i) != 0 {
                        f(base + (1 + i) * BYTES_IN_WORD);
                    }
                }
                let locals = (word >> LOCALS_SHIFT) as u32;
                let below_saves = top - header.saved_count() * BYTES_IN_WORD;
                for i in 0..MAX_COMPACT_LOCALS {
                    if locals & (1 << i) != 0 {
                        f(below_saves - (1 + i) * BYTES_IN_WORD);
                    }
                }
            }
            FrameDescriptor::Full(full) => {
                for o in full.offsets() {
                    f(top.shift::<usize>(o as isize));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_round_trip() {
        let header = FrameHeader {
            omit_fp: true,
            saved: CalleeSaved::Rbx.bit() | CalleeSaved::R14.bit(),
            live: CalleeSaved::R12.bit(),
            frame_words: 40,
        };
        let word = compact(header, 0b101, 1 << 31);
        assert!(!is_escape(word));
        let d = FrameDescriptor::Compact(word);
        assert_eq!(d.header(), header);
        let mut slots = vec![];
        let base = unsafe { Address::from_usize(0x10000) };
        d.visit_slots(base, base, |s| slots.push(s));
        assert_eq!(
            slots,
            vec![
                base + 8usize,
                base + 24usize,
                base - (2 + 32) * BYTES_IN_WORD
            ]
        );
    }

    #[test]
    fn save_slots() {
        let header = FrameHeader {
            saved: CalleeSaved::R12.bit() | CalleeSaved::R15.bit(),
            ..Default::default()
        };
        let top = unsafe { Address::from_usize(0x1000) };
        assert_eq!(header.save_slot(top, CalleeSaved::R12), Some(top - 8usize));
        assert_eq!(header.save_slot(top, CalleeSaved::R15), Some(top - 16usize));
        assert_eq!(header.save_slot(top, CalleeSaved::Rbx), None);
    }

    #[test]
    fn full_widths() {
        let header = FrameHeader::default();
        let narrow = FullDescriptor::new(header, &[-3, 2, 100]);
        assert_eq!(narrow.width(), OffsetWidth::W8);
        assert_eq!(narrow.offsets().collect::<Vec<_>>(), vec![-3, 2, 100]);
        let mid = FullDescriptor::new(header, &[-300, 5]);
        assert_eq!(mid.width(), OffsetWidth::W16);
        assert_eq!(mid.offsets().collect::<Vec<_>>(), vec![-300, 5]);
        let wide = FullDescriptor::new(header, &[70000, -1]);
        assert_eq!(wide.width(), OffsetWidth::W32);
        assert_eq!(wide.offsets().collect::<Vec<_>>(), vec![70000, -1]);
        assert_eq!(escape_index(escape(7)), 7);
    }
}
