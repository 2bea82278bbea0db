//! Type metadata produced by the compiler.
//!
//! Every object's type word points at a `'static` [`TypeDescriptor`]. The
//! descriptor carries a 32-bit pointer-tracking mask whose low four bits
//! select how the reference fields of an instance are laid out:
//!
//! | tag | layout |
//! |---|---|
//! | [`NO_POINTERS`] | no reference fields |
//! | [`SPARSE`] | up to seven word offsets, one per nibble, zero terminated |
//! | [`DENSE`] | a bitmap, bit `j` for word `j + 1` |
//! | [`PTR_VECTOR`] | a vector of references |
//! | [`STRUCT_VECTOR`] | a vector of unboxed structs |
//! | [`PTR_ARRAY`] | a (multi-dimensional) array of references |
//! | [`STRUCT_ARRAY`] | a (multi-dimensional) array of unboxed structs |
//! | [`STRING`] | characters only |
//! | [`ESCAPE`] | the word offsets listed in `escape_offsets` |
//!
//! Word offsets count from the type word (word 0). A struct has no header of
//! its own: its offsets are laid out as if it had one, so field word `k` of a
//! struct lives `k - 1` words after the struct's first byte.

use crate::util::constants::*;
use crate::util::conversions::word_align_up;
use std::fmt;

pub const TAG_MASK: u32 = 0xF;
pub const NO_POINTERS: u32 = 0x0;
pub const SPARSE: u32 = 0x1;
pub const DENSE: u32 = 0x3;
pub const PTR_VECTOR: u32 = 0x5;
pub const STRUCT_VECTOR: u32 = 0x7;
pub const PTR_ARRAY: u32 = 0x9;
pub const STRUCT_ARRAY: u32 = 0xB;
pub const STRING: u32 = 0xD;
pub const ESCAPE: u32 = 0xF;

/// The most offsets a sparse mask holds.
pub const SPARSE_MAX_FIELDS: usize = 7;
/// The highest word a dense mask describes.
pub const DENSE_MAX_WORD: usize = 28;

/// Encode a sparse mask. Offsets are words from the type word, 1 to 15.
pub const fn sparse(offsets: &[usize]) -> u32 {
    assert!(offsets.len() <= SPARSE_MAX_FIELDS);
    let mut mask = SPARSE;
    let mut i = 0;
    while i < offsets.len() {
        assert!(offsets[i] >= 1 && offsets[i] <= 15);
        mask |= (offsets[i] as u32) << (4 + 4 * i);
        i += 1;
    }
    mask
}

/// Encode a dense mask. Offsets are words from the type word, 1 to 28.
pub const fn dense(offsets: &[usize]) -> u32 {
    let mut mask = DENSE;
    let mut i = 0;
    while i < offsets.len() {
        assert!(offsets[i] >= 1 && offsets[i] <= DENSE_MAX_WORD);
        mask |= 1 << (4 + offsets[i] - 1);
        i += 1;
    }
    mask
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    /// Fixed-size object: type word then fields.
    Object,
    /// Type word, length word, elements.
    Vector,
    /// Type word, total length word, one bound word per dimension, elements.
    Array { rank: u8 },
    /// Type word, length word, characters.
    String,
    /// An unboxed value type, only ever embedded in objects, vectors and arrays.
    Struct,
}

/// The collector's view of a type. Must be 8-aligned: the low bits of a type
/// word are GC bits.
#[repr(C, align(8))]
pub struct TypeDescriptor {
    pub name: &'static str,
    pub kind: TypeKind,
    /// Bytes from the type word to the first element (objects: to the end of
    /// the last field). Structs: the size of one struct.
    pub base_size: usize,
    /// Bytes per element of vectors, arrays and strings.
    pub element_size: usize,
    pub pointer_tracking: u32,
    /// Word offsets of reference fields when the tag is [`ESCAPE`].
    pub escape_offsets: &'static [u32],
    /// The struct type of the elements of struct vectors and struct arrays.
    pub element_type: Option<&'static TypeDescriptor>,
}

impl TypeDescriptor {
    /// An object of `fields` words after the type word.
    pub const fn object(name: &'static str, fields: usize, pointer_tracking: u32) -> Self {
        TypeDescriptor {
            name,
            kind: TypeKind::Object,
            base_size: BYTES_IN_WORD * (1 + fields),
            element_size: 0,
            pointer_tracking,
            escape_offsets: &[],
            element_type: None,
        }
    }

    /// An object whose reference fields are listed explicitly.
    pub const fn object_with_escape(
        name: &'static str,
        fields: usize,
        offsets: &'static [u32],
    ) -> Self {
        TypeDescriptor {
            escape_offsets: offsets,
            ..TypeDescriptor::object(name, fields, ESCAPE)
        }
    }

    /// A vector of references.
    pub const fn reference_vector(name: &'static str) -> Self {
        TypeDescriptor {
            name,
            kind: TypeKind::Vector,
            base_size: 2 * BYTES_IN_WORD,
            element_size: BYTES_IN_WORD,
            pointer_tracking: PTR_VECTOR,
            escape_offsets: &[],
            element_type: None,
        }
    }

    /// A vector of plain data.
    pub const fn data_vector(name: &'static str, element_size: usize) -> Self {
        TypeDescriptor {
            element_size,
            pointer_tracking: NO_POINTERS,
            ..TypeDescriptor::reference_vector(name)
        }
    }

    /// A vector of unboxed structs.
    pub const fn struct_vector(name: &'static str, element: &'static TypeDescriptor) -> Self {
        TypeDescriptor {
            element_size: element.base_size,
            pointer_tracking: STRUCT_VECTOR,
            element_type: Some(element),
            ..TypeDescriptor::reference_vector(name)
        }
    }

    /// An array of references of the given rank.
    pub const fn reference_array(name: &'static str, rank: u8) -> Self {
        assert!(rank >= 1);
        TypeDescriptor {
            name,
            kind: TypeKind::Array { rank },
            base_size: (2 + rank as usize) * BYTES_IN_WORD,
            element_size: BYTES_IN_WORD,
            pointer_tracking: PTR_ARRAY,
            escape_offsets: &[],
            element_type: None,
        }
    }

    /// An array of unboxed structs of the given rank.
    pub const fn struct_array(
        name: &'static str,
        rank: u8,
        element: &'static TypeDescriptor,
    ) -> Self {
        TypeDescriptor {
            element_size: element.base_size,
            pointer_tracking: STRUCT_ARRAY,
            element_type: Some(element),
            ..TypeDescriptor::reference_array(name, rank)
        }
    }

    /// A string of `char_size`-byte characters.
    pub const fn string(name: &'static str, char_size: usize) -> Self {
        TypeDescriptor {
            name,
            kind: TypeKind::String,
            base_size: 2 * BYTES_IN_WORD,
            element_size: char_size,
            pointer_tracking: STRING,
            escape_offsets: &[],
            element_type: None,
        }
    }

    /// An unboxed struct of `size` bytes. `pointer_tracking` must be sparse,
    /// dense, escape or no-pointers.
    pub const fn structure(name: &'static str, size: usize, pointer_tracking: u32) -> Self {
        TypeDescriptor {
            name,
            kind: TypeKind::Struct,
            base_size: size,
            element_size: 0,
            pointer_tracking,
            escape_offsets: &[],
            element_type: None,
        }
    }

    pub const fn tag(&self) -> u32 {
        self.pointer_tracking & TAG_MASK
    }

    pub const fn has_length(&self) -> bool {
        !matches!(self.kind, TypeKind::Object | TypeKind::Struct)
    }

    pub const fn rank(&self) -> usize {
        match self.kind {
            TypeKind::Array { rank } => rank as usize,
            _ => 0,
        }
    }

    /// Bytes allocated for an instance with `length` elements, pre-header
    /// included, rounded up to words.
    pub const fn instance_size(&self, length: usize) -> usize {
        match self.kind {
            TypeKind::Object => PREHEADER_BYTES + self.base_size,
            TypeKind::Struct => panic!("structs are not allocated on their own"),
            _ => word_align_up(PREHEADER_BYTES + self.base_size + length * self.element_size),
        }
    }

    pub fn as_word(&'static self) -> usize {
        let raw = self as *const TypeDescriptor as usize;
        debug_assert!(raw & (BYTES_IN_WORD - 1) == 0);
        raw
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({:?}, mask {:#x})", self.name, self.kind, self.pointer_tracking)
    }
}
