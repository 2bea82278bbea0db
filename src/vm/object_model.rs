//! Object layout and header access.
//!
//! ```text
//!            +-----------------+
//! start ---> | pre-header link |   thread header queue / free-list link
//!            +-----------------+
//! object --> | type word       |   &'static TypeDescriptor | GC bits (low 3)
//!            +-----------------+
//!            | length          |   vectors, arrays and strings
//!            | bounds[rank]    |   arrays
//!            | fields ...      |
//!            +-----------------+
//! ```
//!
//! All GC-bit manipulation goes through [`HeaderWord`], which updates the type
//! word with atomic compare-and-swap. A type word of zero marks a free cell or
//! the end of the objects in a bump region.

use super::type_descriptor::{TypeDescriptor, TypeKind};
use crate::util::constants::*;
use crate::util::{Address, ObjectReference};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The low bits of the type word that belong to the collector. Type
/// descriptors and objects are word aligned, so these are always free.
pub const GC_BITS_MASK: usize = 0b111;

/// Mark-sweep: the mark bit.
pub const MARK_BIT: usize = 0b001;

/// Concurrent mark-sweep: the bits holding the color.
pub const COLOR_MASK: usize = 0b011;

/// Generational: the type word holds the address of the copy. Disjoint from
/// the colors, so no colored object ever reads as forwarded.
pub const FORWARDED: usize = 0b100;

/// Accessor for an object's type word.
#[derive(Copy, Clone)]
pub struct HeaderWord<'a>(&'a AtomicUsize);

impl HeaderWord<'_> {
    pub fn of(object: ObjectReference) -> HeaderWord<'static> {
        debug_assert!(!object.is_null());
        HeaderWord(unsafe { object.to_raw_address().as_ref::<AtomicUsize>() })
    }

    pub fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn store(&self, raw: usize) {
        self.0.store(raw, Ordering::Release)
    }

    pub fn gc_bits(&self) -> usize {
        self.load() & GC_BITS_MASK
    }

    /// The type descriptor, ignoring the GC bits. Must not be forwarded.
    pub fn descriptor(&self) -> &'static TypeDescriptor {
        let raw = self.load();
        debug_assert!(raw & !GC_BITS_MASK != 0, "type word is empty");
        unsafe { &*((raw & !GC_BITS_MASK) as *const TypeDescriptor) }
    }

    /// Change the GC bits from `old` to `new`, leaving the descriptor alone.
    /// Returns false if the bits were not `old`.
    pub fn compare_exchange_bits(&self, old: usize, new: usize) -> bool {
        debug_assert!(old <= GC_BITS_MASK && new <= GC_BITS_MASK);
        let mut current = self.load();
        loop {
            if current & GC_BITS_MASK != old {
                return false;
            }
            let next = (current & !GC_BITS_MASK) | new;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Set the GC bits unconditionally.
    pub fn set_gc_bits(&self, bits: usize) {
        debug_assert!(bits <= GC_BITS_MASK);
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some((raw & !GC_BITS_MASK) | bits)
            });
    }
}

/// Write the header of a freshly allocated (zeroed) object.
pub fn initialize_header(object: ObjectReference, ty: &'static TypeDescriptor, gc_bits: usize) {
    debug_assert!(ty.kind != TypeKind::Struct);
    HeaderWord::of(object).store(ty.as_word() | gc_bits);
}

pub fn set_length(object: ObjectReference, length: usize) {
    unsafe { (object.to_raw_address() + BYTES_IN_WORD).store(length) }
}

pub fn length(object: ObjectReference) -> usize {
    unsafe { (object.to_raw_address() + BYTES_IN_WORD).load::<usize>() }
}

/// Bound of dimension `dim` of an array.
pub fn bound(object: ObjectReference, dim: usize) -> usize {
    debug_assert!(dim < type_descriptor(object).rank());
    unsafe { (object.to_raw_address() + (2 + dim) * BYTES_IN_WORD).load::<usize>() }
}

pub fn set_bounds(object: ObjectReference, bounds: &[usize]) {
    debug_assert_eq!(bounds.len(), type_descriptor(object).rank());
    for (dim, b) in bounds.iter().enumerate() {
        unsafe { (object.to_raw_address() + (2 + dim) * BYTES_IN_WORD).store(*b) }
    }
}

pub fn type_descriptor(object: ObjectReference) -> &'static TypeDescriptor {
    HeaderWord::of(object).descriptor()
}

/// The type word with the GC bits included. Zero for a free cell.
pub fn load_type_word(object: ObjectReference) -> usize {
    HeaderWord::of(object).load()
}

/// Mark a cell free.
pub fn clear_type_word(object: ObjectReference) {
    HeaderWord::of(object).store(0)
}

/// Bytes allocated for `object`, pre-header included. A forwarded object has
/// the size of its copy.
pub fn size(object: ObjectReference) -> usize {
    if let Some(copy) = forwarded_to(object) {
        return size(copy);
    }
    let ty = type_descriptor(object);
    let len = if ty.has_length() { length(object) } else { 0 };
    ty.instance_size(len)
}

/// The address of element `index` of a vector, array or string.
pub fn element_address(object: ObjectReference, index: usize) -> Address {
    let ty = type_descriptor(object);
    debug_assert!(ty.has_length() && index <= length(object));
    object.to_raw_address() + ty.base_size + index * ty.element_size
}

/// The address of field word `word` (the type word is word 0).
pub fn field_address(object: ObjectReference, word: usize) -> Address {
    object.to_raw_address() + word * BYTES_IN_WORD
}

/// Read a reference slot without any barrier.
pub fn load_reference(slot: Address) -> ObjectReference {
    ObjectReference::from_raw_address(unsafe {
        Address::from_usize(slot.atomic_load::<AtomicUsize>(Ordering::Acquire))
    })
}

/// Write a reference slot without any barrier.
pub fn store_reference(slot: Address, value: ObjectReference) {
    unsafe { slot.atomic_store::<AtomicUsize>(value.value(), Ordering::Release) }
}

/* Mark-sweep */

pub fn is_marked(object: ObjectReference) -> bool {
    HeaderWord::of(object).gc_bits() & MARK_BIT != 0
}

/// Set the mark bit. Returns true if this call marked the object.
pub fn test_and_mark(object: ObjectReference) -> bool {
    HeaderWord::of(object).compare_exchange_bits(0, MARK_BIT)
}

pub fn unmark(object: ObjectReference) {
    HeaderWord::of(object).set_gc_bits(0)
}

/* Generational */

pub fn is_forwarded(object: ObjectReference) -> bool {
    HeaderWord::of(object).gc_bits() & FORWARDED != 0
}

/// The copy of a forwarded object.
pub fn forwarded_to(object: ObjectReference) -> Option<ObjectReference> {
    let raw = HeaderWord::of(object).load();
    if raw & FORWARDED != 0 {
        Some(ObjectReference::from_raw_address(unsafe {
            Address::from_usize(raw & !GC_BITS_MASK)
        }))
    } else {
        None
    }
}

/// Replace the type word of `object` with a forwarding pointer to `copy`.
pub fn forward(object: ObjectReference, copy: ObjectReference) {
    debug_assert!(copy.value() & GC_BITS_MASK == 0);
    HeaderWord::of(object).store(copy.value() | FORWARDED)
}

/* Concurrent mark-sweep */

/// The color of an object, 1 to 3.
pub fn color(object: ObjectReference) -> usize {
    HeaderWord::of(object).gc_bits() & COLOR_MASK
}

/// Recolor `object` from `from` to `to`. Returns true if this call did it.
pub fn compare_exchange_color(object: ObjectReference, from: usize, to: usize) -> bool {
    HeaderWord::of(object).compare_exchange_bits(from, to)
}

/* Pre-header link */

/// The pre-header word, used as an intrusive link.
pub fn link_address(object: ObjectReference) -> Address {
    object.to_object_start()
}

pub fn link(object: ObjectReference) -> Address {
    unsafe {
        Address::from_usize(
            link_address(object).atomic_load::<AtomicUsize>(Ordering::Acquire),
        )
    }
}

pub fn clear_link(object: ObjectReference) {
    unsafe { link_address(object).atomic_store::<AtomicUsize>(0, Ordering::Release) }
}
