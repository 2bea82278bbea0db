//! Enumerate the reference slots of an object from its type's pointer-tracking mask.
//!
//! The traversal is written once. What happens at each slot is up to a
//! [`ReferenceFilter`]: [`NonNullFilter`] skips null slots and hands the rest to
//! a [`ReferenceVisitor`] (marking, updating, verification), [`OffsetFilter`]
//! hands the slot's byte offset to an [`OffsetVisitor`] (struct copy and zero
//! barriers).

use super::object_model;
use super::type_descriptor::*;
use crate::util::constants::*;
use crate::util::{Address, ObjectReference};

/// Called once per reference slot. `base` is the address the descriptor's
/// offsets are relative to.
pub trait ReferenceFilter {
    fn filter(&mut self, slot: Address, base: Address);
}

/// Called with the address of every non-null reference slot.
pub trait ReferenceVisitor {
    fn visit(&mut self, slot: Address);
}

impl<F: FnMut(Address)> ReferenceVisitor for F {
    fn visit(&mut self, slot: Address) {
        self(slot)
    }
}

/// Called with the byte offset of every reference slot of a struct.
pub trait OffsetVisitor {
    fn visit_offset(&mut self, offset: usize);
}

impl<F: FnMut(usize)> OffsetVisitor for F {
    fn visit_offset(&mut self, offset: usize) {
        self(offset)
    }
}

pub struct NonNullFilter<'a, V: ReferenceVisitor + ?Sized>(pub &'a mut V);

impl<V: ReferenceVisitor + ?Sized> ReferenceFilter for NonNullFilter<'_, V> {
    fn filter(&mut self, slot: Address, _base: Address) {
        if !object_model::load_reference(slot).is_null() {
            self.0.visit(slot)
        }
    }
}

pub struct OffsetFilter<'a, V: OffsetVisitor + ?Sized>(pub &'a mut V);

impl<V: OffsetVisitor + ?Sized> ReferenceFilter for OffsetFilter<'_, V> {
    fn filter(&mut self, slot: Address, base: Address) {
        self.0.visit_offset(slot - base)
    }
}

/// Filter every reference slot of `object`. Returns the object's size in bytes
/// (pre-header included).
pub fn visit_reference_fields<F: ReferenceFilter + ?Sized>(
    filter: &mut F,
    object: ObjectReference,
) -> usize {
    let ty = object_model::type_descriptor(object);
    let base = object.to_raw_address();
    let len = if ty.has_length() {
        object_model::length(object)
    } else {
        0
    };
    match ty.tag() {
        NO_POINTERS | STRING => {}
        SPARSE | DENSE | ESCAPE => visit_fixed(filter, ty, base, base),
        PTR_VECTOR | PTR_ARRAY => {
            let first = object_model::element_address(object, 0);
            for i in 0..len {
                let slot = first + i * BYTES_IN_WORD;
                filter.filter(slot, slot);
            }
        }
        STRUCT_VECTOR | STRUCT_ARRAY => {
            let element = element_struct(ty);
            let first = object_model::element_address(object, 0);
            for i in 0..len {
                visit_struct_fields(filter, element, first + i * ty.element_size);
            }
        }
        tag => panic!("{:?} has a corrupt pointer-tracking tag {:#x}", ty, tag),
    }
    ty.instance_size(len)
}

/// Filter every reference slot of the unboxed struct of type `ty` at `addr`.
/// The filter sees the slot and the struct's start.
pub fn visit_struct_fields<F: ReferenceFilter + ?Sized>(
    filter: &mut F,
    ty: &'static TypeDescriptor,
    addr: Address,
) {
    debug_assert_eq!(ty.kind, TypeKind::Struct);
    // Struct offsets count as if a type word preceded the struct.
    visit_fixed(filter, ty, addr - BYTES_IN_WORD, addr)
}

fn element_struct(ty: &TypeDescriptor) -> &'static TypeDescriptor {
    match ty.element_type {
        Some(e) => e,
        None => panic!("{:?} has struct elements but no element type", ty),
    }
}

/// Slots at word offsets from `header` (sparse, dense and escape masks).
fn visit_fixed<F: ReferenceFilter + ?Sized>(
    filter: &mut F,
    ty: &TypeDescriptor,
    header: Address,
    base: Address,
) {
    let mask = ty.pointer_tracking;
    match mask & TAG_MASK {
        NO_POINTERS => {}
        SPARSE => {
            let mut nibbles = mask >> 4;
            while nibbles != 0 {
                let word = (nibbles & 0xF) as usize;
                if word == 0 {
                    break;
                }
                filter.filter(header + word * BYTES_IN_WORD, base);
                nibbles >>= 4;
            }
        }
        DENSE => {
            let mut bits = mask >> 4;
            let mut word = 1;
            while bits != 0 {
                if bits & 1 != 0 {
                    filter.filter(header + word * BYTES_IN_WORD, base);
                }
                bits >>= 1;
                word += 1;
            }
        }
        ESCAPE => {
            for &word in ty.escape_offsets {
                filter.filter(header + word as usize * BYTES_IN_WORD, base);
            }
        }
        tag => panic!("{:?} cannot use pointer-tracking tag {:#x} for fields", ty, tag),
    }
}

/// Collect the non-null reference slots of `object`, mostly for tests and verification.
pub fn reference_slots(object: ObjectReference) -> Vec<Address> {
    let mut slots = vec![];
    let mut collect = |slot: Address| slots.push(slot);
    visit_reference_fields(&mut NonNullFilter(&mut collect), object);
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::object_model::*;

    static SPARSE_T: TypeDescriptor = TypeDescriptor::object("S", 4, sparse(&[1, 3]));
    static DENSE_T: TypeDescriptor = TypeDescriptor::object("D", 4, dense(&[2, 4]));
    static ESCAPE_T: TypeDescriptor = TypeDescriptor::object_with_escape("E", 20, &[20]);
    static REF_VEC: TypeDescriptor = TypeDescriptor::reference_vector("R[]");
    static STR: TypeDescriptor = TypeDescriptor::string("Str", 2);
    static PAIR: TypeDescriptor = TypeDescriptor::structure("Pair", 16, sparse(&[2]));
    static PAIR_VEC: TypeDescriptor = TypeDescriptor::struct_vector("Pair[]", &PAIR);
    static PAIR_GRID: TypeDescriptor = TypeDescriptor::struct_array("Pair[,]", 2, &PAIR);

    struct Fake {
        storage: Vec<usize>,
    }

    impl Fake {
        fn new(words: usize) -> Self {
            Fake {
                storage: vec![0; words],
            }
        }
        fn object(&mut self) -> ObjectReference {
            ObjectReference::from_object_start(Address::from_mut_ptr(self.storage.as_mut_ptr()))
        }
    }

    /// Word offsets (from the type word) of every slot the filter sees.
    fn all_offsets(obj: ObjectReference) -> Vec<usize> {
        struct All(Vec<usize>, Address);
        impl ReferenceFilter for All {
            fn filter(&mut self, slot: Address, _base: Address) {
                self.0.push((slot - self.1) / BYTES_IN_WORD);
            }
        }
        let mut all = All(vec![], obj.to_raw_address());
        visit_reference_fields(&mut all, obj);
        all.0
    }

    #[test]
    fn fixed_layouts() {
        let mut f = Fake::new(8);
        let o = f.object();
        initialize_header(o, &SPARSE_T, 0);
        assert_eq!(all_offsets(o), vec![1, 3]);
        initialize_header(o, &DENSE_T, 0);
        assert_eq!(all_offsets(o), vec![2, 4]);

        let mut g = Fake::new(24);
        let e = g.object();
        initialize_header(e, &ESCAPE_T, 0);
        assert_eq!(all_offsets(e), vec![20]);
        assert_eq!(visit_reference_fields(&mut NonNullFilter(&mut |_| {}), e), 8 + 21 * 8);
    }

    #[test]
    fn null_slots_are_skipped() {
        let mut f = Fake::new(8);
        let o = f.object();
        initialize_header(o, &SPARSE_T, 0);
        store_reference(field_address(o, 3), o);
        assert_eq!(reference_slots(o), vec![field_address(o, 3)]);
    }

    #[test]
    fn vectors_and_strings() {
        let mut f = Fake::new(8);
        let v = f.object();
        initialize_header(v, &REF_VEC, 0);
        set_length(v, 3);
        assert_eq!(all_offsets(v), vec![2, 3, 4]);

        let mut g = Fake::new(8);
        let s = g.object();
        initialize_header(s, &STR, 0);
        set_length(s, 5);
        assert!(all_offsets(s).is_empty());
    }

    #[test]
    fn struct_elements() {
        let mut f = Fake::new(16);
        let v = f.object();
        initialize_header(v, &PAIR_VEC, 0);
        set_length(v, 2);
        // each Pair is two words, the second is a reference
        assert_eq!(all_offsets(v), vec![3, 5]);

        let mut g = Fake::new(24);
        let a = g.object();
        initialize_header(a, &PAIR_GRID, 0);
        set_length(a, 2);
        set_bounds(a, &[1, 2]);
        assert_eq!(all_offsets(a), vec![5, 7]);
    }

    #[test]
    fn offsets_for_struct_barriers() {
        let mut words = [0usize; 2];
        let mut offsets = vec![];
        let mut record = |off: usize| offsets.push(off);
        visit_struct_fields(
            &mut OffsetFilter(&mut record),
            &PAIR,
            Address::from_mut_ptr(words.as_mut_ptr()),
        );
        assert_eq!(offsets, vec![8]);
    }
}
