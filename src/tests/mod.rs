//! Tests that drive a whole heap: scenarios across collectors and threads.

mod concurrent_marking;
mod conservation;
mod shared_page_recycling;

use crate::heap::{Heap, HeapBuilder};
use crate::util::constants::*;
use crate::util::options::CollectorSelector;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;

/// A heap of `pages` pages running `collector`, with every collection
/// verified. `options` are extra `name=value` pairs.
pub(crate) fn test_heap(collector: CollectorSelector, pages: usize, options: &str) -> Heap {
    let mut builder = HeapBuilder::new_no_env_vars();
    assert!(builder.set_option("collector", &collector.to_string()));
    assert!(builder.set_option("heap_size", &(pages * BYTES_IN_PAGE).to_string()));
    assert!(builder.set_option("verify_after_gc", "true"));
    assert!(builder.set_options_bulk(options));
    builder.build().unwrap()
}

pub(crate) const ALL_COLLECTORS: [CollectorSelector; 3] = [
    CollectorSelector::MarkSweep,
    CollectorSelector::Generational,
    CollectorSelector::Concurrent,
];

/// Options that give the generational collector a small nursery.
pub(crate) const SMALL_NURSERY: &str =
    "nursery_size=262144 nursery_chunk_pages=4 nursery_reserve_pages=16";

/// Static root slots, leaked for the rest of the test process.
pub(crate) struct Roots {
    base: Address,
    len: usize,
}

impl Roots {
    pub fn new(heap: &Heap, len: usize) -> Self {
        let words: &'static mut [usize] = Box::leak(vec![0usize; len].into_boxed_slice());
        let base = Address::from_mut_ptr(words.as_mut_ptr());
        heap.add_static_roots(base, len);
        Roots { base, len }
    }

    pub fn slot(&self, i: usize) -> Address {
        assert!(i < self.len);
        self.base + i * BYTES_IN_WORD
    }

    pub fn get(&self, i: usize) -> ObjectReference {
        object_model::load_reference(self.slot(i))
    }

    pub fn set(&self, i: usize, object: ObjectReference) {
        object_model::store_reference(self.slot(i), object)
    }
}

// The slots are only ever touched through atomic loads and stores.
unsafe impl Send for Roots {}
unsafe impl Sync for Roots {}

/// Every object reachable from `roots`.
pub(crate) fn reachable(roots: &[ObjectReference]) -> std::collections::HashSet<ObjectReference> {
    use crate::vm::reference_visitor::{visit_reference_fields, NonNullFilter};
    let mut seen = std::collections::HashSet::new();
    let mut stack: Vec<ObjectReference> = roots.iter().copied().filter(|r| !r.is_null()).collect();
    while let Some(object) = stack.pop() {
        if seen.insert(object) {
            visit_reference_fields(
                &mut NonNullFilter(&mut |slot: Address| stack.push(object_model::load_reference(slot))),
                object,
            );
        }
    }
    seen
}

/// Bytes the free-list allocator accounts for an object of `size` bytes.
pub(crate) fn accounted_bytes(size: usize) -> usize {
    use crate::util::alloc::size_class::*;
    if size > LARGE_OBJECT_THRESHOLD {
        crate::util::conversions::pages_to_bytes(crate::util::conversions::bytes_to_pages_up(size))
    } else {
        cell_size(size_class(size))
    }
}

/// Every object in the heap.
pub(crate) fn all_objects(heap: &Heap) -> Vec<ObjectReference> {
    let low = heap.context().pages.base();
    let high = low + heap.options().heap_size;
    let mut objects = vec![];
    heap.visit_objects(low, high, &mut |o| objects.push(o));
    objects
}
