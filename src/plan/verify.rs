//! Heap verification and heap profiling.

use super::global::GcContext;
use crate::util::heap::{walker, PageType};
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::reference_visitor::{visit_reference_fields, NonNullFilter};
use crate::vm::type_descriptor::TypeKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// What [`verify_heap`] saw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapSummary {
    pub objects: usize,
    pub bytes: usize,
    pub references: usize,
}

/// Check that the page manager is consistent, that no page is left a zombie
/// and that every reference stored in a heap object is null or points at the
/// start of a live object. Panics on the first violation. No thread may be
/// allocating or collecting.
pub fn verify_heap(context: &GcContext) -> HeapSummary {
    let pages = &context.pages;
    pages.verify();
    let zombies = pages.find_pages(|t| matches!(t, PageType::Zombie(_)));
    assert!(zombies.is_empty(), "zombie pages outside a collection: {:?}", zombies);

    let mut summary = HeapSummary::default();
    walker::walk_heap(pages, &mut |object| {
        assert!(
            !object_model::is_forwarded(object),
            "{} is still forwarded after the collection",
            object
        );
        let ty = object_model::type_descriptor(object);
        assert!(ty.kind != TypeKind::Struct, "{} has the struct type {:?}", object, ty);
        let mut check = |slot: Address| {
            let target = object_model::load_reference(slot);
            let found = walker::find_object_containing(pages, target.to_raw_address());
            assert!(
                found == Some(target),
                "dangling reference at {} in {} ({:?}): {} resolves to {:?}",
                slot,
                object,
                ty,
                target,
                found
            );
            summary.references += 1;
        };
        let size = visit_reference_fields(&mut NonNullFilter(&mut check), object);
        summary.objects += 1;
        summary.bytes += size;
    });
    debug!(
        "verified {} objects, {} bytes, {} references",
        summary.objects, summary.bytes, summary.references
    );
    summary
}

/// Shown the roots and objects of a consistent heap after a collection.
pub trait HeapProfiler: Send {
    fn scan_root(&mut self, slot: Address, object: ObjectReference);

    fn scan_object(&mut self, object: ObjectReference, size: usize);

    /// The heap has been shown completely.
    fn scan_done(&mut self) {}
}

/// Counts and bytes per type name.
#[derive(Clone, Debug, Default)]
pub struct Census {
    pub roots: usize,
    pub types: HashMap<&'static str, (usize, usize)>,
    /// Completed scans.
    pub scans: usize,
}

impl Census {
    pub fn objects(&self) -> usize {
        self.types.values().map(|(count, _)| count).sum()
    }

    pub fn bytes(&self) -> usize {
        self.types.values().map(|(_, bytes)| bytes).sum()
    }
}

/// A profiler that keeps the census of the last completed scan.
pub struct CensusProfiler {
    current: Census,
    last: Arc<Mutex<Census>>,
}

impl CensusProfiler {
    /// The profiler, and where its results show up.
    pub fn new() -> (Self, Arc<Mutex<Census>>) {
        let last = Arc::new(Mutex::new(Census::default()));
        (
            CensusProfiler {
                current: Census::default(),
                last: last.clone(),
            },
            last,
        )
    }
}

impl HeapProfiler for CensusProfiler {
    fn scan_root(&mut self, _slot: Address, _object: ObjectReference) {
        self.current.roots += 1;
    }

    fn scan_object(&mut self, object: ObjectReference, size: usize) {
        let entry = self
            .current
            .types
            .entry(object_model::type_descriptor(object).name)
            .or_default();
        entry.0 += 1;
        entry.1 += size;
    }

    fn scan_done(&mut self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let scans = last.scans + 1;
        *last = std::mem::take(&mut self.current);
        last.scans = scans;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::Options;
    use crate::util::test_util::fixtures::*;

    fn context() -> GcContext {
        let mut options = Options::builtin();
        options.heap_size = 64 * crate::util::constants::BYTES_IN_PAGE;
        GcContext::new(options).unwrap()
    }

    #[test]
    fn verify_counts_objects() {
        let ctx = context();
        let mut clean = true;
        let page = ctx
            .pages
            .ensure_pages(1, 1, PageType::Owner(0), &mut clean)
            .unwrap();
        ctx.pages.set_extra(ctx.pages.page_index(page), 0);
        let a = init_pair(page);
        let b = init_node(page + 40usize);
        set_field(a, 1, b);
        set_field(b, 1, a);
        let summary = verify_heap(&ctx);
        assert_eq!(
            summary,
            HeapSummary {
                objects: 2,
                bytes: 64,
                references: 2
            }
        );
    }

    #[test]
    #[should_panic(expected = "dangling reference")]
    fn verify_rejects_interior_references() {
        let ctx = context();
        let mut clean = true;
        let page = ctx
            .pages
            .ensure_pages(1, 1, PageType::Owner(0), &mut clean)
            .unwrap();
        ctx.pages.set_extra(ctx.pages.page_index(page), 0);
        let a = init_node(page);
        let b = init_node(page + 24usize);
        set_field(a, 1, ObjectReference::from_raw_address(b.to_raw_address() + 8usize));
        verify_heap(&ctx);
    }

    #[test]
    fn census_keeps_the_last_scan() {
        let mut storage = [0usize; 6];
        let start = Address::from_mut_ptr(storage.as_mut_ptr());
        let node = init_node(start);
        let (mut profiler, last) = CensusProfiler::new();
        profiler.scan_root(start, node);
        profiler.scan_object(node, 24);
        profiler.scan_object(node, 24);
        assert_eq!(last.lock().unwrap().scans, 0);
        profiler.scan_done();
        let census = last.lock().unwrap().clone();
        assert_eq!(census.scans, 1);
        assert_eq!(census.roots, 1);
        assert_eq!(census.types[NODE.name], (2, 48));
        assert_eq!((census.objects(), census.bytes()), (2, 48));
    }
}
