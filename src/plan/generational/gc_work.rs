use super::global::GenerationalCollector;
use crate::plan::collector::Collector;
use crate::plan::tracing::ObjectTracer;
use crate::util::alloc::BumpAllocator;
use crate::util::constants::*;
use crate::util::heap::PageType;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::reference_visitor::{visit_reference_fields, NonNullFilter};
use crate::vm::threads::COLLECTOR_THREAD;

/// The largest alignment a copy preserves.
const MAX_COPY_ALIGN: usize = 64;

/// Evacuates the condemned generations. Every page of a condemned
/// generation is a zombie; a live object found there is copied into the
/// next older generation, forwarded, and queued. Copies are scanned in the
/// order they were made, breadth first, as a Cheney scan would.
pub(super) struct CopyTracer<'a> {
    collector: &'a GenerationalCollector,
    /// One allocator per target generation.
    copy_allocators: Vec<BumpAllocator>,
    copies: Vec<ObjectReference>,
    scanned: usize,
    pub copied_bytes: [usize; MAX_GENERATIONS],
}

impl<'a> CopyTracer<'a> {
    pub fn new(collector: &'a GenerationalCollector) -> Self {
        let chunk_pages = collector.context().options.nursery_chunk_pages;
        CopyTracer {
            collector,
            copy_allocators: (0..=collector.oldest())
                .map(|g| BumpAllocator::new(COLLECTOR_THREAD, PageType::Owner(g), chunk_pages))
                .collect(),
            copies: vec![],
            scanned: 0,
            copied_bytes: [0; MAX_GENERATIONS],
        }
    }

    fn condemned_generation(&self, object: ObjectReference) -> Option<u8> {
        match self.collector.context().pages.page_type(object.to_raw_address()) {
            PageType::Zombie(g) => Some(g),
            _ => None,
        }
    }

    fn copy(&mut self, object: ObjectReference, from: u8) -> ObjectReference {
        let target = u8::min(from + 1, self.collector.oldest());
        let size = object_model::size(object);
        let align = usize::min(1 << object.value().trailing_zeros(), MAX_COPY_ALIGN);
        let start = match self.copy_allocators[target as usize].alloc(self.collector, size, align) {
            Ok(start) => start,
            Err(e) => panic!("no room to copy {} ({} bytes) into generation {}: {}", object, size, target, e),
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                object.to_object_start().to_ptr::<u8>(),
                start.to_mut_ptr::<u8>(),
                size,
            );
        }
        let copy = ObjectReference::from_object_start(start);
        debug_assert_eq!(copy.value() % align, 0);
        object_model::clear_link(copy);
        object_model::HeaderWord::of(copy).set_gc_bits(0);
        object_model::forward(object, copy);
        self.copied_bytes[target as usize] += size;
        self.copies.push(copy);
        copy
    }

    /// Trace the reference in `slot` and update it. A slot of an older
    /// generation that still points into a younger one is remembered again.
    pub fn trace_slot(&mut self, slot: Address) {
        let object = object_model::load_reference(slot);
        if object.is_null() {
            return;
        }
        let new_object = self.trace_object(object);
        if new_object != object {
            object_model::store_reference(slot, new_object);
        }
        self.collector.remember_if_younger(slot, new_object);
    }

    /// Trace every reference field of an object outside the condemned generations.
    pub fn scan_object(&mut self, object: ObjectReference) {
        visit_reference_fields(&mut NonNullFilter(&mut |slot: Address| self.trace_slot(slot)), object);
    }

    /// Give back the unused tails of the copy chunks.
    pub fn finish(&mut self) {
        let pages = &self.collector.context().pages;
        for allocator in &mut self.copy_allocators {
            allocator.truncate(pages);
        }
    }
}

impl ObjectTracer for CopyTracer<'_> {
    fn live_location(&self, object: ObjectReference) -> Option<ObjectReference> {
        match self.condemned_generation(object) {
            Some(_) => object_model::forwarded_to(object),
            None => Some(object),
        }
    }

    #[inline]
    fn trace_object(&mut self, object: ObjectReference) -> ObjectReference {
        match self.condemned_generation(object) {
            None => object,
            Some(from) => match object_model::forwarded_to(object) {
                Some(copy) => copy,
                None => self.copy(object, from),
            },
        }
    }

    fn complete_closure(&mut self) {
        while self.scanned < self.copies.len() {
            let copy = self.copies[self.scanned];
            self.scanned += 1;
            self.scan_object(copy);
        }
    }
}
