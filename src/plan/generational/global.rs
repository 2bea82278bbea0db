use super::card_table::CardTable;
use super::gc_work::CopyTracer;
use super::remset::RememberedSet;
use crate::plan::barriers::{AllCardsBarrier, GenerationalBarrier, WriteBarrier};
use crate::plan::collector::{retry_after_collection, Collector, Phase};
use crate::plan::global::GcContext;
use crate::plan::stop_the_world::StopTheWorld;
use crate::plan::tracing::ObjectTracer;
use crate::util::alloc::{AllocationError, BumpAllocator, ChunkSource, MutatorAllocState};
use crate::util::constants::*;
use crate::util::conversions::*;
use crate::util::heap::page_table::NO_OBJECT_START;
use crate::util::heap::{walker, PageManager, PageType};
use crate::util::memory;
use crate::util::options::RemsetKind;
use crate::util::statistics::CollectionKind;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::reference_visitor::{visit_reference_fields, NonNullFilter};
use crate::vm::type_descriptor::TypeDescriptor;
use crate::vm::ThreadContext;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// How old-to-young pointers are found at collection time.
enum OldToYoung {
    Remembered(Arc<RememberedSet>),
    Cards(Arc<CardTable>),
}

/// A stop-the-world copying collector with `max_generation + 1` generations.
///
/// Mutators bump-allocate into the nursery (generation 0). A collection of
/// generation `N` condemns every generation up to `N`: their pages turn into
/// zombies, live objects are copied into the next older generation (the
/// oldest one copies into itself), and the zombie pages are released. Old
/// objects that point into younger generations are found through the
/// remembered set or the card table, whichever the write barrier feeds.
pub struct GenerationalCollector {
    context: Arc<GcContext>,
    stw: StopTheWorld,
    barrier: Box<dyn WriteBarrier>,
    old_to_young: OldToYoung,
    max_generation: u8,
    /// Pages handed to nursery allocators since the last collection.
    nursery_pages: AtomicUsize,
    /// Zeroed chunks of `nursery_chunk_pages` pages kept from from-space,
    /// typed `System` until a nursery allocator takes them.
    reserve: Mutex<Vec<Address>>,
    /// `counts[k]` is how often generation `k - 1` was the oldest one
    /// collected since generation `k` was last collected.
    counts: Mutex<[usize; MAX_GENERATIONS]>,
    /// Object bytes per generation.
    generation_bytes: [AtomicUsize; MAX_GENERATIONS],
}

impl GenerationalCollector {
    pub fn new(context: Arc<GcContext>) -> Self {
        let pages = context.pages.clone();
        let (barrier, old_to_young): (Box<dyn WriteBarrier>, _) =
            match context.options.generational_barrier {
                RemsetKind::RememberedSet => {
                    let remset = Arc::new(RememberedSet::new());
                    (
                        Box::new(GenerationalBarrier::new(pages, remset.clone())),
                        OldToYoung::Remembered(remset),
                    )
                }
                RemsetKind::AllCards => {
                    let cards = Arc::new(CardTable::new(
                        pages.base(),
                        pages_to_bytes(pages.table().pages()),
                    ));
                    (
                        Box::new(AllCardsBarrier::new(pages, cards.clone())),
                        OldToYoung::Cards(cards),
                    )
                }
            };
        let max_generation = context.options.max_generation;
        assert!((max_generation as usize) < MAX_GENERATIONS);
        GenerationalCollector {
            context,
            stw: StopTheWorld::new(),
            barrier,
            old_to_young,
            max_generation,
            nursery_pages: AtomicUsize::new(0),
            reserve: Mutex::new(vec![]),
            counts: Mutex::new([0; MAX_GENERATIONS]),
            generation_bytes: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    pub(super) fn oldest(&self) -> u8 {
        self.max_generation
    }

    /// Collections completed so far.
    pub fn collections(&self) -> usize {
        self.stw.completed()
    }

    pub fn reserve_chunks(&self) -> usize {
        self.lock_reserve().len()
    }

    /// Object bytes in generation `generation`.
    pub fn generation_bytes(&self, generation: u8) -> usize {
        self.generation_bytes[generation as usize].load(Ordering::Relaxed)
    }

    fn lock_reserve(&self) -> MutexGuard<'_, Vec<Address>> {
        self.reserve.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_counts(&self) -> MutexGuard<'_, [usize; MAX_GENERATIONS]> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pages_of(&self, generation: u8) -> usize {
        self.context
            .pages
            .find_pages_of_type(PageType::Owner(generation))
            .iter()
            .map(|r| r.len())
            .sum()
    }

    /// The oldest generation whose trigger count or page budget is exhausted,
    /// or the nursery.
    pub fn generation_to_collect(&self) -> u8 {
        let counts = *self.lock_counts();
        let options = &self.context.options;
        (1..=self.max_generation)
            .rev()
            .find(|&k| {
                counts[k as usize] >= options.generation_trigger_count
                    || self.pages_of(k) > options.generation_budget_pages
            })
            .unwrap_or(0)
    }

    fn nursery_full(&self) -> bool {
        pages_to_bytes(self.nursery_pages.load(Ordering::Relaxed)) >= self.context.options.nursery_size
    }

    fn take_reserve(&self, pages: usize) -> Option<Address> {
        if pages != self.context.options.nursery_chunk_pages {
            return None;
        }
        let start = self.lock_reserve().pop()?;
        let manager = &self.context.pages;
        let first = manager.page_index(start);
        for index in first..first + pages {
            manager.set_page_type(index, PageType::Owner(0));
            manager.set_extra(index, NO_OBJECT_START);
        }
        Some(start)
    }

    /// Objects too large for the nursery go straight to the oldest
    /// generation, on pages of their own.
    fn pretenure(&self, thread: &ThreadContext, size: usize) -> Result<Address, AllocationError> {
        let pages = &self.context.pages;
        let count = bytes_to_pages_up(size);
        let mut clean = true;
        let start = pages.ensure_pages(thread.index(), count, PageType::Owner(self.max_generation), &mut clean)?;
        if !clean {
            memory::zero(start, pages_to_bytes(count));
        }
        pages.set_extra(pages.page_index(start), 0);
        trace!("pretenured {} bytes at {}", size, start);
        Ok(start)
    }

    /// Record `slot` if it lives in an older generation than `value`.
    pub(super) fn remember_if_younger(&self, slot: Address, value: ObjectReference) {
        let pages = &self.context.pages;
        if !pages.in_heap(slot) {
            return;
        }
        let (Some(slot_gen), Some(value_gen)) = (
            pages.page_type(slot).generation(),
            pages.page_type(value.to_raw_address()).generation(),
        ) else {
            return;
        };
        if value_gen < slot_gen {
            match &self.old_to_young {
                OldToYoung::Remembered(remset) => remset.record(slot),
                OldToYoung::Cards(cards) => cards.dirty(slot),
            }
        }
    }

    /// Objects outside the condemned generations that may point into them.
    fn old_to_young_roots(&self) -> OldRoots {
        let pages = &self.context.pages;
        let is_live_heap = |addr: Address| matches!(pages.page_type(addr), PageType::Owner(_));
        match &self.old_to_young {
            OldToYoung::Remembered(remset) => {
                let slots: Vec<Address> = remset
                    .take()
                    .into_iter()
                    .filter(|s| pages.in_heap(*s) && is_live_heap(*s))
                    .collect();
                OldRoots::Slots(slots)
            }
            OldToYoung::Cards(cards) => {
                let mut seen = HashSet::new();
                let mut objects = vec![];
                for card in cards.take_dirty() {
                    if !pages.in_heap(card) || !is_live_heap(card) {
                        continue;
                    }
                    let end = card + super::card_table::BYTES_IN_CARD;
                    let mut note = |object: ObjectReference| {
                        if seen.insert(object) {
                            objects.push(object);
                        }
                    };
                    if let Some(object) = walker::find_object_containing(pages, card) {
                        note(object);
                    }
                    walker::walk_objects(pages, card, end, |t| t.generation().is_some(), &mut note);
                }
                OldRoots::Objects(objects)
            }
        }
    }

    /// Give the zombie pages back, keeping up to `nursery_reserve_pages` of
    /// them zeroed for the nursery. Returns the pages released.
    fn release_zombies(&self) -> usize {
        let pages = &self.context.pages;
        let chunk = self.context.options.nursery_chunk_pages;
        let mut reserve = self.lock_reserve();
        let mut budget = self
            .context
            .options
            .nursery_reserve_pages
            .saturating_sub(reserve.len() * chunk);
        let mut released = 0;
        for range in pages.find_pages(|t| matches!(t, PageType::Zombie(_))) {
            let mut first = range.start;
            while budget >= chunk && range.end - first >= chunk {
                let start = pages.page_address(first);
                memory::zero(start, pages_to_bytes(chunk));
                for index in first..first + chunk {
                    pages.set_page_type(index, PageType::System);
                    pages.set_extra(index, 0);
                }
                reserve.push(start);
                budget -= chunk;
                first += chunk;
            }
            if first < range.end {
                pages.free_page_range(pages.page_address(first), pages.page_address(range.end));
                released += range.end - first;
            }
        }
        trace!("{} reserve chunks after the collection", reserve.len());
        released
    }

    fn check_remembered(&self) {
        let pages = &self.context.pages;
        let mut remembered: HashSet<Address> = HashSet::new();
        if let OldToYoung::Remembered(remset) = &self.old_to_young {
            remembered.extend(remset.slots());
            for thread in self.context.threads.snapshot() {
                if let Ok(buffer) = thread.barrier_buffer.try_borrow() {
                    remembered.extend(buffer.iter().copied());
                }
            }
        }
        walker::walk_heap(pages, &mut |object| {
            let object_gen = self.generation_of(object);
            visit_reference_fields(
                &mut NonNullFilter(&mut |slot: Address| {
                    let target = object_model::load_reference(slot);
                    if self.generation_of(target) >= object_gen {
                        return;
                    }
                    let recorded = match &self.old_to_young {
                        OldToYoung::Remembered(_) => remembered.contains(&slot),
                        OldToYoung::Cards(cards) => cards.is_dirty(slot),
                    };
                    assert!(
                        recorded,
                        "unrecorded old-to-young reference at {} in {} (generation {}) to {} (generation {})",
                        slot,
                        object,
                        object_gen,
                        target,
                        self.generation_of(target)
                    );
                }),
                object,
            );
        });
    }
}

enum OldRoots {
    Slots(Vec<Address>),
    Objects(Vec<ObjectReference>),
}

impl ChunkSource for GenerationalCollector {
    fn page_manager(&self) -> &PageManager {
        &self.context.pages
    }

    fn get_chunk(
        &self,
        thread: u16,
        pages: usize,
        page_type: PageType,
    ) -> Result<(Address, usize), AllocationError> {
        if page_type != PageType::Owner(0) {
            return self.context.pages.get_chunk(thread, pages, page_type);
        }
        let start = match self.take_reserve(pages) {
            Some(start) => start,
            None => self.context.pages.get_chunk(thread, pages, page_type)?.0,
        };
        self.nursery_pages.fetch_add(pages, Ordering::Relaxed);
        Ok((start, pages))
    }
}

impl Collector for GenerationalCollector {
    fn context(&self) -> &GcContext {
        &self.context
    }

    fn new_thread_state(&self, thread: u16) -> MutatorAllocState {
        MutatorAllocState::Bump(BumpAllocator::new(
            thread,
            PageType::Owner(0),
            self.context.options.nursery_chunk_pages,
        ))
    }

    fn dead_thread(&self, thread: &ThreadContext) {
        thread.alloc.borrow_mut().bump().truncate(&self.context.pages);
        self.barrier.flush(thread);
    }

    fn allocate_object_memory(
        &self,
        thread: &ThreadContext,
        size: usize,
        align: usize,
    ) -> Result<Address, AllocationError> {
        self.check_for_needed_gc_work(thread);
        let (generation, start) =
            if size >= self.context.options.pretenure_threshold_bytes && align <= MIN_ALIGNMENT {
                let start = retry_after_collection(self, thread, self.max_generation, || {
                    self.pretenure(thread, size)
                })?;
                (self.max_generation, start)
            } else {
                let start = retry_after_collection(self, thread, self.max_generation, || {
                    thread.alloc.borrow_mut().bump().alloc(self, size, align)
                })?;
                (0, start)
            };
        self.generation_bytes[generation as usize].fetch_add(size, Ordering::Relaxed);
        Ok(start)
    }

    fn initialize_header(&self, object: ObjectReference, ty: &'static TypeDescriptor) {
        object_model::initialize_header(object, ty, 0);
    }

    fn collect(&self, thread: Option<&ThreadContext>, generation: u8) {
        let context = &self.context;
        self.stw.collect(&context.threads, &context.pages, thread, || {
            self.collect_generation(generation)
        });
    }

    fn collect_generation(&self, generation: u8) {
        let started = Instant::now();
        let condemned = u8::min(generation, self.max_generation);
        let context = &self.context;
        let pages = &context.pages;
        debug!("collecting generations 0..={}", condemned);

        for thread in context.threads.snapshot() {
            thread.alloc.borrow_mut().bump().truncate(pages);
            self.barrier.flush(&thread);
        }
        let mut condemned_bytes = 0;
        for g in 0..=condemned {
            for range in pages.find_pages_of_type(PageType::Owner(g)) {
                for index in range {
                    pages.set_page_type(index, PageType::Zombie(g));
                }
            }
            condemned_bytes += self.generation_bytes[g as usize].swap(0, Ordering::Relaxed);
        }

        // Resolve every root before anything moves: interior pointers are
        // found by walking objects, which forwarding would break.
        let mut roots = vec![];
        context.scan_all_slots(&mut |slot| {
            let value = unsafe { slot.load::<Address>() };
            if let Some(object) = context.resolve(value) {
                let offset = value.as_usize() as isize - object.value() as isize;
                roots.push((slot, object, offset));
            }
        });
        let old_roots = self.old_to_young_roots();

        let mut tracer = CopyTracer::new(self);
        for (slot, object, offset) in roots {
            let new_object = tracer.trace_object(object);
            if new_object != object {
                unsafe { slot.store(new_object.to_raw_address() + offset) };
            }
        }
        match old_roots {
            OldRoots::Slots(slots) => slots.into_iter().for_each(|s| tracer.trace_slot(s)),
            OldRoots::Objects(objects) => objects.into_iter().for_each(|o| tracer.scan_object(o)),
        }
        context.references.scan_ready(|object| tracer.trace_object(object));
        tracer.complete_closure();
        context.references.process(&mut tracer);
        tracer.finish();

        let copied = tracer.copied_bytes;
        for (g, bytes) in copied.iter().enumerate() {
            self.generation_bytes[g].fetch_add(*bytes, Ordering::Relaxed);
        }
        let released = self.release_zombies();
        self.nursery_pages.store(0, Ordering::Relaxed);
        {
            let mut counts = self.lock_counts();
            counts[..=condemned as usize].iter_mut().for_each(|c| *c = 0);
            if condemned < self.max_generation {
                counts[condemned as usize + 1] += 1;
            }
        }

        let survived: usize = copied.iter().sum();
        let kind = if condemned == 0 {
            CollectionKind::Nursery
        } else {
            CollectionKind::Mature
        };
        context
            .stats
            .record(kind, started, condemned_bytes.saturating_sub(survived), released);
        if context.options.verify_after_gc || cfg!(feature = "extreme_assertions") {
            self.verify_heap();
        }
        context.run_profiler(true);
    }

    fn check_for_needed_gc_work(&self, thread: &ThreadContext) {
        self.stw.safepoint(&self.context.threads, thread);
        if self.nursery_full() {
            self.collect(Some(thread), self.generation_to_collect());
        }
    }

    fn write_barrier(&self) -> &dyn WriteBarrier {
        self.barrier.as_ref()
    }

    fn phase(&self) -> Phase {
        self.stw.phase()
    }

    fn max_generation(&self) -> u8 {
        self.max_generation
    }

    fn generation_of(&self, object: ObjectReference) -> u8 {
        self.context
            .pages
            .page_type(object.to_raw_address())
            .generation()
            .unwrap_or(0)
    }

    fn allocated_bytes(&self) -> usize {
        self.generation_bytes
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }

    fn verify_heap(&self) {
        crate::plan::verify::verify_heap(&self.context);
        self.check_remembered();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::Options;
    use crate::util::test_util::fixtures::*;

    fn collector(barrier: RemsetKind) -> (Arc<GenerationalCollector>, Arc<ThreadContext>) {
        let mut options = Options::builtin();
        options.heap_size = 1024 * BYTES_IN_PAGE;
        options.nursery_size = 64 * BYTES_IN_PAGE;
        options.nursery_chunk_pages = 2;
        options.nursery_reserve_pages = 4;
        options.max_generation = 2;
        options.generation_trigger_count = 2;
        options.generational_barrier = barrier;
        options.verify_after_gc = true;
        let context = Arc::new(GcContext::new(options).unwrap());
        let collector = Arc::new(GenerationalCollector::new(context.clone()));
        let thread = context
            .threads
            .register(|i| ThreadContext::new(i, collector.new_thread_state(i)))
            .unwrap();
        (collector, thread)
    }

    fn alloc(collector: &GenerationalCollector, thread: &ThreadContext, ty: &'static TypeDescriptor) -> ObjectReference {
        let start = collector
            .allocate_object_memory(thread, ty.instance_size(0), MIN_ALIGNMENT)
            .unwrap();
        let object = ObjectReference::from_object_start(start);
        collector.initialize_header(object, ty);
        object
    }

    /// A static root slot holding `object`.
    fn root(collector: &GenerationalCollector, object: ObjectReference) -> Address {
        let slot = Address::from_mut_ptr(Box::leak(Box::new(object.value())) as *mut usize);
        collector.context().statics.add_area(slot, 1);
        slot
    }

    fn rooted(slot: Address) -> ObjectReference {
        object_model::load_reference(slot)
    }

    #[test]
    fn survivors_are_promoted_one_generation_at_a_time() {
        let (collector, thread) = collector(RemsetKind::RememberedSet);
        let node = alloc(&collector, &thread, &NODE);
        let child = alloc(&collector, &thread, &NODE);
        set_field(node, 1, child);
        alloc(&collector, &thread, &PAIR);
        let slot = root(&collector, node);
        assert_eq!(collector.generation_of(node), 0);

        collector.collect(Some(&thread), 0);
        let node = rooted(slot);
        assert_eq!(collector.generation_of(node), 1);
        assert_eq!(collector.generation_of(field(node, 1)), 1);
        assert_eq!(collector.allocated_bytes(), 48);

        collector.collect(Some(&thread), 1);
        let node = rooted(slot);
        assert_eq!(collector.generation_of(node), 2);
        collector.collect(Some(&thread), 2);
        let node = rooted(slot);
        assert_eq!(collector.generation_of(node), 2);
        assert_eq!(object_model::type_descriptor(field(node, 1)).name, NODE.name);
        assert_eq!(collector.generation_bytes(2), 48);
    }

    fn old_to_young(barrier: RemsetKind) {
        let (collector, thread) = collector(barrier);
        let old = alloc(&collector, &thread, &NODE);
        let slot = root(&collector, old);
        collector.collect(Some(&thread), 0);
        let old = rooted(slot);
        assert_eq!(collector.generation_of(old), 1);

        let young = alloc(&collector, &thread, &NODE);
        collector
            .write_barrier()
            .write_reference(&thread, object_model::field_address(old, 1), young);
        collector.collect(Some(&thread), 0);
        let young = field(rooted(slot), 1);
        assert_eq!(collector.generation_of(young), 1);
        assert_eq!(object_model::type_descriptor(young).name, NODE.name);
    }

    #[test]
    fn remembered_set_keeps_young_objects_alive() {
        old_to_young(RemsetKind::RememberedSet)
    }

    #[test]
    fn dirty_cards_keep_young_objects_alive() {
        old_to_young(RemsetKind::AllCards)
    }

    #[test]
    fn trigger_counts_pick_older_generations() {
        let (collector, thread) = collector(RemsetKind::RememberedSet);
        assert_eq!(collector.generation_to_collect(), 0);
        collector.collect(Some(&thread), 0);
        assert_eq!(collector.generation_to_collect(), 0);
        collector.collect(Some(&thread), 0);
        assert_eq!(collector.generation_to_collect(), 1);
        collector.collect(Some(&thread), 1);
        collector.collect(Some(&thread), 0);
        collector.collect(Some(&thread), 0);
        collector.collect(Some(&thread), 1);
        assert_eq!(collector.generation_to_collect(), 2);
        collector.collect(Some(&thread), 2);
        assert_eq!(collector.generation_to_collect(), 0);
    }

    #[test]
    fn large_objects_are_pretenured() {
        let (collector, thread) = collector(RemsetKind::RememberedSet);
        let size = collector.context().options.pretenure_threshold_bytes;
        let start = collector.allocate_object_memory(&thread, size, 8).unwrap();
        let object = ObjectReference::from_object_start(start);
        collector.initialize_header(object, &VECTOR_BYTES);
        object_model::set_length(object, size - VECTOR_BYTES.base_size - PREHEADER_BYTES);
        assert_eq!(collector.generation_of(object), 2);
        assert_eq!(object_model::size(object), size);
        let slot = root(&collector, object);
        collector.collect(Some(&thread), 0);
        assert_eq!(rooted(slot), object);
    }

    #[test]
    fn nursery_chunks_come_from_the_reserve() {
        let (collector, thread) = collector(RemsetKind::RememberedSet);
        for _ in 0..1000 {
            alloc(&collector, &thread, &PAIR);
        }
        collector.collect(Some(&thread), 0);
        assert_eq!(collector.reserve_chunks(), 2);
        assert_eq!(collector.allocated_bytes(), 0);
        alloc(&collector, &thread, &NODE);
        assert_eq!(collector.reserve_chunks(), 1);
    }
}
