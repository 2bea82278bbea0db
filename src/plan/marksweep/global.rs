use super::gc_work::MarkTracer;
use crate::plan::barriers::{NoBarrier, WriteBarrier};
use crate::plan::collector::{retry_after_collection, Collector, Phase};
use crate::plan::global::GcContext;
use crate::plan::stop_the_world::StopTheWorld;
use crate::plan::tracing::ObjectTracer;
use crate::util::alloc::{AllocationError, LocalFreeLists, MutatorAllocState, SegregatedFreeList};
use crate::util::constants::MIN_ALIGNMENT;
use crate::util::heap::PageType;
use crate::util::statistics::CollectionKind;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::type_descriptor::TypeDescriptor;
use crate::vm::ThreadContext;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A non-moving stop-the-world collector over a segregated free list.
///
/// Objects are marked with the mark bit of their type word, starting from
/// static roots, the stacks of every thread and objects waiting to be
/// finalized. The sweep frees every unmarked cell and clears the mark bit of
/// the others. Mutator stores need no barrier.
pub struct MarkSweepCollector {
    context: Arc<GcContext>,
    sfl: SegregatedFreeList,
    stw: StopTheWorld,
    barrier: NoBarrier,
    allocated_since_gc: AtomicUsize,
}

impl MarkSweepCollector {
    pub fn new(context: Arc<GcContext>) -> Self {
        let sfl = SegregatedFreeList::new(context.pages.clone(), PageType::Owner(0));
        MarkSweepCollector {
            context,
            sfl,
            stw: StopTheWorld::new(),
            barrier: NoBarrier,
            allocated_since_gc: AtomicUsize::new(0),
        }
    }

    /// Collections completed so far.
    pub fn collections(&self) -> usize {
        self.stw.completed()
    }

    fn mark(&self) -> MarkTracer {
        let context = &self.context;
        let mut tracer = MarkTracer::new();
        context.scan_all_slots(&mut |slot| {
            let value = unsafe { slot.load::<Address>() };
            if let Some(object) = context.resolve(value) {
                tracer.trace_object(object);
            }
        });
        context.references.scan_ready(|object| tracer.trace_object(object));
        tracer.complete_closure();
        context.references.process(&mut tracer);
        tracer
    }
}

impl Collector for MarkSweepCollector {
    fn context(&self) -> &GcContext {
        &self.context
    }

    fn new_thread_state(&self, thread: u16) -> MutatorAllocState {
        MutatorAllocState::FreeList(LocalFreeLists::new(thread))
    }

    fn dead_thread(&self, thread: &ThreadContext) {
        self.sfl.flush_local(thread.alloc.borrow_mut().free_lists());
    }

    fn allocate_object_memory(
        &self,
        thread: &ThreadContext,
        size: usize,
        align: usize,
    ) -> Result<Address, AllocationError> {
        self.check_for_needed_gc_work(thread);
        assert!(
            align <= MIN_ALIGNMENT,
            "free-list cells are aligned to {} bytes, {} requested",
            MIN_ALIGNMENT,
            align
        );
        let start = retry_after_collection(self, thread, 0, || {
            self.sfl.alloc(thread.alloc.borrow_mut().free_lists(), size)
        })?;
        self.allocated_since_gc.fetch_add(size, Ordering::Relaxed);
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

    fn collect_generation(&self, _generation: u8) {
        let started = Instant::now();
        let tracer = self.mark();
        let swept = self.sfl.sweep(|object| {
            if object_model::is_marked(object) {
                object_model::unmark(object);
                true
            } else {
                false
            }
        });
        let freed = self.sfl.commit_freed_data();
        let released = self.sfl.recycle_global_pages();
        self.allocated_since_gc.store(0, Ordering::Relaxed);
        debug!("marked {} objects, swept {}", tracer.marked, swept);
        self.context
            .stats
            .record(CollectionKind::MarkSweep, started, freed, released);
        if self.context.options.verify_after_gc || cfg!(feature = "extreme_assertions") {
            self.verify_heap();
        }
        self.context.run_profiler(true);
    }

    fn check_for_needed_gc_work(&self, thread: &ThreadContext) {
        self.stw.safepoint(&self.context.threads, thread);
        if self.allocated_since_gc.load(Ordering::Relaxed) > self.context.options.ms_trigger_bytes {
            self.collect(Some(thread), 0);
        }
    }

    fn write_barrier(&self) -> &dyn WriteBarrier {
        &self.barrier
    }

    fn phase(&self) -> Phase {
        self.stw.phase()
    }

    fn allocated_bytes(&self) -> usize {
        self.sfl.total_bytes()
    }
}
