//! A heap: one page manager, one collector and the threads bound to it.

use crate::plan::barriers::WriteBarrier;
use crate::plan::collector::{Collector, Phase};
use crate::plan::global::{create_collector, GcContext};
use crate::plan::reference_processor::{WeakHandle, WeakKind};
use crate::plan::verify::HeapProfiler;
use crate::util::alloc::AllocationError;
use crate::util::constants::*;
use crate::util::conversions::word_align_up;
use crate::util::options::Options;
use crate::util::statistics::StatsSnapshot;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::stack::CodeModule;
use crate::vm::type_descriptor::{TypeDescriptor, TypeKind};
use crate::vm::ThreadContext;
use std::sync::Arc;

/// Collects options for a heap, then builds it.
pub struct HeapBuilder {
    pub options: Options,
}

impl HeapBuilder {
    /// Start from the defaults, overridden by `RTGC_*` environment variables.
    pub fn new() -> Self {
        HeapBuilder {
            options: Options::default(),
        }
    }

    /// Start from the built-in defaults only.
    pub fn new_no_env_vars() -> Self {
        HeapBuilder {
            options: Options::builtin(),
        }
    }

    /// Set an option by name. Returns false if the name is unknown or the
    /// value is invalid.
    pub fn set_option(&mut self, name: &str, value: &str) -> bool {
        self.options.set_from_str(name, value)
    }

    /// Set options from a space-separated list of `name=value` pairs.
    pub fn set_options_bulk(&mut self, options: &str) -> bool {
        self.options.set_bulk_from_str(options)
    }

    /// Reserve the heap and start the collector.
    pub fn build(self) -> std::io::Result<Heap> {
        if crate::util::logger::try_init().is_ok() {
            debug!("installed the built-in logger");
        }
        info!("{}", crate::build_info::describe());
        let context = Arc::new(GcContext::new(self.options)?);
        let collector = create_collector(context.clone());
        info!(
            "{} collector, {} pages at {}",
            context.options.collector,
            context.pages.table().pages(),
            context.pages.base()
        );
        Ok(Heap { context, collector })
    }
}

impl Default for HeapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A garbage-collected heap.
///
/// Mutators bind to the heap with [`Heap::bind_mutator`] and pass their
/// [`ThreadContext`] to every allocation and barrier call. A mutator polls
/// [`Heap::check_for_needed_gc_work`] at its safepoints, and brackets code
/// that does not touch the heap (blocking calls, native code) with
/// [`Heap::enter_dormant`] and [`Heap::leave_dormant`].
pub struct Heap {
    context: Arc<GcContext>,
    collector: Arc<dyn Collector>,
}

impl Heap {
    pub fn options(&self) -> &Options {
        &self.context.options
    }

    pub fn context(&self) -> &GcContext {
        &self.context
    }

    pub fn collector(&self) -> &dyn Collector {
        self.collector.as_ref()
    }

    /// The collector as its concrete type, if it is a `T`.
    pub fn collector_as<T: Collector>(&self) -> Option<&T> {
        self.collector.downcast_ref::<T>()
    }

    /// Register the calling thread as a mutator. `None` if the thread table is full.
    pub fn bind_mutator(&self) -> Option<Arc<ThreadContext>> {
        let collector = &self.collector;
        let thread = self
            .context
            .threads
            .register(|index| ThreadContext::new(index, collector.new_thread_state(index)))?;
        collector.thread_start(&thread);
        Some(thread)
    }

    /// Unregister a mutator. It must not use the heap afterwards.
    pub fn destroy_mutator(&self, thread: &ThreadContext) {
        self.collector.check_for_needed_gc_work(thread);
        self.collector.dead_thread(thread);
        self.context.threads.unregister(thread);
    }

    pub fn enter_dormant(&self, thread: &ThreadContext) {
        self.context.threads.enter_dormant(thread)
    }

    pub fn leave_dormant(&self, thread: &ThreadContext) {
        self.context.threads.leave_dormant(thread)
    }

    /// A safepoint poll.
    pub fn check_for_needed_gc_work(&self, thread: &ThreadContext) {
        self.collector.check_for_needed_gc_work(thread)
    }

    /// Zeroed memory for an object of `size` bytes, pre-header included.
    /// Returns the start; the object reference is one word in.
    pub fn allocate_object_memory(
        &self,
        thread: &ThreadContext,
        size: usize,
        align: usize,
    ) -> Result<Address, AllocationError> {
        debug_assert!(size >= MIN_OBJECT_BYTES && size % BYTES_IN_WORD == 0);
        self.collector.allocate_object_memory(thread, size, align)
    }

    /// Allocate a fixed-size object.
    pub fn alloc_object(
        &self,
        thread: &ThreadContext,
        ty: &'static TypeDescriptor,
    ) -> Result<ObjectReference, AllocationError> {
        assert_eq!(ty.kind, TypeKind::Object, "{} is not an object type", ty.name);
        let start = self.allocate_object_memory(thread, ty.instance_size(0), MIN_ALIGNMENT)?;
        let object = ObjectReference::from_object_start(start);
        self.collector.initialize_header(object, ty);
        Ok(object)
    }

    /// Allocate a vector or a string of `length` elements.
    pub fn alloc_vector(
        &self,
        thread: &ThreadContext,
        ty: &'static TypeDescriptor,
        length: usize,
    ) -> Result<ObjectReference, AllocationError> {
        assert!(
            matches!(ty.kind, TypeKind::Vector | TypeKind::String),
            "{} is not a vector type",
            ty.name
        );
        let size = self.checked_instance_size(ty, length)?;
        let start = self.allocate_object_memory(thread, size, MIN_ALIGNMENT)?;
        let object = ObjectReference::from_object_start(start);
        // The length is in place before a heap walker can see a type word.
        object_model::set_length(object, length);
        self.collector.initialize_header(object, ty);
        Ok(object)
    }

    /// Allocate an array with one bound per dimension.
    pub fn alloc_array(
        &self,
        thread: &ThreadContext,
        ty: &'static TypeDescriptor,
        bounds: &[usize],
    ) -> Result<ObjectReference, AllocationError> {
        assert!(matches!(ty.kind, TypeKind::Array { .. }), "{} is not an array type", ty.name);
        assert_eq!(
            bounds.len(),
            ty.rank(),
            "{} has rank {}, {} bounds given",
            ty.name,
            ty.rank(),
            bounds.len()
        );
        let length = bounds
            .iter()
            .try_fold(1usize, |n, b| n.checked_mul(*b))
            .ok_or(AllocationError::MmapOutOfMemory)?;
        let size = self.checked_instance_size(ty, length)?;
        let start = self.allocate_object_memory(thread, size, MIN_ALIGNMENT)?;
        let object = ObjectReference::from_object_start(start);
        object_model::set_length(object, length);
        for (dim, bound) in bounds.iter().enumerate() {
            unsafe { (object.to_raw_address() + (2 + dim) * BYTES_IN_WORD).store(*bound) }
        }
        self.collector.initialize_header(object, ty);
        Ok(object)
    }

    fn checked_instance_size(
        &self,
        ty: &'static TypeDescriptor,
        length: usize,
    ) -> Result<usize, AllocationError> {
        let elements = length
            .checked_mul(ty.element_size)
            .filter(|bytes| *bytes <= self.context.options.heap_size)
            .ok_or(AllocationError::MmapOutOfMemory)?;
        Ok(ty.instance_size(0) + word_align_up(elements))
    }

    pub fn write_barrier(&self) -> &dyn WriteBarrier {
        self.collector.write_barrier()
    }

    /// Store a reference into field word `word` of `object`.
    pub fn write_field(
        &self,
        thread: &ThreadContext,
        object: ObjectReference,
        word: usize,
        value: ObjectReference,
    ) {
        let slot = object_model::field_address(object, word);
        self.write_barrier().write_reference(thread, slot, value)
    }

    pub fn read_field(&self, object: ObjectReference, word: usize) -> ObjectReference {
        object_model::load_reference(object_model::field_address(object, word))
    }

    /// Collect `generation` and the younger ones. Returns once a collection
    /// has completed after the call.
    pub fn collect(&self, thread: Option<&ThreadContext>, generation: u8) {
        self.collector.collect(thread, generation)
    }

    pub fn new_weak_handle(&self, target: ObjectReference, kind: WeakKind) -> WeakHandle {
        self.context.references.new_weak_handle(target, kind)
    }

    /// The target of `handle`, or null once it has died.
    pub fn load_weak(&self, thread: &ThreadContext, handle: &WeakHandle) -> ObjectReference {
        self.write_barrier().load_weak_reference(thread, handle)
    }

    /// Ask for `object`'s finalizer to run once it is unreachable.
    pub fn register_finalizer(&self, object: ObjectReference) {
        self.context.references.register_finalizer(object)
    }

    /// An object whose finalizer is due. It stays alive until it is popped.
    pub fn pop_finalizable(&self) -> Option<ObjectReference> {
        self.context.references.pop_ready()
    }

    /// Register the activation-record tables of compiled code.
    pub fn register_code_module(&self, module: CodeModule) {
        self.context.code.register(module)
    }

    pub fn unregister_code_module(&self, base: Address) {
        self.context.code.unregister(base)
    }

    /// Add `words` static reference slots starting at `start` to the roots.
    pub fn add_static_roots(&self, start: Address, words: usize) {
        self.context.statics.add_area(start, words)
    }

    pub fn remove_static_roots(&self, start: Address) {
        self.context.statics.remove_area(start)
    }

    pub fn phase(&self) -> Phase {
        self.collector.phase()
    }

    pub fn generation_of(&self, object: ObjectReference) -> u8 {
        self.collector.generation_of(object)
    }

    pub fn max_generation(&self) -> u8 {
        self.collector.max_generation()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.collector.allocated_bytes()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    /// Check every heap invariant. Panics on a violation.
    pub fn verify_heap(&self) {
        self.collector.verify_heap()
    }

    /// Call `visitor` for every object starting in `[low, high)`.
    pub fn visit_objects(&self, low: Address, high: Address, visitor: &mut dyn FnMut(ObjectReference)) {
        self.collector.visit_objects(low, high, visitor)
    }

    pub fn find_object_containing(&self, addr: Address) -> Option<ObjectReference> {
        self.collector.find_object_containing(addr)
    }

    /// Return the memory of up to `max_pages` unused pages to the OS.
    pub fn decommit_unused_pages(&self, max_pages: usize) -> std::io::Result<usize> {
        self.context.pages.decommit_unused_pages(max_pages)
    }

    /// Install a profiler shown the heap after every collection, or remove it.
    pub fn set_profiler(&self, profiler: Option<Box<dyn HeapProfiler>>) {
        self.context.set_profiler(profiler)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.collector.shutdown();
        debug!("heap at {} shut down", self.context.pages.base());
    }
}
