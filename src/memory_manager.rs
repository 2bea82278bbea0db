//! Runtime-to-rtgc interface: the entry points a runtime calls.
//!
//! Everything here forwards to a [`Heap`]. A runtime would usually keep the
//! heap in a static and each mutator's [`ThreadContext`] in thread local
//! storage, and inline the fast paths (bump allocation, barrier phase checks)
//! on its side, calling these functions on the slow path.

use crate::heap::{Heap, HeapBuilder};
use crate::plan::reference_processor::{WeakHandle, WeakKind};
use crate::util::alloc::AllocationError;
use crate::util::{Address, ObjectReference};
use crate::vm::stack::CodeModule;
use crate::vm::type_descriptor::TypeDescriptor;
use crate::vm::ThreadContext;
use std::sync::Arc;

/// Create a heap. A runtime should set options on the builder first, with
/// [`process`] or [`process_bulk`].
///
/// This will attempt to install a logger. A runtime that wants its own logger
/// installs it before calling this function.
///
/// Arguments:
/// * `builder`: The options of the heap.
pub fn rtgc_init(builder: HeapBuilder) -> std::io::Result<Box<Heap>> {
    builder.build().map(Box::new)
}

/// Set an option. Returns false if the name is unknown or the value invalid.
///
/// Arguments:
/// * `builder`: The builder of the heap.
/// * `name`: The snake case name of the option.
/// * `value`: The value of the option, as a string.
pub fn process(builder: &mut HeapBuilder, name: &str, value: &str) -> bool {
    builder.set_option(name, value)
}

/// Set options from a string of space-separated `name=value` pairs.
pub fn process_bulk(builder: &mut HeapBuilder, options: &str) -> bool {
    builder.set_options_bulk(options)
}

/// Register the current thread as a mutator. `None` when the thread table is full.
///
/// Arguments:
/// * `heap`: The heap the thread will allocate from.
pub fn bind_mutator(heap: &Heap) -> Option<Arc<ThreadContext>> {
    heap.bind_mutator()
}

/// Unregister a mutator. Its allocation buffers are handed back to the heap.
pub fn destroy_mutator(heap: &Heap, thread: &ThreadContext) {
    heap.destroy_mutator(thread)
}

/// Allocate zeroed memory for an object.
///
/// Arguments:
/// * `thread`: The allocating mutator.
/// * `size`: The number of bytes required, pre-header included.
/// * `align`: Required alignment of the object reference.
pub fn alloc(
    heap: &Heap,
    thread: &ThreadContext,
    size: usize,
    align: usize,
) -> Result<Address, AllocationError> {
    heap.allocate_object_memory(thread, size, align)
}

/// Write the header of an object allocated with [`alloc`].
///
/// Arguments:
/// * `object`: The new object, one word past the start [`alloc`] returned.
/// * `ty`: Its type.
pub fn post_alloc(heap: &Heap, object: ObjectReference, ty: &'static TypeDescriptor) {
    heap.collector().initialize_header(object, ty)
}

pub fn alloc_object(
    heap: &Heap,
    thread: &ThreadContext,
    ty: &'static TypeDescriptor,
) -> Result<ObjectReference, AllocationError> {
    heap.alloc_object(thread, ty)
}

pub fn alloc_vector(
    heap: &Heap,
    thread: &ThreadContext,
    ty: &'static TypeDescriptor,
    length: usize,
) -> Result<ObjectReference, AllocationError> {
    heap.alloc_vector(thread, ty, length)
}

pub fn alloc_array(
    heap: &Heap,
    thread: &ThreadContext,
    ty: &'static TypeDescriptor,
    bounds: &[usize],
) -> Result<ObjectReference, AllocationError> {
    heap.alloc_array(thread, ty, bounds)
}

/// The subsuming write barrier: store `target` into `slot` and tell the
/// collector about it.
///
/// Arguments:
/// * `thread`: The mutator performing the store.
/// * `slot`: The address of the reference field.
/// * `target`: The reference stored.
pub fn object_reference_write(
    heap: &Heap,
    thread: &ThreadContext,
    slot: Address,
    target: ObjectReference,
) {
    heap.write_barrier().write_reference(thread, slot, target)
}

/// Compare-and-swap on a reference field, through the barrier.
pub fn object_reference_compare_exchange(
    heap: &Heap,
    thread: &ThreadContext,
    slot: Address,
    expected: ObjectReference,
    new: ObjectReference,
) -> Result<ObjectReference, ObjectReference> {
    heap.write_barrier()
        .compare_exchange_reference(thread, slot, expected, new)
}

/// Copy `count` reference elements of a vector or array. The ranges may overlap.
pub fn array_copy(heap: &Heap, thread: &ThreadContext, src: Address, dst: Address, count: usize) {
    heap.write_barrier().array_copy(thread, src, dst, count)
}

pub fn array_zero(heap: &Heap, thread: &ThreadContext, dst: Address, count: usize) {
    heap.write_barrier().array_zero(thread, dst, count)
}

/// Copy an unboxed struct of type `ty` from `src` to `dst`.
pub fn struct_copy(
    heap: &Heap,
    thread: &ThreadContext,
    ty: &'static TypeDescriptor,
    src: Address,
    dst: Address,
) {
    heap.write_barrier().struct_copy(thread, ty, src, dst)
}

pub fn struct_zero(heap: &Heap, thread: &ThreadContext, ty: &'static TypeDescriptor, dst: Address) {
    heap.write_barrier().struct_zero(thread, ty, dst)
}

/// Poll for collector work. Mutators call this at their safepoints.
pub fn check_for_needed_gc_work(heap: &Heap, thread: &ThreadContext) {
    heap.check_for_needed_gc_work(thread)
}

/// The mutator stops touching the heap, for example before a blocking call.
pub fn enter_dormant(heap: &Heap, thread: &ThreadContext) {
    heap.enter_dormant(thread)
}

pub fn leave_dormant(heap: &Heap, thread: &ThreadContext) {
    heap.leave_dormant(thread)
}

/// Trigger a collection of `generation` and every younger one, and wait for it.
///
/// Arguments:
/// * `thread`: The requesting mutator, or `None` for a thread that is not bound to the heap.
/// * `generation`: The oldest generation to collect.
pub fn handle_user_collection_request(heap: &Heap, thread: Option<&ThreadContext>, generation: u8) {
    heap.collect(thread, generation)
}

/// Register the activation-record tables of a compiled code module.
pub fn register_code_module(heap: &Heap, module: CodeModule) {
    heap.register_code_module(module)
}

/// Add an area of static reference slots to the roots.
pub fn add_static_roots(heap: &Heap, start: Address, words: usize) {
    heap.add_static_roots(start, words)
}

pub fn new_weak_handle(heap: &Heap, target: ObjectReference, kind: WeakKind) -> WeakHandle {
    heap.new_weak_handle(target, kind)
}

/// Read a weak handle. Null once the target is dead.
pub fn load_weak(heap: &Heap, thread: &ThreadContext, handle: &WeakHandle) -> ObjectReference {
    heap.load_weak(thread, handle)
}

/// Run `object`'s finalizer once it becomes unreachable.
pub fn add_finalizer(heap: &Heap, object: ObjectReference) {
    heap.register_finalizer(object)
}

/// Get an object whose finalizer is due, if any.
pub fn get_finalized_object(heap: &Heap) -> Option<ObjectReference> {
    heap.pop_finalizable()
}

/// Bytes currently allocated in the heap.
pub fn used_bytes(heap: &Heap) -> usize {
    heap.allocated_bytes()
}

/// Check the heap invariants. Panics on a violation.
pub fn verify_heap(heap: &Heap) {
    heap.verify_heap()
}

/// Whether `addr` lies in the reserved heap.
pub fn is_in_heap(heap: &Heap, addr: Address) -> bool {
    heap.context().pages.in_heap(addr)
}
