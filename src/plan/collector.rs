//! The interface between a heap and its collector.

use super::barriers::WriteBarrier;
use super::global::GcContext;
use crate::util::alloc::{AllocationError, MutatorAllocState};
use crate::util::heap::walker;
use crate::util::{Address, ObjectReference};
use crate::vm::type_descriptor::TypeDescriptor;
use crate::vm::ThreadContext;
use bytemuck::NoUninit;
use downcast_rs::{impl_downcast, DowncastSync};

/// Where a collector is in its cycle.
///
/// Stop-the-world collectors go `Idle → Synchronizing → SingleThreaded →
/// Idle`. The concurrent collector marks through `Idle → Requested →
/// ComputingRoots → Tracing → Idle` and reclaims through `Idle → Reclaiming
/// → Idle`, two machines that run side by side.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone, NoUninit)]
pub enum Phase {
    Idle,
    Synchronizing,
    SingleThreaded,
    Requested,
    ComputingRoots,
    Tracing,
    Reclaiming,
}

impl Phase {
    /// Mutations must be reported to the concurrent marker.
    pub fn is_snooping(self) -> bool {
        matches!(self, Phase::ComputingRoots | Phase::Tracing)
    }
}

/// A garbage collector: one strategy object per heap, shared by every thread.
///
/// Mutator-facing operations take the calling thread. `None` stands for a
/// thread that is not bound to the heap (a test driver, a shutdown hook); such
/// a caller never holds heap references on an unscanned stack.
pub trait Collector: DowncastSync {
    fn context(&self) -> &GcContext;

    /// The allocation state of a new thread with index `thread`.
    fn new_thread_state(&self, thread: u16) -> MutatorAllocState;

    /// The thread is registered and about to run.
    fn thread_start(&self, _thread: &ThreadContext) {}

    /// The thread is about to be unregistered. Its allocation state and
    /// barrier buffers are handed back; it must not allocate again.
    fn dead_thread(&self, thread: &ThreadContext);

    /// Zeroed memory for an object of `size` bytes (pre-header included)
    /// whose reference is aligned to `align`. Returns the start. Polls for
    /// pending collector work first, and collects once and retries when the
    /// heap is full.
    fn allocate_object_memory(
        &self,
        thread: &ThreadContext,
        size: usize,
        align: usize,
    ) -> Result<Address, AllocationError>;

    /// Write the type word of a freshly allocated object, with whatever GC
    /// bits a new object gets.
    fn initialize_header(&self, object: ObjectReference, ty: &'static TypeDescriptor);

    /// Collect `generation` and every younger one, returning once a
    /// collection has completed after this call. A collection already in
    /// progress counts.
    fn collect(&self, thread: Option<&ThreadContext>, generation: u8);

    /// The collection itself. Stop-the-world collectors expect the world to
    /// be stopped. The concurrent collector requests a cycle from its
    /// background threads and waits for it to be swept.
    fn collect_generation(&self, generation: u8);

    /// A safepoint: yield to a stopping collector, run a posted handshake,
    /// start a collection whose trigger has fired.
    fn check_for_needed_gc_work(&self, thread: &ThreadContext);

    fn write_barrier(&self) -> &dyn WriteBarrier;

    fn phase(&self) -> Phase;

    fn min_generation(&self) -> u8 {
        0
    }

    fn max_generation(&self) -> u8 {
        0
    }

    fn generation_of(&self, _object: ObjectReference) -> u8 {
        0
    }

    /// Bytes currently handed out by the allocators.
    fn allocated_bytes(&self) -> usize;

    /// Call `visitor` for every object starting in `[low, high)`. Threads
    /// must not be allocating into that range.
    fn visit_objects(&self, low: Address, high: Address, visitor: &mut dyn FnMut(ObjectReference)) {
        let pages = &self.context().pages;
        walker::walk_objects(pages, low, high, |t| t.is_heap(), &mut |o| visitor(o));
    }

    /// Check every heap invariant the collector knows of. Panics on a violation.
    fn verify_heap(&self) {
        super::verify::verify_heap(self.context());
    }

    /// The object containing `addr`, interior pointers included.
    fn find_object_containing(&self, addr: Address) -> Option<ObjectReference> {
        walker::find_object_containing(&self.context().pages, addr)
    }

    /// Stop background threads. The heap is being torn down.
    fn shutdown(&self) {}
}

impl_downcast!(sync Collector);

/// Run `attempt`; if the heap is full, collect `generation` once and try again.
pub(crate) fn retry_after_collection(
    collector: &dyn Collector,
    thread: &ThreadContext,
    generation: u8,
    mut attempt: impl FnMut() -> Result<Address, AllocationError>,
) -> Result<Address, AllocationError> {
    match attempt() {
        Err(AllocationError::HeapOutOfMemory) => {
            debug!(
                "thread {} found the heap full, collecting generation {}",
                thread.index(),
                generation
            );
            collector.collect(Some(thread), generation);
            let result = attempt();
            if let Err(e) = result {
                warn!("thread {}: {} after a collection", thread.index(), e);
            }
            result
        }
        result => result,
    }
}
