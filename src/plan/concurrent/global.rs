use super::colors::MarkState;
use super::thread_header_queue::ThreadHeaderQueue;
use super::workers::{CycleRequester, LastParkedResult, MarkerMonitor};
use crate::plan::barriers::{ConcurrentMarkBarrier, WriteBarrier};
use crate::plan::collector::{retry_after_collection, Collector, Phase};
use crate::plan::global::GcContext;
use crate::plan::tracing::{MarkStack, ObjectTracer};
use crate::util::alloc::{AllocationError, LocalFreeLists, MutatorAllocState, SegregatedFreeList};
use crate::util::constants::MIN_ALIGNMENT;
use crate::util::heap::{walker, PageType};
use crate::util::statistics::CollectionKind;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::reference_visitor::{visit_reference_fields, NonNullFilter};
use crate::vm::type_descriptor::TypeDescriptor;
use crate::vm::ThreadContext;
use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

/// What mutators do when they run the posted handshake.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone, NoUninit)]
enum HandshakeKind {
    /// Nothing: passing a safepoint is the point. The thread has seen the
    /// current marking phase and finished any barrier it was in.
    Sync,
    /// Shade everything the thread's stack refers to.
    ScanRoots,
}

/// An on-the-fly mark-sweep collector.
///
/// Marking runs on background marker threads while mutators keep running.
/// The write barrier shades both the overwritten and the stored reference
/// while marking (*snooping*); two handshakes turn snooping on and collect
/// the roots of every thread; the markers trace the gray objects queued on
/// every thread and steal from each other. A separate sweeper thread frees
/// the objects of the reclaim color while the next cycle's requests pile up.
pub struct ConcurrentMSCollector {
    context: Arc<GcContext>,
    sfl: SegregatedFreeList,
    marks: Arc<MarkState>,
    barrier: ConcurrentMarkBarrier,
    requester: CycleRequester,
    monitor: MarkerMonitor,
    /// The shared gray queue of each marker.
    marker_queues: Vec<ThreadHeaderQueue>,
    handshake: Atomic<HandshakeKind>,
    allocated_since_request: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ConcurrentMSCollector {
    /// Create the collector and start its marker and sweeper threads.
    pub fn new(context: Arc<GcContext>) -> Arc<Self> {
        let markers = context.options.concurrent_marker_threads;
        let marks = Arc::new(MarkState::new());
        let collector = Arc::new(ConcurrentMSCollector {
            sfl: SegregatedFreeList::new(context.pages.clone(), PageType::Owner(0)),
            barrier: ConcurrentMarkBarrier::new(marks.clone()),
            marks,
            requester: CycleRequester::new(),
            monitor: MarkerMonitor::new(markers),
            marker_queues: (0..markers).map(|_| ThreadHeaderQueue::new()).collect(),
            handshake: Atomic::new(HandshakeKind::Sync),
            allocated_since_request: AtomicUsize::new(0),
            threads: Mutex::new(vec![]),
            context,
        });
        let mut handles = vec![];
        for ordinal in 0..markers {
            let c = collector.clone();
            handles.push(spawn(format!("rtgc-marker-{}", ordinal), move || {
                if ordinal == 0 {
                    c.run_marker_controller()
                } else {
                    c.run_marker_helper(ordinal)
                }
            }));
        }
        let c = collector.clone();
        handles.push(spawn("rtgc-sweeper".to_string(), move || c.run_sweeper()));
        *collector.threads.lock().unwrap_or_else(|e| e.into_inner()) = handles;
        collector
    }

    pub fn mark_state(&self) -> &MarkState {
        &self.marks
    }

    /// Cycles completed so far, sweep included.
    pub fn cycles(&self) -> usize {
        self.requester.completed()
    }

    /// Ask for a cycle without waiting for it. Returns its number.
    pub fn request_cycle(&self) -> usize {
        self.requester.request()
    }

    /// Block until cycle `cycle` is swept. `thread` is dormant meanwhile.
    pub fn wait_for_cycle(&self, thread: Option<&ThreadContext>, cycle: usize) {
        match thread {
            Some(t) => {
                self.context.threads.enter_dormant(t);
                self.requester.wait_for(cycle);
                self.context.threads.leave_dormant(t);
            }
            None => self.requester.wait_for(cycle),
        }
    }

    /// Post a handshake of `kind` and wait until every mutator has run it.
    fn handshake(&self, kind: HandshakeKind) {
        self.handshake.store(kind, Ordering::SeqCst);
        self.context
            .threads
            .handshake(None, &|t| self.handshake_action(t));
        debug!("handshake {:?} done", kind);
    }

    fn handshake_action(&self, thread: &ThreadContext) {
        match self.handshake.load(Ordering::SeqCst) {
            HandshakeKind::Sync => {}
            HandshakeKind::ScanRoots => {
                let context = &self.context;
                context.scan_thread_slots(thread, &mut |slot| {
                    let value = unsafe { slot.load::<Address>() };
                    if let Some(object) = context.resolve(value) {
                        self.marks.shade(object, &thread.gray_queue);
                    }
                });
            }
        }
    }

    /// Static roots and objects waiting for finalization.
    fn shade_global_roots(&self) {
        let context = &self.context;
        let queue = &self.marker_queues[0];
        context.scan_static_slots(&mut |slot| {
            let value = unsafe { slot.load::<Address>() };
            if let Some(object) = context.resolve(value) {
                self.marks.shade(object, queue);
            }
        });
        context.references.scan_ready(|object| {
            self.marks.shade(object, queue);
            object
        });
    }

    fn run_marker_controller(&self) {
        while let Some(cycle) = self.requester.wait_for_request() {
            self.mark_cycle(cycle);
        }
        debug!("marker controller exits");
    }

    fn run_marker_helper(&self, ordinal: usize) {
        let mut local = MarkStack::new();
        let mut seen = 0;
        while let Some(round) = self.monitor.wait_for_round(seen) {
            seen = round;
            self.trace_round(ordinal, round, &mut local);
        }
        debug!("marker {} exits", ordinal);
    }

    fn mark_cycle(&self, cycle: usize) {
        let started = Instant::now();
        let marks = &self.marks;
        info!("concurrent cycle {} starts", cycle);
        marks.set_phase(Phase::Requested);
        marks.start_cycle();
        marks.set_phase(Phase::ComputingRoots);
        self.handshake(HandshakeKind::Sync);
        self.shade_global_roots();
        self.handshake(HandshakeKind::ScanRoots);

        marks.set_phase(Phase::Tracing);
        self.trace();
        let mut tracer = ColorTracer { collector: self };
        self.context.references.process(&mut tracer);
        // Objects the weak handles were cleared for may have been loaded
        // (and shaded) meanwhile.
        self.trace();

        marks.set_phase(Phase::Idle);
        self.handshake(HandshakeKind::Sync);
        marks.rotate();
        for queue in &self.marker_queues {
            queue.reset();
        }
        for thread in self.context.threads.snapshot() {
            thread.gray_queue.reset();
        }
        debug!("cycle {} marked in {:?}", cycle, started.elapsed());
        self.requester.marking_finished(started);
    }

    /// Run a trace round on the calling marker (marker 0) and every helper.
    fn trace(&self) {
        let round = self.monitor.start_round();
        let mut local = MarkStack::new();
        self.trace_round(0, round, &mut local);
    }

    fn trace_round(&self, ordinal: usize, round: usize, local: &mut MarkStack) {
        loop {
            self.drain(ordinal, local);
            let over = self.monitor.park_and_wait(ordinal, round, || {
                // Barriers in flight finish before the threads pass a safepoint.
                self.handshake(HandshakeKind::Sync);
                if self.all_queues_empty() {
                    LastParkedResult::Terminate
                } else {
                    LastParkedResult::WakeAll
                }
            });
            if over {
                return;
            }
        }
    }

    fn drain(&self, ordinal: usize, local: &mut MarkStack) {
        let shared = &self.marker_queues[ordinal];
        loop {
            while let Some(object) = local.pop() {
                self.scan_gray(object, local);
                // Let idle markers steal the overflow.
                if local.is_full() {
                    for o in local.take() {
                        shared.push(o);
                    }
                }
            }
            if !self.refill(ordinal, local) {
                return;
            }
        }
    }

    /// Take a batch of gray objects: own queue first, then the mutators',
    /// then the other markers'.
    fn refill(&self, ordinal: usize, local: &mut MarkStack) -> bool {
        let threads = self.context.threads.snapshot();
        let sources = std::iter::once(&self.marker_queues[ordinal])
            .chain(threads.iter().map(|t| &t.gray_queue))
            .chain(
                self.marker_queues
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != ordinal)
                    .map(|(_, q)| q),
            );
        for queue in sources {
            let batch = queue.take_all();
            if !batch.is_empty() {
                trace!("marker {} takes {} gray objects", ordinal, batch.len());
                batch.into_iter().for_each(|o| local.push(o));
                return true;
            }
        }
        false
    }

    fn scan_gray(&self, object: ObjectReference, local: &mut MarkStack) {
        visit_reference_fields(
            &mut NonNullFilter(&mut |slot: Address| {
                let child = object_model::load_reference(slot);
                if !child.is_null() && self.marks.try_shade(child) {
                    local.push(child);
                }
            }),
            object,
        );
    }

    fn all_queues_empty(&self) -> bool {
        self.marker_queues.iter().all(|q| q.is_empty())
            && self
                .context
                .threads
                .snapshot()
                .iter()
                .all(|t| t.gray_queue.is_empty())
    }

    fn run_sweeper(&self) {
        while let Some(started) = self.requester.wait_for_sweep() {
            self.marks.set_phase(Phase::Reclaiming);
            let reclaim = self.marks.reclaim();
            let swept = self
                .sfl
                .sweep(|object| object_model::color(object) != reclaim);
            let freed = self.sfl.commit_freed_data();
            let released = self.sfl.recycle_global_pages();
            self.marks.set_phase(Phase::Idle);
            debug!("swept {} objects of color {}", swept, reclaim);
            self.context
                .stats
                .record(CollectionKind::ConcurrentCycle, started, freed, released);
            if self.context.options.verify_after_gc || cfg!(feature = "extreme_assertions") {
                self.check_colors();
            }
            self.context.run_profiler(false);
            self.requester.sweep_finished();
        }
        debug!("sweeper exits");
    }

    /// No object outside a sweep may have the reclaim color.
    fn check_colors(&self) {
        let reclaim = self.marks.reclaim();
        walker::walk_heap(&self.context.pages, &mut |object| {
            let color = object_model::color(object);
            assert!(
                color != reclaim && color != 0,
                "{} has color {} after the sweep of color {}",
                object,
                color,
                reclaim
            );
        });
    }
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .unwrap_or_else(|e| panic!("cannot start collector thread {}: {}", name, e))
}

/// Weak-handle and finalization processing during marking.
struct ColorTracer<'a> {
    collector: &'a ConcurrentMSCollector,
}

impl ObjectTracer for ColorTracer<'_> {
    fn live_location(&self, object: ObjectReference) -> Option<ObjectReference> {
        self.collector.marks.is_live(object).then_some(object)
    }

    fn trace_object(&mut self, object: ObjectReference) -> ObjectReference {
        self.collector
            .marks
            .shade(object, &self.collector.marker_queues[0]);
        object
    }

    fn complete_closure(&mut self) {
        self.collector.trace();
    }
}

impl Collector for ConcurrentMSCollector {
    fn context(&self) -> &GcContext {
        &self.context
    }

    fn new_thread_state(&self, thread: u16) -> MutatorAllocState {
        MutatorAllocState::FreeList(LocalFreeLists::new(thread))
    }

    fn dead_thread(&self, thread: &ThreadContext) {
        self.sfl.flush_local(thread.alloc.borrow_mut().free_lists());
        self.marker_queues[0].steal_from(&thread.gray_queue);
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
        let since = self.allocated_since_request.fetch_add(size, Ordering::Relaxed) + size;
        if since > self.context.options.concurrent_trigger_bytes {
            self.allocated_since_request.store(0, Ordering::Relaxed);
            self.requester.request();
        }
        Ok(start)
    }

    fn initialize_header(&self, object: ObjectReference, ty: &'static TypeDescriptor) {
        object_model::initialize_header(object, ty, self.marks.alloc_color());
    }

    fn collect(&self, thread: Option<&ThreadContext>, _generation: u8) {
        let cycle = self.requester.request();
        self.wait_for_cycle(thread, cycle);
    }

    fn collect_generation(&self, generation: u8) {
        self.collect(None, generation)
    }

    fn check_for_needed_gc_work(&self, thread: &ThreadContext) {
        self.context
            .threads
            .run_pending_handshake(thread, &|t| self.handshake_action(t));
    }

    fn write_barrier(&self) -> &dyn WriteBarrier {
        &self.barrier
    }

    fn phase(&self) -> Phase {
        self.marks.phase()
    }

    fn allocated_bytes(&self) -> usize {
        self.sfl.total_bytes()
    }

    fn verify_heap(&self) {
        self.requester.wait_idle();
        crate::plan::verify::verify_heap(&self.context);
        self.check_colors();
    }

    fn shutdown(&self) {
        self.requester.shutdown();
        self.monitor.shutdown();
        let handles = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if handle.join().is_err() {
                error!("a collector thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::Options;
    use crate::util::test_util::fixtures::*;
    use crate::util::test_util::panic_after;

    fn collector(markers: usize) -> (Arc<ConcurrentMSCollector>, Arc<ThreadContext>) {
        let mut options = Options::builtin();
        options.heap_size = 256 * crate::util::constants::BYTES_IN_PAGE;
        options.concurrent_marker_threads = markers;
        options.verify_after_gc = true;
        let context = Arc::new(GcContext::new(options).unwrap());
        let collector = ConcurrentMSCollector::new(context.clone());
        let thread = context
            .threads
            .register(|i| ThreadContext::new(i, collector.new_thread_state(i)))
            .unwrap();
        (collector, thread)
    }

    fn alloc_node(collector: &ConcurrentMSCollector, thread: &ThreadContext) -> ObjectReference {
        let start = collector.allocate_object_memory(thread, 24, 8).unwrap();
        let object = ObjectReference::from_object_start(start);
        collector.initialize_header(object, &NODE);
        object
    }

    fn cycle_frees_garbage(markers: usize) {
        panic_after(20000, move || {
            let (collector, thread) = collector(markers);
            let slot = Address::from_mut_ptr(Box::leak(Box::new(0usize)) as *mut usize);
            collector.context().statics.add_area(slot, 1);
            // A list of 50 nodes hangs off the static root.
            let mut head = ObjectReference::NULL;
            for _ in 0..50 {
                let node = alloc_node(&collector, &thread);
                set_field(node, 1, head);
                head = node;
            }
            object_model::store_reference(slot, head);
            for _ in 0..100 {
                alloc_node(&collector, &thread);
            }
            assert_eq!(collector.allocated_bytes(), 150 * 24);
            collector.collect(Some(&thread), 0);
            assert_eq!(collector.cycles(), 1);
            assert_eq!(collector.allocated_bytes(), 50 * 24);
            // Survivors are unmarked for the next cycle.
            assert!(!collector.mark_state().is_live(head));

            object_model::store_reference(slot, ObjectReference::NULL);
            collector.collect(Some(&thread), 0);
            assert_eq!(collector.allocated_bytes(), 0);
            collector.verify_heap();
            collector.shutdown();
        })
    }

    #[test]
    fn one_marker() {
        cycle_frees_garbage(1)
    }

    #[test]
    fn three_markers() {
        cycle_frees_garbage(3)
    }

    #[test]
    fn objects_allocated_during_marking_survive() {
        let (collector, thread) = collector(1);
        collector.mark_state().start_cycle();
        let object = alloc_node(&collector, &thread);
        assert!(collector.mark_state().is_live(object));
        collector.mark_state().rotate();
        assert!(!collector.mark_state().is_live(object));
        assert_ne!(object_model::color(object), collector.mark_state().reclaim());
        collector.shutdown();
    }
}
